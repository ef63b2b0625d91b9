use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::cache::CachePolicy;
use crate::image_display::ImageLimits;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("could not parse configuration: {0}")]
    Parse(String),
}

/// Partial cache policy; absent fields keep the cache's own defaults and an
/// explicit `null` floor switches the cache to age-only sweeps.
#[derive(Debug, Deserialize)]
struct CachePolicyOverride {
    capacity: Option<usize>,
    idle_ttl_ms: Option<u64>,
    #[serde(default, deserialize_with = "present_option")]
    min_access_to_survive_sweep: Option<Option<u32>>,
}

impl CachePolicyOverride {
    fn apply(self, base: CachePolicy) -> CachePolicy {
        CachePolicy::new(
            self.capacity.unwrap_or(base.capacity),
            self.idle_ttl_ms.unwrap_or(base.idle_ttl_ms),
            self.min_access_to_survive_sweep
                .unwrap_or(base.min_access_to_survive_sweep),
        )
    }
}

fn present_option<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u32>::deserialize(deserializer).map(Some)
}

fn image_policy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CachePolicy, D::Error> {
    CachePolicyOverride::deserialize(deserializer).map(|o| o.apply(CachePolicy::images()))
}

fn document_policy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CachePolicy, D::Error> {
    CachePolicyOverride::deserialize(deserializer).map(|o| o.apply(CachePolicy::documents()))
}

fn page_policy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CachePolicy, D::Error> {
    CachePolicyOverride::deserialize(deserializer)
        .map(|o| o.apply(CachePolicy::rendered_pages()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub dataset_path: String,
    pub image_base: String,
    pub solution_base: String,

    #[serde(deserialize_with = "image_policy")]
    pub image_cache: CachePolicy,
    #[serde(deserialize_with = "document_policy")]
    pub document_cache: CachePolicy,
    #[serde(deserialize_with = "page_policy")]
    pub page_cache: CachePolicy,

    pub dataset_retry: RetryPolicy,
    pub probe_retry: RetryPolicy,
    pub document_retry: RetryPolicy,

    pub pdf_load_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub image_limits: ImageLimits,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            dataset_path: "data/problems.csv".into(),
            image_base: "images".into(),
            solution_base: "solutions".into(),
            image_cache: CachePolicy::images(),
            document_cache: CachePolicy::documents(),
            page_cache: CachePolicy::rendered_pages(),
            dataset_retry: RetryPolicy::new(3, 1_000),
            probe_retry: RetryPolicy::new(3, 500),
            document_retry: RetryPolicy::new(2, 1_000),
            pdf_load_timeout_ms: 15_000,
            sweep_interval_ms: 5 * 60 * 1000,
            image_limits: ImageLimits::default(),
        }
    }
}

impl ViewerConfig {
    /// Parses JSON on top of the defaults and validates the result.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("dataset_path", &self.dataset_path),
            ("image_base", &self.image_base),
            ("solution_base", &self.solution_base),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{name} must not be empty")));
            }
        }
        for (name, policy) in [
            ("image_cache", &self.image_cache),
            ("document_cache", &self.document_cache),
            ("page_cache", &self.page_cache),
        ] {
            if policy.capacity == 0 {
                return Err(ConfigError::Validation(format!(
                    "{name}.capacity must be > 0"
                )));
            }
        }
        for (name, policy) in [
            ("dataset_retry", &self.dataset_retry),
            ("probe_retry", &self.probe_retry),
            ("document_retry", &self.document_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "{name}.max_attempts must be > 0"
                )));
            }
        }
        if self.pdf_load_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "pdf_load_timeout_ms must be > 0".into(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Validation("sweep_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn pdf_load_timeout(&self) -> Duration {
        Duration::from_millis(self.pdf_load_timeout_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
