// lib.rs - exam problem viewer core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod event;
pub mod image_display;
pub mod model;
pub mod pager;
pub mod retry;
pub mod rows;
pub mod state;
pub mod viewer;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

pub use cache::{CachePolicy, CacheStats, ResourceCache, SweepTask};
pub use catalog::{CatalogStatistics, LoadReport, ProblemCatalog, RowRejection};
pub use config::ViewerConfig;
pub use event::{Property, StateChange};
pub use image_display::{ImageDisplayController, ImageOutcome};
pub use model::{ProblemIdentity, ProblemRecord};
pub use pager::{NavigationStatus, PagerPhase, PdfPager};
pub use retry::{with_timeout, RetryPolicy, RetryingFetcher};
pub use state::{SelectionObserver, SelectionSnapshot, SelectionState};
pub use viewer::ExamViewer;

pub const MIN_YEAR: u16 = 2000;
pub const MAX_YEAR: u16 = 2100;
pub const MIN_MONTH: u8 = 1;
pub const MAX_MONTH: u8 = 12;
pub const MIN_QUESTION: u16 = 1;
pub const MAX_QUESTION: u16 = 999;

pub const MIN_ZOOM: f32 = 0.5;
pub const MAX_ZOOM: f32 = 3.0;
pub const DEFAULT_ZOOM: f32 = 1.0;
pub const ZOOM_IN_FACTOR: f32 = 1.25;
pub const ZOOM_OUT_FACTOR: f32 = 0.8;

pub const PDF_LOAD_TIMEOUT: Duration = Duration::from_secs(15);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const JITTER_MAX_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Server,
    Network,
    Timeout,
    CorruptResource,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::Server => "SERVER_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::CorruptResource => "CORRUPT_RESOURCE",
        }
    }

    /// Absent, forbidden, corrupt and invalid resources short-circuit the
    /// retry loop; transport failures and server errors are worth another try.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Server)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ViewerError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("dataset contains no valid problem rows ({rejected} rows rejected)")]
    EmptyDataset { rejected: usize },

    #[error("access denied: {resource}")]
    Forbidden { resource: String },

    #[error("server error {status} for {resource}")]
    Server { status: u16, resource: String },

    #[error("network problem: {message}")]
    Network { message: String },

    #[error("{operation} aborted: network is offline")]
    Offline { operation: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("corrupt or unsupported file {resource}: {reason}")]
    Corrupt { resource: String, reason: String },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: Box<ViewerError>,
    },
}

impl ViewerError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn corrupt(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } | Self::EmptyDataset { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Server { .. } => ErrorKind::Server,
            Self::Network { .. } | Self::Offline { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Corrupt { .. } => ErrorKind::CorruptResource,
            Self::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Offline is a network kind but retrying cannot help until the host
    /// reports connectivity again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Offline { .. } | Self::RetriesExhausted { .. } => false,
            other => other.kind().is_retryable(),
        }
    }

    /// Number of attempts recorded by the retry loop, if this error came out of it.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind() {
            ErrorKind::Validation => match self {
                Self::Validation { reason } => reason.clone(),
                other => other.to_string(),
            },
            ErrorKind::NotFound => {
                if matches!(self, Self::EmptyDataset { .. }) {
                    "No problems could be loaded from the dataset.".into()
                } else {
                    "The requested file could not be found.".into()
                }
            }
            ErrorKind::Forbidden => "You don't have permission to open this file.".into(),
            ErrorKind::Server => {
                "The server had a problem delivering this file. Please try again later.".into()
            }
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::CorruptResource => {
                "The file is damaged or in an unsupported format.".into()
            }
        }
    }
}

pub type ViewerResult<T> = Result<T, ViewerError>;

/// `base * 2^(attempt-1)`, capped, plus jitter. `attempt` is the 1-based
/// number of the attempt that just failed.
#[must_use]
pub fn calculate_retry_delay(base_ms: u64, attempt: u32, max_ms: u64, jitter_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let exponential = base_ms.saturating_mul(1u64 << exponent);
    let capped = exponential.min(max_ms);
    capped.saturating_add(jitter_ms)
}

#[must_use]
pub fn generate_jitter(max_ms: u64) -> u64 {
    use rand::Rng;
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

/// Source of "now" for cache timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Hand-driven clock for hosts that replay time and for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}
