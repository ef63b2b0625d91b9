use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, instrument};

use crate::capabilities::{fetch_bytes, HttpClient, ResourcePath};
use crate::catalog::{LoadReport, ProblemCatalog};
use crate::retry::{RetryPolicy, RetryingFetcher};
use crate::{ViewerError, ViewerResult};

/// Parses delimited text into trimmed string rows. No header is assumed and
/// rows may have differing widths; blank lines are skipped.
pub fn parse_rows(data: &[u8], resource: &str) -> ViewerResult<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ViewerError::corrupt(resource, e.to_string()))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Fetches the dataset file and loads it into a catalog.
pub struct DatasetLoader {
    http: Arc<dyn HttpClient>,
    retry: RetryingFetcher,
    policy: RetryPolicy,
}

impl DatasetLoader {
    pub fn new(http: Arc<dyn HttpClient>, retry: RetryingFetcher, policy: RetryPolicy) -> Self {
        Self {
            http,
            retry,
            policy,
        }
    }

    pub async fn fetch_rows(&self, path: &ResourcePath) -> ViewerResult<Vec<Vec<String>>> {
        let http = Arc::clone(&self.http);
        let body: Bytes = self
            .retry
            .run("dataset load", &self.policy, || {
                let http = Arc::clone(&http);
                let path = path.clone();
                async move { fetch_bytes(http.as_ref(), &path).await }
            })
            .await?;
        parse_rows(&body, path.as_str())
    }

    /// On failure the catalog keeps whatever it held before.
    #[instrument(skip(self, catalog), fields(path = %path))]
    pub async fn load_into(
        &self,
        path: &ResourcePath,
        catalog: &mut ProblemCatalog,
    ) -> ViewerResult<LoadReport> {
        let rows = self.fetch_rows(path).await?;
        let report = catalog.load(&rows)?;
        info!(
            accepted = report.accepted,
            rejected = report.rejected.len(),
            "dataset loaded"
        );
        Ok(report)
    }
}
