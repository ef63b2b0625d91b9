use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStats, SweepTask};
use crate::capabilities::{Capabilities, RenderedPage, ResourcePath};
use crate::catalog::{CatalogStatistics, LoadReport, ProblemCatalog};
use crate::config::{ConfigError, ViewerConfig};
use crate::image_display::{ImageDisplayController, ImageOutcome};
use crate::model::ProblemIdentity;
use crate::pager::{NavigationStatus, PageKey, PdfPager};
use crate::retry::RetryingFetcher;
use crate::rows::DatasetLoader;
use crate::state::{SelectionObserver, SelectionState, SubscriptionId};
use crate::{ViewerError, ViewerResult};

/// An image load that has been started against a specific problem.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    problem: Arc<ProblemIdentity>,
    path: ResourcePath,
    ticket: u64,
}

impl ImageRequest {
    pub fn problem(&self) -> &ProblemIdentity {
        &self.problem
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }
}

pub struct ExamViewer {
    config: ViewerConfig,
    catalog: ProblemCatalog,
    state: SelectionState,
    dataset: DatasetLoader,
    images: ImageDisplayController,
    pager: PdfPager,
    maintenance: Vec<SweepTask>,
    /// Ticket of the most recent image request handed out.
    image_ticket: u64,
}

impl std::fmt::Debug for ExamViewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExamViewer")
            .field("state", &self.state)
            .field("pager", &self.pager)
            .field("maintenance_tasks", &self.maintenance.len())
            .finish_non_exhaustive()
    }
}

impl ExamViewer {
    pub fn new(caps: &Capabilities, config: ViewerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let dataset = DatasetLoader::new(
            Arc::clone(&caps.http),
            RetryingFetcher::new(Arc::clone(&caps.connectivity)),
            config.dataset_retry,
        );
        let images = ImageDisplayController::new(
            caps,
            config.image_cache,
            config.probe_retry,
            config.image_limits,
        );
        let pager = PdfPager::new(caps, &config);
        Ok(Self {
            config,
            catalog: ProblemCatalog::new(),
            state: SelectionState::new(),
            dataset,
            images,
            pager,
            maintenance: Vec::new(),
            image_ticket: 0,
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ProblemCatalog {
        &self.catalog
    }

    pub fn statistics(&self) -> CatalogStatistics {
        self.catalog.statistics()
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn subscribe(&mut self, observer: impl SelectionObserver + 'static) -> SubscriptionId {
        self.state.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub fn images(&self) -> &ImageDisplayController {
        &self.images
    }

    pub fn pager(&self) -> &PdfPager {
        &self.pager
    }

    // --- dataset -----------------------------------------------------------

    /// Fetches and loads the dataset. On success the selection starts over;
    /// on failure the previous catalog stays in place.
    #[instrument(skip(self))]
    pub async fn load_catalog(&mut self) -> ViewerResult<LoadReport> {
        self.state.set_loading(true);
        let result = match ResourcePath::new(self.config.dataset_path.clone()) {
            Ok(path) => self.dataset.load_into(&path, &mut self.catalog).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => {
                self.state.reset();
                self.release_selection_resources().await;
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "catalog load failed");
                self.state.set_loading(false);
                self.state.set_error_message(Some(&e.user_facing_message()));
                Err(e)
            }
        }
    }

    // --- dropdown options ----------------------------------------------------

    pub fn year_options(&self) -> Vec<String> {
        self.catalog.years()
    }

    pub fn month_options(&self) -> Vec<String> {
        self.state
            .selected_year()
            .map(|year| self.catalog.months_for(year))
            .unwrap_or_default()
    }

    pub fn question_options(&self) -> Vec<String> {
        match (self.state.selected_year(), self.state.selected_month()) {
            (Some(year), Some(month)) => self.catalog.questions_for(year, month),
            _ => Vec::new(),
        }
    }

    // --- selection -------------------------------------------------------------

    pub async fn select_year(&mut self, year: Option<&str>) -> ViewerResult<()> {
        if let Some(year) = year {
            if !self.year_options().iter().any(|y| y == year) {
                return Err(ViewerError::validation(format!("unknown year '{year}'")));
            }
        }
        self.state.set_year(year);
        self.release_selection_resources().await;
        Ok(())
    }

    pub async fn select_month(&mut self, month: Option<&str>) -> ViewerResult<()> {
        if let Some(month) = month {
            if !self.month_options().iter().any(|m| m == month) {
                return Err(ViewerError::validation(format!(
                    "month '{month}' is not available for the selected year"
                )));
            }
        }
        self.state.set_month(month);
        self.release_selection_resources().await;
        Ok(())
    }

    /// Completing the triple installs a freshly built current problem, so
    /// picking the same question again still counts as a new selection.
    pub async fn select_question(&mut self, question: Option<&str>) -> ViewerResult<()> {
        let Some(question) = question else {
            self.state.set_question(None);
            self.release_selection_resources().await;
            return Ok(());
        };
        if !self.question_options().iter().any(|q| q == question) {
            return Err(ViewerError::validation(format!(
                "question '{question}' is not available for the selected month"
            )));
        }

        self.state.set_question(Some(question));
        if let (Some(year), Some(month)) = (self.state.selected_year(), self.state.selected_month())
        {
            let identity = ProblemIdentity::new(year, month, question)?;
            debug!(problem = %identity, "problem selected");
            self.state.set_current_problem(Some(Arc::new(identity)));
            self.images.clear_display().await;
        }
        self.release_selection_resources().await;
        Ok(())
    }

    /// Drops what belonged to a problem or solution that is no longer shown.
    async fn release_selection_resources(&mut self) {
        if self.state.current_problem().is_none() {
            self.images.clear_display().await;
        }
        if !self.state.is_solution_visible() && self.pager.active_path().is_some() {
            self.pager.close();
        }
    }

    // --- problem image -----------------------------------------------------------

    /// Marks the state as loading and returns the request to run, or `None`
    /// when no problem is selected.
    pub fn begin_image_load(&mut self) -> ViewerResult<Option<ImageRequest>> {
        let Some(problem) = self.state.current_problem().cloned() else {
            return Ok(None);
        };
        let path = ResourcePath::new(problem.image_path(&self.config.image_base))?;
        self.image_ticket += 1;
        self.state.set_loading(true);
        Ok(Some(ImageRequest {
            problem,
            path,
            ticket: self.image_ticket,
        }))
    }

    /// Applies a finished load unless the selection has moved on, in which
    /// case the outcome is reported as superseded. The loading flag is left
    /// to a newer request when one has been issued.
    pub fn finish_image_load(
        &mut self,
        request: &ImageRequest,
        result: ViewerResult<ImageOutcome>,
    ) -> ViewerResult<ImageOutcome> {
        let still_current = self
            .state
            .current_problem()
            .is_some_and(|current| Arc::ptr_eq(current, &request.problem));
        if !still_current {
            debug!(problem = %request.problem, "discarding image for stale selection");
            if request.ticket == self.image_ticket {
                self.state.set_loading(false);
            }
            return Ok(ImageOutcome::Superseded);
        }

        match result {
            Ok(ImageOutcome::Superseded) => Ok(ImageOutcome::Superseded),
            Ok(outcome) => {
                self.state.set_loading(false);
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, path = %request.path, "image load failed");
                self.state.set_loading(false);
                self.state.set_error_message(Some(&e.user_facing_message()));
                Err(e)
            }
        }
    }

    pub async fn load_current_image(&mut self) -> ViewerResult<Option<ImageOutcome>> {
        let Some(request) = self.begin_image_load()? else {
            return Ok(None);
        };
        let result = self.images.load(&request.path).await;
        self.finish_image_load(&request, result).map(Some)
    }

    // --- solution ------------------------------------------------------------------

    pub async fn toggle_solution(&mut self) -> ViewerResult<()> {
        if self.state.is_solution_visible() {
            self.hide_solution();
            Ok(())
        } else {
            self.show_solution().await
        }
    }

    #[instrument(skip(self))]
    pub async fn show_solution(&mut self) -> ViewerResult<()> {
        let Some(problem) = self.state.current_problem().cloned() else {
            return Err(ViewerError::validation("no problem is selected"));
        };
        let path = ResourcePath::new(problem.solution_path(&self.config.solution_base))?;

        self.state.set_solution_visible(true);
        self.state.set_pdf_loading(true);
        let result = self.pager.load(&path).await;
        self.state.set_pdf_loading(false);
        match result {
            Ok(()) => {
                info!(problem = %problem, pages = self.pager.total_pages(), "solution shown");
                Ok(())
            }
            Err(e) => {
                self.state.set_pdf_error(Some(&e.user_facing_message()));
                Err(e)
            }
        }
    }

    pub fn hide_solution(&mut self) {
        self.state.set_solution_visible(false);
        self.pager.close();
    }

    // --- pager passthroughs ------------------------------------------------------

    pub fn navigation_status(&self) -> NavigationStatus {
        self.pager.navigation_status()
    }

    pub async fn next_page(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.pager.next_page().await
    }

    pub async fn previous_page(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.pager.previous_page().await
    }

    pub async fn go_to_page(&mut self, page: u32) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.pager.go_to(page).await
    }

    pub async fn zoom_in(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.pager.zoom_in().await
    }

    pub async fn zoom_out(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.pager.zoom_out().await
    }

    pub async fn set_zoom(&mut self, scale: f32) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.pager.set_zoom(scale).await
    }

    // --- maintenance ---------------------------------------------------------------

    /// Starts periodic sweeps of every cache. Must run inside a tokio runtime.
    pub fn start_maintenance(&mut self) {
        if !self.maintenance.is_empty() {
            return;
        }
        let interval = self.config.sweep_interval();
        self.maintenance.push(self.images.start_sweeping(interval));
        self.maintenance.extend(self.pager.start_sweeping(interval));
        info!(tasks = self.maintenance.len(), "cache maintenance started");
    }

    pub fn maintenance_running(&self) -> bool {
        self.maintenance.iter().any(|task| !task.is_finished())
    }

    /// Sweeps every cache now. Returns the number of entries removed.
    pub async fn on_memory_pressure(&self) -> usize {
        let removed = self.images.on_memory_pressure().await + self.pager.on_memory_pressure().await;
        info!(removed, "memory pressure sweep");
        removed
    }

    pub async fn image_cache_stats(&self) -> CacheStats<String> {
        self.images.stats().await
    }

    pub async fn document_cache_stats(&self) -> CacheStats<String> {
        self.pager.document_stats().await
    }

    pub async fn page_cache_stats(&self) -> CacheStats<PageKey> {
        self.pager.page_stats().await
    }

    /// Stops maintenance, closes the pager and empties every cache.
    pub async fn teardown(&mut self) {
        for task in self.maintenance.drain(..) {
            task.stop();
        }
        self.images.teardown().await;
        self.pager.teardown().await;
        info!("viewer torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{MockHttp, MockPdfEngine};
    use crate::event::{Property, StateChange};
    use crate::image_display::tests::create_test_png;
    use crate::state::{ObserverError, SelectionSnapshot};
    use crate::ErrorKind;
    use std::sync::Mutex;

    const DATASET: &str = "2022,6,1\n2022,6,2\n2022,11,1\n2021,3,7\n";

    fn viewer() -> (ExamViewer, Arc<MockHttp>) {
        let http = Arc::new(MockHttp::new());
        http.serve("data/problems.csv", 200, DATASET);
        let caps = Capabilities::new(http.clone(), Arc::new(MockPdfEngine::new()));
        let config = ViewerConfig {
            probe_retry: crate::RetryPolicy::new(2, 10).with_jitter(0),
            ..ViewerConfig::default()
        };
        (ExamViewer::new(&caps, config).unwrap(), http)
    }

    async fn select(viewer: &mut ExamViewer, y: &str, m: &str, q: &str) {
        viewer.select_year(Some(y)).await.unwrap();
        viewer.select_month(Some(m)).await.unwrap();
        viewer.select_question(Some(q)).await.unwrap();
    }

    #[tokio::test]
    async fn options_follow_the_selection() {
        let (mut viewer, _) = viewer();
        viewer.load_catalog().await.unwrap();

        assert_eq!(viewer.year_options(), vec!["2022", "2021"]);
        assert!(viewer.month_options().is_empty());

        viewer.select_year(Some("2022")).await.unwrap();
        assert_eq!(viewer.month_options(), vec!["6", "11"]);
        assert!(viewer.question_options().is_empty());

        viewer.select_month(Some("6")).await.unwrap();
        assert_eq!(viewer.question_options(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn unknown_values_are_rejected_without_mutation() {
        let (mut viewer, _) = viewer();
        viewer.load_catalog().await.unwrap();

        let err = viewer.select_year(Some("1999")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(viewer.state().selected_year(), None);

        viewer.select_year(Some("2021")).await.unwrap();
        assert!(viewer.select_month(Some("6")).await.is_err());
        assert_eq!(viewer.state().selected_month(), None);
    }

    #[tokio::test]
    async fn selecting_a_question_does_not_fetch() {
        let (mut viewer, http) = viewer();
        http.serve("images/20220601.png", 200, create_test_png(2, 2));
        http.serve("solutions/20220601.pdf", 200, MockPdfEngine::pdf_bytes(2));
        viewer.load_catalog().await.unwrap();
        let before = http.requests().len();

        select(&mut viewer, "2022", "6", "1").await;

        assert_eq!(http.requests().len(), before);
        assert_eq!(viewer.image_cache_stats().await.size, 0);
        assert_eq!(viewer.document_cache_stats().await.size, 0);
        assert_eq!(viewer.page_cache_stats().await.size, 0);
        assert!(!viewer.state().is_loading());
        assert!(!viewer.state().is_pdf_loading());
        let problem = viewer.state().current_problem().unwrap();
        assert_eq!(problem.image_path("images"), "images/20220601.png");
    }

    #[tokio::test]
    async fn reselecting_same_question_renotifies_current_problem() {
        let (mut viewer, _) = viewer();
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "1").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        viewer.subscribe(
            move |change: &StateChange, _: &SelectionSnapshot| -> Result<(), ObserverError> {
                sink.lock().unwrap().push(change.property());
                Ok(())
            },
        );

        viewer.select_question(Some("1")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Property::CurrentProblem]);
    }

    #[tokio::test]
    async fn image_load_clears_loading_flag() {
        let (mut viewer, http) = viewer();
        http.serve("images/20220601.png", 200, create_test_png(2, 2));
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "1").await;

        let outcome = viewer.load_current_image().await.unwrap().unwrap();

        assert!(matches!(outcome, ImageOutcome::Displayed(_)));
        assert!(!viewer.state().is_loading());
        assert_eq!(viewer.state().error_message(), None);
    }

    #[tokio::test]
    async fn missing_image_sets_error_message() {
        let (mut viewer, _) = viewer();
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "2").await;

        let err = viewer.load_current_image().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!viewer.state().is_loading());
        assert_eq!(
            viewer.state().error_message(),
            Some("The requested file could not be found.")
        );
    }

    #[tokio::test]
    async fn late_image_for_previous_selection_is_discarded() {
        let (mut viewer, http) = viewer();
        http.serve("images/20220601.png", 200, create_test_png(2, 2));
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "1").await;

        let request = viewer.begin_image_load().unwrap().unwrap();
        let result = viewer.images().load(request.path()).await;
        viewer.select_question(Some("2")).await.unwrap();
        let newer = viewer.begin_image_load().unwrap().unwrap();
        assert_eq!(newer.path().as_str(), "images/20220602.png");

        let outcome = viewer.finish_image_load(&request, result).unwrap();
        assert_eq!(outcome, ImageOutcome::Superseded);
        assert!(viewer.state().is_loading(), "newer request owns the flag");
    }

    #[tokio::test]
    async fn late_image_after_clearing_selection_stops_loading() {
        let (mut viewer, http) = viewer();
        http.serve("images/20220601.png", 200, create_test_png(2, 2));
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "1").await;

        let request = viewer.begin_image_load().unwrap().unwrap();
        let result = viewer.images().load(request.path()).await;
        viewer.select_year(Some("2021")).await.unwrap();
        assert!(viewer.state().current_problem().is_none());

        let outcome = viewer.finish_image_load(&request, result).unwrap();
        assert_eq!(outcome, ImageOutcome::Superseded);
        assert!(!viewer.state().is_loading());
        assert!(viewer.images().displayed().await.is_none());
    }

    #[tokio::test]
    async fn late_image_without_newer_request_stops_loading() {
        let (mut viewer, http) = viewer();
        http.serve("images/20220601.png", 200, create_test_png(2, 2));
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "1").await;

        let request = viewer.begin_image_load().unwrap().unwrap();
        let result = viewer.images().load(request.path()).await;
        viewer.select_question(Some("2")).await.unwrap();

        let outcome = viewer.finish_image_load(&request, result).unwrap();
        assert_eq!(outcome, ImageOutcome::Superseded);
        assert!(!viewer.state().is_loading());
    }

    #[tokio::test]
    async fn changing_year_hides_solution_and_closes_pager() {
        let (mut viewer, http) = viewer();
        http.serve("solutions/20220601.pdf", 200, MockPdfEngine::pdf_bytes(2));
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "6", "1").await;

        viewer.toggle_solution().await.unwrap();
        assert!(viewer.state().is_solution_visible());
        assert!(!viewer.state().is_pdf_loading());
        assert_eq!(viewer.navigation_status().total_pages, 2);

        viewer.select_year(Some("2021")).await.unwrap();

        let state = viewer.state();
        assert_eq!(state.selected_month(), None);
        assert_eq!(state.selected_question(), None);
        assert!(state.current_problem().is_none());
        assert!(!state.is_solution_visible());
        assert_eq!(viewer.pager().active_path(), None);
    }

    #[tokio::test]
    async fn missing_solution_sets_pdf_error() {
        let (mut viewer, _) = viewer();
        viewer.load_catalog().await.unwrap();
        select(&mut viewer, "2022", "11", "1").await;

        let err = viewer.show_solution().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!viewer.state().is_pdf_loading());
        assert!(viewer.state().pdf_error().is_some());

        viewer.hide_solution();
        assert_eq!(viewer.state().pdf_error(), None);
    }

    #[tokio::test]
    async fn solution_requires_a_selection() {
        let (mut viewer, _) = viewer();
        viewer.load_catalog().await.unwrap();
        let err = viewer.show_solution().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!viewer.state().is_solution_visible());
    }

    #[tokio::test]
    async fn failed_catalog_load_reports_error() {
        let http = Arc::new(MockHttp::new());
        let caps = Capabilities::new(http, Arc::new(MockPdfEngine::new()));
        let mut viewer = ExamViewer::new(&caps, ViewerConfig::default()).unwrap();

        let err = viewer.load_catalog().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!viewer.state().is_loading());
        assert!(viewer.state().error_message().is_some());
        assert!(!viewer.catalog().is_loaded());
    }

    #[tokio::test]
    async fn teardown_stops_maintenance() {
        let (mut viewer, _) = viewer();
        viewer.start_maintenance();
        assert!(viewer.maintenance_running());
        viewer.teardown().await;
        assert!(!viewer.maintenance_running());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let caps = Capabilities::new(Arc::new(MockHttp::new()), Arc::new(MockPdfEngine::new()));
        let config = ViewerConfig {
            sweep_interval_ms: 0,
            ..ViewerConfig::default()
        };
        assert!(ExamViewer::new(&caps, config).is_err());
    }
}
