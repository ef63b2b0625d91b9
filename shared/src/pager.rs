use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStats, ResourceCache, SharedCache, SizeEstimate, SweepTask};
use crate::capabilities::{
    fetch_bytes, probe, Capabilities, HttpClient, PdfDocument, PdfEngine, RenderedPage,
    ResourcePath,
};
use crate::config::ViewerConfig;
use crate::retry::{with_timeout, RetryPolicy, RetryingFetcher};
use crate::{
    ErrorKind, ViewerError, ViewerResult, DEFAULT_ZOOM, MAX_ZOOM, MIN_ZOOM, ZOOM_IN_FACTOR,
    ZOOM_OUT_FACTOR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PagerPhase {
    Idle,
    Loading,
    Ready,
    Error(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationStatus {
    pub can_go_next: bool,
    pub can_go_previous: bool,
    pub can_zoom_in: bool,
    pub can_zoom_out: bool,
    pub current_page: u32,
    pub total_pages: u32,
    pub zoom_percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub fingerprint: Arc<str>,
    pub page: u32,
    pub scale_millis: u32,
}

pub struct CachedDocument {
    path: String,
    fingerprint: Arc<str>,
    source_bytes: usize,
    document: Arc<dyn PdfDocument>,
}

impl CachedDocument {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn page_count(&self) -> u32 {
        self.document.page_count()
    }
}

impl fmt::Debug for CachedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedDocument")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .field("pages", &self.document.page_count())
            .finish()
    }
}

impl SizeEstimate for CachedDocument {
    fn estimated_bytes(&self) -> usize {
        self.source_bytes
    }
}

/// Hex blake3 digest of the document bytes.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale_millis(scale: f32) -> u32 {
    (scale * 1000.0).round() as u32
}

pub struct PdfPager {
    http: Arc<dyn HttpClient>,
    engine: Arc<dyn PdfEngine>,
    retry: RetryingFetcher,
    probe_policy: RetryPolicy,
    document_policy: RetryPolicy,
    load_timeout: Duration,

    documents: SharedCache<String, Arc<CachedDocument>>,
    pages: SharedCache<PageKey, Arc<RenderedPage>>,

    active: Option<Arc<CachedDocument>>,
    phase: PagerPhase,
    current_page: u32,
    total_pages: u32,
    scale: f32,
    rendered: Option<Arc<RenderedPage>>,
}

impl fmt::Debug for PdfPager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfPager")
            .field("phase", &self.phase)
            .field("active", &self.active.as_ref().map(|d| d.path()))
            .field("current_page", &self.current_page)
            .field("total_pages", &self.total_pages)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

impl PdfPager {
    pub fn new(caps: &Capabilities, config: &ViewerConfig) -> Self {
        let documents = ResourceCache::with_clock(
            "documents",
            config.document_cache,
            Arc::clone(&caps.clock),
        )
        .with_disposer(|path: &String, doc: Arc<CachedDocument>| {
            debug!(%path, "destroying document");
            doc.document.destroy();
        });
        let pages = ResourceCache::with_clock("pages", config.page_cache, Arc::clone(&caps.clock));

        Self {
            http: Arc::clone(&caps.http),
            engine: Arc::clone(&caps.pdf),
            retry: RetryingFetcher::new(Arc::clone(&caps.connectivity)),
            probe_policy: config.probe_retry,
            document_policy: config.document_retry,
            load_timeout: config.pdf_load_timeout(),
            documents: documents.into_shared(),
            pages: pages.into_shared(),
            active: None,
            phase: PagerPhase::Idle,
            current_page: 1,
            total_pages: 0,
            scale: DEFAULT_ZOOM,
            rendered: None,
        }
    }

    pub fn phase(&self) -> PagerPhase {
        self.phase
    }

    pub fn active_path(&self) -> Option<&str> {
        self.active.as_ref().map(|d| d.path())
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// The bitmap most recently rendered for display.
    pub fn rendered(&self) -> Option<&Arc<RenderedPage>> {
        self.rendered.as_ref()
    }

    /// Opens `path` and renders its first page.
    ///
    /// Loading the active document again does nothing. A document still in
    /// the document cache is reused without touching the network.
    /// Otherwise the path is probed first so absence surfaces as
    /// [`ErrorKind::NotFound`], then fetched and parsed under the load
    /// timeout.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn load(&mut self, path: &ResourcePath) -> ViewerResult<()> {
        if self.phase == PagerPhase::Ready && self.active_path() == Some(path.as_str()) {
            debug!("document already active");
            return Ok(());
        }
        if self.active.is_some() {
            self.close();
        }

        self.phase = PagerPhase::Loading;
        let document = match self.obtain_document(path).await {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "document load failed");
                self.phase = PagerPhase::Error(e.kind());
                return Err(e);
            }
        };

        self.total_pages = document.page_count();
        self.current_page = 1;
        self.scale = DEFAULT_ZOOM;
        self.rendered = None;
        self.active = Some(document);
        self.phase = PagerPhase::Ready;
        info!(pages = self.total_pages, "document ready");

        self.render_page(1).await?;
        Ok(())
    }

    async fn obtain_document(&self, path: &ResourcePath) -> ViewerResult<Arc<CachedDocument>> {
        let key = path.as_str().to_string();
        let cached = self.documents.lock().await.get(&key);
        if let Some(document) = cached {
            debug!("document served from cache");
            return Ok(document);
        }

        let http = self.http.as_ref();
        self.retry
            .run("pdf probe", &self.probe_policy, move || probe(http, path))
            .await?;

        let document = self
            .retry
            .run("pdf load", &self.document_policy, || {
                with_timeout(self.fetch_and_open(path), self.load_timeout, "pdf load")
            })
            .await?;

        self.documents
            .lock()
            .await
            .put(key, Arc::clone(&document));
        Ok(document)
    }

    async fn fetch_and_open(&self, path: &ResourcePath) -> ViewerResult<Arc<CachedDocument>> {
        let body: Bytes = fetch_bytes(self.http.as_ref(), path).await?;
        let fingerprint: Arc<str> = fingerprint(&body).into();
        let source_bytes = body.len();
        let document = self
            .engine
            .open(body)
            .await
            .map_err(|e| e.into_viewer_error(path.as_str()))?;
        Ok(Arc::new(CachedDocument {
            path: path.as_str().to_string(),
            fingerprint,
            source_bytes,
            document,
        }))
    }

    /// Renders page `n` at the current scale, or does nothing when no
    /// document is ready or `n` is outside `1..=total_pages`.
    #[instrument(skip(self))]
    pub async fn render_page(&mut self, n: u32) -> ViewerResult<Option<Arc<RenderedPage>>> {
        if self.phase != PagerPhase::Ready || n == 0 || n > self.total_pages {
            return Ok(None);
        }
        let Some(active) = self.active.clone() else {
            return Ok(None);
        };
        let active = self.revive(active).await?;

        let key = PageKey {
            fingerprint: Arc::clone(&active.fingerprint),
            page: n,
            scale_millis: scale_millis(self.scale),
        };
        let cached = self.pages.lock().await.get(&key);
        let page = match cached {
            Some(page) => page,
            None => {
                let page = Arc::new(
                    active
                        .document
                        .render_page(n, self.scale)
                        .await
                        .map_err(|e| e.into_viewer_error(active.path()))?,
                );
                self.pages.lock().await.put(key, Arc::clone(&page));
                page
            }
        };

        self.current_page = n;
        self.rendered = Some(Arc::clone(&page));
        Ok(Some(page))
    }

    /// Every document that leaves the cache has been destroyed, so an active
    /// document that was swept or evicted is fetched again before use.
    async fn revive(&mut self, active: Arc<CachedDocument>) -> ViewerResult<Arc<CachedDocument>> {
        let still_cached = self.documents.lock().await.contains(&active.path);
        if still_cached {
            return Ok(active);
        }
        info!(path = %active.path, "active document left the cache, reopening");
        let path = ResourcePath::new(active.path.clone())?;
        match self.obtain_document(&path).await {
            Ok(document) => {
                self.total_pages = document.page_count();
                self.active = Some(Arc::clone(&document));
                Ok(document)
            }
            Err(e) => {
                self.phase = PagerPhase::Error(e.kind());
                self.active = None;
                Err(e)
            }
        }
    }

    pub async fn next_page(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        if self.current_page >= self.total_pages {
            return Ok(None);
        }
        self.render_page(self.current_page + 1).await
    }

    pub async fn previous_page(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        if self.current_page <= 1 {
            return Ok(None);
        }
        self.render_page(self.current_page - 1).await
    }

    pub async fn go_to(&mut self, n: u32) -> ViewerResult<Option<Arc<RenderedPage>>> {
        if self.total_pages == 0 {
            return Ok(None);
        }
        self.render_page(n.clamp(1, self.total_pages)).await
    }

    pub async fn zoom_in(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.set_zoom(self.scale * ZOOM_IN_FACTOR).await
    }

    pub async fn zoom_out(&mut self) -> ViewerResult<Option<Arc<RenderedPage>>> {
        self.set_zoom(self.scale * ZOOM_OUT_FACTOR).await
    }

    /// Clamps to `[MIN_ZOOM, MAX_ZOOM]` and re-renders the current page when
    /// the scale changed.
    pub async fn set_zoom(&mut self, scale: f32) -> ViewerResult<Option<Arc<RenderedPage>>> {
        if !scale.is_finite() {
            return Err(ViewerError::validation(format!("invalid zoom level {scale}")));
        }
        let scale = scale.clamp(MIN_ZOOM, MAX_ZOOM);
        if scale_millis(scale) == scale_millis(self.scale) {
            return Ok(None);
        }
        self.scale = scale;
        self.render_page(self.current_page).await
    }

    /// Releases the active document's render resources and resets
    /// navigation. The document stays in the document cache.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(path = %active.path, "closing document");
            active.document.cleanup();
        }
        self.current_page = 1;
        self.total_pages = 0;
        self.scale = DEFAULT_ZOOM;
        self.rendered = None;
        self.phase = PagerPhase::Idle;
    }

    pub fn navigation_status(&self) -> NavigationStatus {
        let ready = self.phase == PagerPhase::Ready;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let zoom_percentage = (self.scale * 100.0).round() as u32;
        NavigationStatus {
            can_go_next: ready && self.current_page < self.total_pages,
            can_go_previous: ready && self.current_page > 1,
            can_zoom_in: self.scale < MAX_ZOOM,
            can_zoom_out: self.scale > MIN_ZOOM,
            current_page: self.current_page,
            total_pages: self.total_pages,
            zoom_percentage,
        }
    }

    pub async fn on_memory_pressure(&self) -> usize {
        let documents = self.documents.lock().await.sweep_expired();
        let pages = self.pages.lock().await.sweep_expired();
        documents + pages
    }

    pub fn start_sweeping(&self, interval: Duration) -> [SweepTask; 2] {
        [
            SweepTask::spawn(&self.documents, interval),
            SweepTask::spawn(&self.pages, interval),
        ]
    }

    pub async fn document_stats(&self) -> CacheStats<String> {
        self.documents.lock().await.stats()
    }

    pub async fn page_stats(&self) -> CacheStats<PageKey> {
        self.pages.lock().await.stats()
    }

    /// Closes the pager and empties both caches, destroying every document.
    pub async fn teardown(&mut self) {
        self.close();
        self.documents.lock().await.clear();
        self.pages.lock().await.clear();
    }
}
