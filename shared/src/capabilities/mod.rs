mod http;
mod network;
mod pdf;

use std::sync::Arc;

pub use self::http::{
    classify_status, fetch_bytes, probe, HttpClient, HttpError, HttpMethod, HttpRequest,
    HttpResponse, ResourcePath, MAX_URL_LENGTH,
};
pub use self::network::{Connectivity, ConnectivityFlag, NoConnectivitySignal};
pub use self::pdf::{PdfDocument, PdfEngine, PdfError, RenderedPage};

use crate::{Clock, SystemClock};

/// Everything the core needs from its host environment.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpClient>,
    pub pdf: Arc<dyn PdfEngine>,
    pub connectivity: Arc<dyn Connectivity>,
    pub clock: Arc<dyn Clock>,
}

impl Capabilities {
    pub fn new(http: Arc<dyn HttpClient>, pdf: Arc<dyn PdfEngine>) -> Self {
        Self {
            http,
            pdf,
            connectivity: Arc::new(NoConnectivitySignal),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("online", &self.connectivity.is_online())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! In-memory host doubles.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{
        HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, PdfDocument, PdfEngine,
        PdfError, RenderedPage,
    };

    type Reply = Result<HttpResponse, HttpError>;

    /// Serves canned responses per path. A path may be given a queue of
    /// replies consumed in order; the last one repeats.
    #[derive(Default)]
    pub struct MockHttp {
        routes: Mutex<HashMap<String, Vec<Reply>>>,
        head_overrides: Mutex<HashMap<String, Reply>>,
        log: Mutex<Vec<(HttpMethod, String)>>,
        latency: Mutex<Option<Duration>>,
    }

    impl MockHttp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn serve(&self, path: &str, status: u16, body: impl Into<Bytes>) {
            self.sequence(path, vec![Ok(HttpResponse::new(status, body))]);
        }

        pub fn sequence(&self, path: &str, replies: Vec<Reply>) {
            self.routes
                .lock()
                .unwrap()
                .insert(path.to_string(), replies);
        }

        pub fn head_reply(&self, path: &str, reply: Reply) {
            self.head_overrides
                .lock()
                .unwrap()
                .insert(path.to_string(), reply);
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = Some(latency);
        }

        pub fn requests(&self) -> Vec<(HttpMethod, String)> {
            self.log.lock().unwrap().clone()
        }

        pub fn count(&self, method: HttpMethod, path: &str) -> usize {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, p)| *m == method && p == path)
                .count()
        }

        fn next_reply(&self, request: &HttpRequest) -> Reply {
            let path = request.path().as_str();
            if request.method() == HttpMethod::Head {
                if let Some(reply) = self.head_overrides.lock().unwrap().get(path) {
                    return reply.clone();
                }
            }
            let mut routes = self.routes.lock().unwrap();
            let Some(queue) = routes.get_mut(path) else {
                return Ok(HttpResponse::new(404, Bytes::new()));
            };
            let reply = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            };
            match (request.method(), reply) {
                (HttpMethod::Head, Ok(response)) => Ok(HttpResponse::new(response.status(), Bytes::new())),
                (_, reply) => reply,
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttp {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.log
                .lock()
                .unwrap()
                .push((request.method(), request.path().to_string()));
            let latency = *self.latency.lock().unwrap();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.next_reply(&request)
        }
    }

    /// Parses documents of the form `%PDF-pages:N`.
    #[derive(Default)]
    pub struct MockPdfEngine {
        opened: AtomicU32,
        open_delay: Mutex<Option<Duration>>,
        pub documents: Mutex<Vec<Arc<MockDocument>>>,
    }

    impl MockPdfEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn opened(&self) -> u32 {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn set_open_delay(&self, delay: Duration) {
            *self.open_delay.lock().unwrap() = Some(delay);
        }

        pub fn pdf_bytes(pages: u32) -> Bytes {
            Bytes::from(format!("%PDF-pages:{pages}"))
        }
    }

    #[async_trait]
    impl PdfEngine for MockPdfEngine {
        async fn open(&self, data: Bytes) -> Result<Arc<dyn PdfDocument>, PdfError> {
            let delay = *self.open_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let text = std::str::from_utf8(&data)
                .map_err(|_| PdfError::InvalidStructure("not utf-8".into()))?;
            let pages = text
                .strip_prefix("%PDF-pages:")
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| PdfError::InvalidStructure("missing header".into()))?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            let doc = Arc::new(MockDocument::new(pages));
            self.documents.lock().unwrap().push(Arc::clone(&doc));
            Ok(doc)
        }
    }

    #[derive(Debug, Default)]
    pub struct MockDocument {
        pages: u32,
        pub renders: Mutex<Vec<(u32, u32)>>,
        pub cleanups: AtomicU32,
        pub destroyed: AtomicBool,
    }

    impl MockDocument {
        pub fn new(pages: u32) -> Self {
            Self {
                pages,
                ..Self::default()
            }
        }

        pub fn render_count(&self) -> usize {
            self.renders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PdfDocument for MockDocument {
        fn page_count(&self) -> u32 {
            self.pages
        }

        async fn render_page(&self, page: u32, scale: f32) -> Result<RenderedPage, PdfError> {
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(PdfError::Destroyed);
            }
            if page == 0 || page > self.pages {
                return Err(PdfError::PageOutOfRange {
                    page,
                    total: self.pages,
                });
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let scale_millis = (scale * 1000.0).round() as u32;
            self.renders.lock().unwrap().push((page, scale_millis));
            let width = scale_millis / 10;
            let height = scale_millis / 10;
            Ok(RenderedPage {
                page,
                scale_millis,
                width,
                height,
                pixels: Bytes::from(vec![0u8; (width * height * 4) as usize]),
            })
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }

        fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }
}
