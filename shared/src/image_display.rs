use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::{ImageReader, Limits};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::cache::{CachePolicy, CacheStats, ResourceCache, SharedCache, SizeEstimate, SweepTask};
use crate::capabilities::{fetch_bytes, probe, Capabilities, HttpClient, ResourcePath};
use crate::retry::{RetryPolicy, RetryingFetcher};
use crate::{ViewerError, ViewerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLimits {
    pub max_input_bytes: usize,
    pub max_dimension: u32,
    pub max_alloc_bytes: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: 20 * 1024 * 1024,
            max_dimension: 8_000,
            max_alloc_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major.
    pub pixels: Bytes,
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecodedImage({}x{})", self.width, self.height)
    }
}

impl SizeEstimate for DecodedImage {
    fn estimated_bytes(&self) -> usize {
        self.pixels.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Displayed(Arc<DecodedImage>),
    /// A newer load started before this one finished.
    Superseded,
}

pub fn decode_png(data: &[u8], limits: &ImageLimits, resource: &str) -> ViewerResult<DecodedImage> {
    if data.is_empty() {
        return Err(ViewerError::corrupt(resource, "empty image body"));
    }
    if data.len() > limits.max_input_bytes {
        return Err(ViewerError::corrupt(
            resource,
            format!(
                "image of {} bytes exceeds limit of {} bytes",
                data.len(),
                limits.max_input_bytes
            ),
        ));
    }

    let mut reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ViewerError::corrupt(resource, e.to_string()))?;
    if reader.format().is_none() {
        return Err(ViewerError::corrupt(resource, "unrecognised image format"));
    }

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    decode_limits.max_alloc = Some(limits.max_alloc_bytes);
    reader.limits(decode_limits);

    let rgba = reader
        .decode()
        .map_err(|e| ViewerError::corrupt(resource, e.to_string()))?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        pixels: Bytes::from(rgba.into_raw()),
    })
}

pub struct ImageDisplayController {
    http: Arc<dyn HttpClient>,
    retry: RetryingFetcher,
    probe_policy: RetryPolicy,
    limits: ImageLimits,
    cache: SharedCache<String, Arc<DecodedImage>>,
    ticket: AtomicU64,
    displayed: RwLock<Option<(String, Arc<DecodedImage>)>>,
}

impl fmt::Debug for ImageDisplayController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDisplayController")
            .field("ticket", &self.ticket.load(Ordering::SeqCst))
            .field("probe_policy", &self.probe_policy)
            .finish_non_exhaustive()
    }
}

impl ImageDisplayController {
    pub fn new(
        caps: &Capabilities,
        policy: CachePolicy,
        probe_policy: RetryPolicy,
        limits: ImageLimits,
    ) -> Self {
        let cache = ResourceCache::with_clock("images", policy, Arc::clone(&caps.clock));
        Self {
            http: Arc::clone(&caps.http),
            retry: RetryingFetcher::new(Arc::clone(&caps.connectivity)),
            probe_policy,
            limits,
            cache: cache.into_shared(),
            ticket: AtomicU64::new(0),
            displayed: RwLock::new(None),
        }
    }

    /// Probes, fetches and decodes `path` unless it is cached. Failures are
    /// never cached.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn load(&self, path: &ResourcePath) -> ViewerResult<ImageOutcome> {
        let ticket = self.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let key = path.as_str().to_string();

        let cached = self.cache.lock().await.get(&key);
        let result = match cached {
            Some(image) => Ok(image),
            None => {
                let fetched = self.fetch_and_decode(path).await;
                if let Ok(image) = &fetched {
                    self.cache.lock().await.put(key.clone(), Arc::clone(image));
                }
                fetched
            }
        };

        if !self.is_current(ticket) {
            counter!("image.superseded").increment(1);
            debug!(ticket, "image load superseded");
            return Ok(ImageOutcome::Superseded);
        }

        let image = result?;
        *self.displayed.write().await = Some((key, Arc::clone(&image)));
        Ok(ImageOutcome::Displayed(image))
    }

    async fn fetch_and_decode(&self, path: &ResourcePath) -> ViewerResult<Arc<DecodedImage>> {
        let http = self.http.as_ref();
        self.retry
            .run("image probe", &self.probe_policy, move || probe(http, path))
            .await?;
        let body = self
            .retry
            .run("image fetch", &self.probe_policy, move || fetch_bytes(http, path))
            .await?;
        let image = decode_png(&body, &self.limits, path.as_str())?;
        info!(width = image.width, height = image.height, "image decoded");
        Ok(Arc::new(image))
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.ticket.load(Ordering::SeqCst) == ticket
    }

    /// Invalidates any in-flight load and clears the displayed image.
    pub async fn clear_display(&self) {
        self.ticket.fetch_add(1, Ordering::SeqCst);
        *self.displayed.write().await = None;
    }

    pub async fn displayed(&self) -> Option<Arc<DecodedImage>> {
        self.displayed
            .read()
            .await
            .as_ref()
            .map(|(_, image)| Arc::clone(image))
    }

    pub async fn displayed_path(&self) -> Option<String> {
        self.displayed.read().await.as_ref().map(|(p, _)| p.clone())
    }

    pub async fn on_memory_pressure(&self) -> usize {
        self.cache.lock().await.sweep_expired()
    }

    pub fn start_sweeping(&self, interval: Duration) -> SweepTask {
        SweepTask::spawn(&self.cache, interval)
    }

    pub async fn stats(&self) -> CacheStats<String> {
        self.cache.lock().await.stats()
    }

    pub async fn teardown(&self) {
        self.clear_display().await;
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::testing::{MockHttp, MockPdfEngine};
    use crate::ErrorKind;
    use image::{ExtendedColorType, ImageEncoder};

    pub(crate) fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        let pixels: Vec<u8> = (0..width * height)
            .flat_map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                let v = (i % 256) as u8;
                [v, v, v, 255]
            })
            .collect();
        let mut buffer = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buffer)
            .write_image(&pixels, width, height, ExtendedColorType::Rgba8)
            .unwrap();
        buffer
    }

    fn controller(http: Arc<MockHttp>) -> ImageDisplayController {
        let caps = Capabilities::new(http, Arc::new(MockPdfEngine::new()));
        ImageDisplayController::new(
            &caps,
            CachePolicy::images(),
            RetryPolicy::new(3, 10).with_jitter(0),
            ImageLimits::default(),
        )
    }

    #[test]
    fn decodes_png_to_rgba() {
        let image = decode_png(&create_test_png(4, 3), &ImageLimits::default(), "a.png").unwrap();
        assert_eq!((image.width, image.height), (4, 3));
        assert_eq!(image.estimated_bytes(), 4 * 3 * 4);
    }

    #[test]
    fn garbage_and_oversized_images_are_corrupt() {
        let limits = ImageLimits::default();
        assert_eq!(
            decode_png(b"not an image", &limits, "a.png").unwrap_err().kind(),
            ErrorKind::CorruptResource
        );
        assert_eq!(
            decode_png(&[], &limits, "a.png").unwrap_err().kind(),
            ErrorKind::CorruptResource
        );
        let tight = ImageLimits {
            max_dimension: 2,
            ..limits
        };
        assert!(decode_png(&create_test_png(4, 4), &tight, "a.png").is_err());
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let http = Arc::new(MockHttp::new());
        http.serve("images/20220601.png", 200, create_test_png(2, 2));
        let images = controller(Arc::clone(&http));
        let path = ResourcePath::new("images/20220601.png").unwrap();

        assert!(matches!(images.load(&path).await.unwrap(), ImageOutcome::Displayed(_)));
        assert!(matches!(images.load(&path).await.unwrap(), ImageOutcome::Displayed(_)));

        assert_eq!(http.requests().len(), 2, "one probe and one fetch");
        let stats = images.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(images.displayed_path().await.as_deref(), Some("images/20220601.png"));
    }

    #[tokio::test]
    async fn missing_image_is_not_cached() {
        let http = Arc::new(MockHttp::new());
        let images = controller(Arc::clone(&http));
        let path = ResourcePath::new("images/20220699.png").unwrap();

        for _ in 0..2 {
            let err = images.load(&path).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
        assert_eq!(http.requests().len(), 2, "each load probes again");
        assert!(images.stats().await.size == 0);
        assert!(images.displayed().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_image_surfaces_without_retry() {
        let http = Arc::new(MockHttp::new());
        http.serve("images/bad.png", 200, "garbage");
        let images = controller(Arc::clone(&http));
        let path = ResourcePath::new("images/bad.png").unwrap();

        let err = images.load(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptResource);
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_does_not_overwrite_newer_selection() {
        let http = Arc::new(MockHttp::new());
        http.serve("images/old.png", 200, create_test_png(2, 2));
        http.serve("images/new.png", 200, create_test_png(3, 3));
        http.set_latency(Duration::from_millis(50));
        let images = Arc::new(controller(Arc::clone(&http)));
        let old = ResourcePath::new("images/old.png").unwrap();
        let new = ResourcePath::new("images/new.png").unwrap();

        let slow = {
            let images = Arc::clone(&images);
            tokio::spawn(async move { images.load(&old).await })
        };
        tokio::task::yield_now().await;
        let fresh = images.load(&new).await.unwrap();

        assert!(matches!(fresh, ImageOutcome::Displayed(ref img) if img.width == 3));
        assert_eq!(slow.await.unwrap().unwrap(), ImageOutcome::Superseded);
        assert_eq!(images.displayed_path().await.as_deref(), Some("images/new.png"));
        assert_eq!(images.stats().await.size, 2, "late result is still cached");
    }

    #[tokio::test]
    async fn teardown_clears_cache_and_display() {
        let http = Arc::new(MockHttp::new());
        http.serve("a.png", 200, create_test_png(1, 1));
        let images = controller(http);
        images.load(&ResourcePath::new("a.png").unwrap()).await.unwrap();

        images.teardown().await;
        assert!(images.displayed().await.is_none());
        assert_eq!(images.stats().await.size, 0);
    }
}
