use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::SizeEstimate;
use crate::ViewerError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PdfError {
    #[error("invalid PDF structure: {0}")]
    InvalidStructure(String),

    #[error("document is password protected")]
    PasswordRequired,

    #[error("page {page} out of range 1-{total}")]
    PageOutOfRange { page: u32, total: u32 },

    #[error("render failed: {0}")]
    Render(String),

    #[error("document has been destroyed")]
    Destroyed,
}

impl PdfError {
    pub fn into_viewer_error(self, resource: &str) -> ViewerError {
        match self {
            PdfError::PageOutOfRange { .. } => ViewerError::validation(self.to_string()),
            other => ViewerError::corrupt(resource, other.to_string()),
        }
    }
}

/// Rendered bitmap of one page at one scale.
#[derive(Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub page: u32,
    /// Scale in thousandths (1000 = 100%).
    pub scale_millis: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl fmt::Debug for RenderedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedPage")
            .field("page", &self.page)
            .field("scale_millis", &self.scale_millis)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl SizeEstimate for RenderedPage {
    fn estimated_bytes(&self) -> usize {
        self.pixels.len()
    }
}

/// A parsed multi-page document owned by the host's PDF engine.
#[async_trait]
pub trait PdfDocument: Send + Sync + fmt::Debug {
    fn page_count(&self) -> u32;

    async fn render_page(&self, page: u32, scale: f32) -> Result<RenderedPage, PdfError>;

    /// Releases render-side resources; the document stays usable.
    fn cleanup(&self);

    /// Final release. Rendering afterwards fails with [`PdfError::Destroyed`].
    fn destroy(&self);
}

#[async_trait]
pub trait PdfEngine: Send + Sync {
    async fn open(&self, data: Bytes) -> Result<Arc<dyn PdfDocument>, PdfError>;
}
