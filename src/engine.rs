//! Document engine seam: load a payload, report page geometry, rasterize.
//!
//! Any engine satisfying these traits can back a window. The crate ships
//! [`crate::typst_engine::TypstEngine`]; tests use in-memory fakes.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::cancel::CancellationToken;

/// Intrinsic page size in points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

/// A rasterized page, PNG-encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    png: Arc<[u8]>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, png: Vec<u8>) -> Self {
        Self {
            width,
            height,
            png: png.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn png(&self) -> &[u8] {
        &self.png
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({}x{}, {} bytes)", self.width, self.height, self.png.len())
    }
}

/// A document the engine has parsed and can rasterize page by page.
///
/// Pages are 1-based. Implementations are shared with the render worker
/// thread, hence `Send + Sync`.
pub trait LoadedDocument: Send + Sync {
    fn page_count(&self) -> u32;

    fn page_size(&self, page: u32) -> Result<PageSize>;

    /// Rasterize `page` at `scale` pixels per point.
    ///
    /// Long-running engines should poll `token` and bail out early; the
    /// caller discards the result of a cancelled render either way.
    fn render_page(&self, page: u32, scale: f64, token: &CancellationToken) -> Result<Bitmap>;
}

pub trait DocumentEngine: Send + Sync {
    fn load(&self, payload: &[u8], token: &CancellationToken) -> Result<Arc<dyn LoadedDocument>>;
}

/// Location of a document: a `blob:` reference into a
/// [`crate::payload::PayloadStore`] or a filesystem path.
///
/// This is all a peer ever receives; the bytes stay with the window that
/// registered them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentRef(String);

impl DocumentRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A loaded document as held by one window.
#[derive(Clone)]
pub struct DocumentHandle {
    id: u64,
    location: DocumentRef,
    document: Arc<dyn LoadedDocument>,
}

impl DocumentHandle {
    pub fn new(id: u64, location: DocumentRef, document: Arc<dyn LoadedDocument>) -> Self {
        Self {
            id,
            location,
            document,
        }
    }

    /// Load generation that produced this handle; unique per window.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> &DocumentRef {
        &self.location
    }

    /// At least 1, whatever the engine reports.
    pub fn page_count(&self) -> u32 {
        self.document.page_count().max(1)
    }

    pub fn document(&self) -> &Arc<dyn LoadedDocument> {
        &self.document
    }
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("pages", &self.document.page_count())
            .finish()
    }
}
