//! Typst-backed [`DocumentEngine`]: a payload is the source of a Typst deck,
//! one slide per page.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use log::{debug, info, trace, warn};
use typst::diag::{FileError, FileResult};
use typst::foundations::{Bytes, Datetime};
use typst::layout::{Page, PagedDocument};
use typst::syntax::{FileId, Source, VirtualPath};
use typst::text::{Font, FontBook};
use typst::utils::LazyHash;
use typst::{Library, LibraryExt, World};
use typst_kit::fonts::{FontSearcher, FontSlot, Fonts};

use crate::cancel::CancellationToken;
use crate::engine::{Bitmap, DocumentEngine, LoadedDocument, PageSize};

/// Library and fonts, shared by every compilation.
struct Environment {
    library: LazyHash<Library>,
    book: LazyHash<FontBook>,
    fonts: Vec<FontSlot>,
}

pub struct TypstEngine {
    env: Arc<Environment>,
}

impl TypstEngine {
    /// Search fonts once. System fonts are included unless `embedded_only`.
    pub fn new(embedded_only: bool) -> Self {
        let start = Instant::now();
        let Fonts { book, fonts } = FontSearcher::new()
            .include_system_fonts(!embedded_only)
            .search();
        info!(
            "typst: {} font(s) found in {:.1}ms",
            fonts.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Self {
            env: Arc::new(Environment {
                library: LazyHash::new(Library::default()),
                book: LazyHash::new(book),
                fonts,
            }),
        }
    }
}

impl DocumentEngine for TypstEngine {
    fn load(&self, payload: &[u8], token: &CancellationToken) -> Result<Arc<dyn LoadedDocument>> {
        let text = std::str::from_utf8(payload).context("deck is not valid UTF-8")?;
        let world = DeckWorld::new(Arc::clone(&self.env), text);

        let start = Instant::now();
        let warned = typst::compile::<PagedDocument>(&world);
        for warning in &warned.warnings {
            warn!("typst: {}", warning.message);
        }
        let document = match warned.output {
            Ok(doc) => doc,
            Err(errors) => {
                for err in &errors {
                    warn!("typst error: {}", err.message);
                }
                bail!("typst compilation failed with {} error(s)", errors.len());
            }
        };
        if token.is_cancelled() {
            bail!("load cancelled");
        }
        if document.pages.is_empty() {
            bail!("typst produced no pages");
        }
        debug!(
            "typst: compiled {} page(s) in {:.1}ms",
            document.pages.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Arc::new(TypstDeck {
            pages: document.pages,
        }))
    }
}

/// Single virtual file `/main.typ` holding the deck source.
struct DeckWorld {
    env: Arc<Environment>,
    main_id: FileId,
    main_source: Source,
}

impl DeckWorld {
    fn new(env: Arc<Environment>, text: &str) -> Self {
        let main_id = FileId::new(None, VirtualPath::new("main.typ"));
        Self {
            env,
            main_id,
            main_source: Source::new(main_id, text.to_string()),
        }
    }
}

impl World for DeckWorld {
    fn library(&self) -> &LazyHash<Library> {
        &self.env.library
    }

    fn book(&self) -> &LazyHash<FontBook> {
        &self.env.book
    }

    fn main(&self) -> FileId {
        self.main_id
    }

    fn source(&self, id: FileId) -> FileResult<Source> {
        if id == self.main_id {
            Ok(self.main_source.clone())
        } else {
            Err(FileError::NotFound(id.vpath().as_rootless_path().into()))
        }
    }

    fn file(&self, id: FileId) -> FileResult<Bytes> {
        if id == self.main_id {
            Ok(Bytes::from_string(self.main_source.clone()))
        } else {
            Err(FileError::NotFound(id.vpath().as_rootless_path().into()))
        }
    }

    fn font(&self, index: usize) -> Option<Font> {
        self.env.fonts.get(index)?.get()
    }

    fn today(&self, _offset: Option<i64>) -> Option<Datetime> {
        None
    }
}

/// Compiled deck. Rendering is stateless, so pages can be rasterized from
/// any thread.
struct TypstDeck {
    pages: Vec<Page>,
}

impl TypstDeck {
    fn page(&self, page: u32) -> Result<&Page> {
        match page.checked_sub(1).and_then(|i| self.pages.get(i as usize)) {
            Some(p) => Ok(p),
            None => bail!("page {page} out of range (1..={})", self.pages.len()),
        }
    }
}

impl LoadedDocument for TypstDeck {
    fn page_count(&self) -> u32 {
        u32::try_from(self.pages.len()).unwrap_or(u32::MAX)
    }

    fn page_size(&self, page: u32) -> Result<PageSize> {
        let size = self.page(page)?.frame.size();
        Ok(PageSize {
            width: size.x.to_pt(),
            height: size.y.to_pt(),
        })
    }

    fn render_page(&self, page: u32, scale: f64, token: &CancellationToken) -> Result<Bitmap> {
        let source = self.page(page)?;
        if token.is_cancelled() {
            bail!("render of page {page} cancelled");
        }
        trace!("typst: rendering page {page} at {scale:.3}px/pt");
        let start = Instant::now();
        let pixmap = typst_render::render(source, scale as f32);
        let png = pixmap
            .encode_png()
            .map_err(|e| anyhow::anyhow!("PNG encoding of page {page} failed: {e}"))?;
        debug!(
            "typst: page {page}: {}x{}px, {} bytes PNG in {:.1}ms",
            pixmap.width(),
            pixmap.height(),
            png.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Bitmap::new(pixmap.width(), pixmap.height(), png))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECK: &str = "#set page(width: 160pt, height: 90pt)\n= One\n#pagebreak()\n= Two\n#pagebreak()\n= Three\n";

    fn engine() -> TypstEngine {
        TypstEngine::new(true)
    }

    #[test]
    fn compiles_one_page_per_slide() {
        let doc = engine()
            .load(DECK.as_bytes(), &CancellationToken::new())
            .unwrap();
        assert_eq!(doc.page_count(), 3);
        let size = doc.page_size(2).unwrap();
        assert!((size.width - 160.0).abs() < 0.01);
        assert!((size.height - 90.0).abs() < 0.01);
    }

    #[test]
    fn renders_at_requested_scale() {
        let doc = engine()
            .load(DECK.as_bytes(), &CancellationToken::new())
            .unwrap();
        let image = doc.render_page(1, 2.0, &CancellationToken::new()).unwrap();
        assert_eq!((image.width(), image.height()), (320, 180));
        assert!(image.png().starts_with(b"\x89PNG"));
    }

    #[test]
    fn out_of_range_page_is_an_error() {
        let doc = engine()
            .load(DECK.as_bytes(), &CancellationToken::new())
            .unwrap();
        assert!(doc.page_size(0).is_err());
        assert!(doc.page_size(4).is_err());
    }

    #[test]
    fn syntax_error_fails_load() {
        let err = engine()
            .load(b"#let x = (", &CancellationToken::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("compilation failed"));
    }

    #[test]
    fn cancelled_render_bails() {
        let doc = engine()
            .load(DECK.as_bytes(), &CancellationToken::new())
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(doc.render_page(1, 1.0, &token).is_err());
    }
}
