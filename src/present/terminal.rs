//! Terminal I/O layer: raw mode, Kitty Graphics Protocol, status line.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use crossterm::{
    ExecutableCommand, QueueableCommand, cursor,
    style::{self, Stylize},
    terminal,
};
use std::io::{self, Write, stdout};

use crate::cache::Viewport;

const CHUNK_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// RawGuard: restores raw mode, alternate screen and images on Drop
// ---------------------------------------------------------------------------

pub(super) struct RawGuard {
    cleaned: bool,
}

impl RawGuard {
    pub(super) fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        stdout().execute(terminal::EnterAlternateScreen)?;
        stdout().execute(cursor::Hide)?;
        Ok(Self { cleaned: false })
    }

    pub(super) fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        let mut out = stdout();
        let _ = write!(out, "\x1b_Ga=d,d=A,q=2\x1b\\");
        let _ = out.execute(cursor::Show);
        let _ = out.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Everything above the last row shows the page; the last row is status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Layout {
    pub cols: u16,
    pub image_rows: u16,
    pub status_row: u16,
    pub cell_w: u16,
    pub cell_h: u16,
}

pub(super) fn compute_layout(term_cols: u16, term_rows: u16, pixel_w: u16, pixel_h: u16) -> Layout {
    let image_rows = term_rows.saturating_sub(1);
    let status_row = term_rows.saturating_sub(1);
    let cell_w = if term_cols > 0 { pixel_w / term_cols } else { 1 };
    let cell_h = if term_rows > 0 { pixel_h / term_rows } else { 1 };
    Layout {
        cols: term_cols,
        image_rows,
        status_row,
        cell_w,
        cell_h,
    }
}

impl Layout {
    /// Pixel size of the image area. Empty when the terminal does not
    /// report pixel dimensions.
    pub(super) fn viewport(&self) -> Viewport {
        Viewport::new(
            f64::from(self.cols) * f64::from(self.cell_w),
            f64::from(self.image_rows) * f64::from(self.cell_h),
        )
    }

    /// Cell box for an image of `width`x`height` px, centered horizontally.
    /// Returns `(start_col, cols, rows)`.
    pub(super) fn place(&self, width: u32, height: u32) -> (u16, u16, u16) {
        let cell_w = u32::from(self.cell_w.max(1));
        let cell_h = u32::from(self.cell_h.max(1));
        let cols = width.div_ceil(cell_w).clamp(1, u32::from(self.cols.max(1))) as u16;
        let rows = height.div_ceil(cell_h).clamp(1, u32::from(self.image_rows.max(1))) as u16;
        let start_col = (self.cols.saturating_sub(cols)) / 2;
        (start_col, cols, rows)
    }
}

// ---------------------------------------------------------------------------
// Kitty protocol helpers
// ---------------------------------------------------------------------------

/// Transfer PNG data in chunks (a=t: transmit only, no placement).
pub(super) fn send_image(png_data: &[u8], image_id: u32) -> io::Result<()> {
    let encoded = BASE64.encode(png_data);
    let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(CHUNK_SIZE).collect();

    let mut out = stdout();
    for (i, chunk) in chunks.iter().enumerate() {
        let m = if i + 1 == chunks.len() { 0 } else { 1 };
        if i == 0 {
            write!(out, "\x1b_Ga=t,f=100,i={image_id},t=d,q=2,m={m};")?;
        } else {
            write!(out, "\x1b_Gm={m},q=2;")?;
        }
        // base64 output is ASCII.
        out.write_all(chunk)?;
        write!(out, "\x1b\\")?;
    }
    out.flush()
}

/// Place a transferred image in the page area.
pub(super) fn place_image(layout: &Layout, image_id: u32, width: u32, height: u32) -> io::Result<()> {
    let (start_col, cols, rows) = layout.place(width, height);
    let mut out = stdout();
    out.queue(cursor::MoveTo(start_col, 0))?;
    write!(out, "\x1b_Ga=p,i={image_id},c={cols},r={rows},C=1,q=2\x1b\\")?;
    out.flush()
}

/// Delete image data and placements.
pub(super) fn delete_image(image_id: u32) -> io::Result<()> {
    let mut out = stdout();
    write!(out, "\x1b_Ga=d,d=I,i={image_id},q=2\x1b\\")?;
    out.flush()
}

/// Clear the text layer (placeholders, stale messages).
pub(super) fn clear_screen() -> io::Result<()> {
    let mut out = stdout();
    out.queue(terminal::Clear(terminal::ClearType::All))?;
    out.flush()
}

/// Centered one-line message in the page area (loading, rendering, ended).
pub(super) fn draw_placeholder(layout: &Layout, text: &str) -> io::Result<()> {
    let mut out = stdout();
    let col = (layout.cols as usize).saturating_sub(text.len()) / 2;
    out.queue(cursor::MoveTo(col as u16, layout.image_rows / 2))?;
    write!(out, "{}", text.dark_grey())?;
    out.queue(style::ResetColor)?;
    out.flush()
}

/// Draw the status line on the last terminal row.
pub(super) fn draw_status_bar(layout: &Layout, text: &str) -> io::Result<()> {
    let mut out = stdout();
    out.queue(cursor::MoveTo(0, layout.status_row))?;
    let padded = format!("{:<width$}", text, width = layout.cols as usize);
    write!(out, "{}", padded.on_dark_grey().white())?;
    out.queue(style::ResetColor)?;
    out.flush()
}

pub(super) fn check_tty() -> anyhow::Result<()> {
    use std::io::IsTerminal;
    if !io::stdout().is_terminal() {
        anyhow::bail!(
            "tandem present requires an interactive terminal.\n\
             \n\
             Supported terminals: Kitty, Ghostty, WezTerm\n\
             To render slides to files, use: tandem render <deck.typ> -o slide.png"
        );
    }
    Ok(())
}
