//! Page image cache: rasterize each page once per viewport size.
//!
//! One `PageRenderCache` exists per loaded document. It owns a render worker
//! thread, the cached bitmaps, and the cancellation tokens of every render it
//! has in flight. The owning window drives it from its event loop:
//!
//! ```text
//! set_active_page(n) ─┬─ ensure_page_image(n,   active)   → RenderJob ─┐
//!                     └─ ensure_page_image(n+1, prefetch) → RenderJob ─┤
//!                                                                      ▼
//!                                                             render worker
//!                                                                      │
//! pump() / wait_idle() ◀──────────────── RenderDone ───────────────────┘
//! ```
//!
//! ## Stale results
//!
//! Every job gets a task id recorded in `in_flight[page]`. A result is only
//! accepted while `in_flight[page]` still names that task. Cancelling a task
//! (superseded, viewport resize, cache dropped) removes it from `in_flight`
//! and trips its token, so whatever the worker eventually sends back is
//! discarded without touching the cache.
//!
//! ## Invalidation
//!
//! Bitmaps are only valid at the size they were rendered for. When the
//! viewport's [`SizeSignature`] changes, every entry is dropped and every
//! in-flight render cancelled; the active page is re-rendered with `force`.
//! Entries that happen to match the new size are not kept.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::engine::{Bitmap, DocumentHandle, LoadedDocument, PageSize};

// ---------------------------------------------------------------------------
// Viewport geometry
// ---------------------------------------------------------------------------

/// Container size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Coarse cache key derived from the viewport: rounded pixel dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeSignature {
    width: u32,
    height: u32,
}

impl fmt::Display for SizeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.signature().is_none()
    }

    /// `None` while either side rounds to zero (container not laid out yet).
    pub fn signature(&self) -> Option<SizeSignature> {
        let round = |v: f64| {
            if v.is_finite() && v > 0.0 {
                v.round().min(f64::from(u32::MAX)) as u32
            } else {
                0
            }
        };
        let (width, height) = (round(self.width), round(self.height));
        (width > 0 && height > 0).then_some(SizeSignature { width, height })
    }

    /// Largest scale at which `page` fits inside the viewport. Falls back to
    /// 1 when the page size is degenerate.
    pub fn fit_scale(&self, page: PageSize) -> f64 {
        let scale = (self.width / page.width).min(self.height / page.height);
        if scale.is_finite() && scale > 0.0 { scale } else { 1.0 }
    }

    /// On-screen size of `page` when fitted.
    pub fn displayed_size(&self, page: PageSize) -> (f64, f64) {
        let scale = self.fit_scale(page);
        (page.width * scale, page.height * scale)
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub page: u32,
    pub image: Bitmap,
    pub rendered_at: SizeSignature,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnsureOptions {
    /// The page is meant to be visible now (as opposed to a prefetch).
    pub is_active: bool,
    /// Re-render even if a cached entry exists.
    pub force: bool,
}

impl EnsureOptions {
    pub const ACTIVE: Self = Self {
        is_active: true,
        force: false,
    };
    pub const PREFETCH: Self = Self {
        is_active: false,
        force: false,
    };

    pub fn forced(self) -> Self {
        Self { force: true, ..self }
    }
}

/// What the UI should show for the active page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderEvent {
    /// The active page has no image yet; a render is under way.
    Pending { page: u32 },
    /// Show this image for the active page.
    Displayed { page: u32, image: Bitmap },
    /// The active page's render failed. The next request retries.
    Failed { page: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Results that arrived for a task no longer in flight.
    pub discarded: u64,
    pub hits: u64,
}

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

struct RenderJob {
    task: u64,
    page: u32,
    viewport: Viewport,
    signature: SizeSignature,
    token: CancellationToken,
}

enum JobResult {
    Rendered(Bitmap),
    Cancelled,
    Failed(anyhow::Error),
}

struct RenderDone {
    task: u64,
    page: u32,
    signature: SizeSignature,
    result: JobResult,
}

struct InFlight {
    task: u64,
    active: bool,
    token: CancellationToken,
}

fn spawn_worker(
    id: u64,
    document: Arc<dyn LoadedDocument>,
    jobs: mpsc::Receiver<RenderJob>,
    done: mpsc::Sender<RenderDone>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("render-{id}"))
        .spawn(move || {
            debug!("render worker {id}: started");
            while let Ok(job) = jobs.recv() {
                let result = run_job(document.as_ref(), &job);
                let reply = RenderDone {
                    task: job.task,
                    page: job.page,
                    signature: job.signature,
                    result,
                };
                if done.send(reply).is_err() {
                    break;
                }
            }
            debug!("render worker {id}: channel closed, exiting");
        })?;
    Ok(())
}

/// Token checked on entry and again on completion.
fn run_job(document: &dyn LoadedDocument, job: &RenderJob) -> JobResult {
    if job.token.is_cancelled() {
        return JobResult::Cancelled;
    }
    let start = Instant::now();
    let rendered = document.page_size(job.page).and_then(|size| {
        let scale = job.viewport.fit_scale(size);
        document.render_page(job.page, scale, &job.token)
    });
    if job.token.is_cancelled() {
        return JobResult::Cancelled;
    }
    match rendered {
        Ok(image) => {
            debug!(
                "render worker: page {} -> {:?} in {:.1}ms",
                job.page,
                image,
                start.elapsed().as_secs_f64() * 1000.0
            );
            JobResult::Rendered(image)
        }
        Err(e) => JobResult::Failed(e),
    }
}

// ---------------------------------------------------------------------------
// PageRenderCache
// ---------------------------------------------------------------------------

pub struct PageRenderCache {
    document: DocumentHandle,
    viewport: Viewport,
    signature: Option<SizeSignature>,
    entries: HashMap<u32, CacheEntry>,
    in_flight: HashMap<u32, InFlight>,
    next_task: u64,
    active_page: Option<u32>,
    displayed_page: Option<u32>,
    rendering: bool,
    prefetch: bool,
    events: Vec<RenderEvent>,
    stats: CacheStats,
    jobs: mpsc::Sender<RenderJob>,
    done: mpsc::Receiver<RenderDone>,
}

impl PageRenderCache {
    /// Create the cache for `document` and start its render worker.
    pub fn new(document: DocumentHandle, viewport: Viewport, prefetch: bool) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        spawn_worker(
            document.id(),
            Arc::clone(document.document()),
            jobs_rx,
            done_tx,
        )?;
        info!(
            "cache: created for {} ({} page(s)), viewport {}",
            document.location(),
            document.page_count(),
            viewport
                .signature()
                .map_or_else(|| "unsized".to_string(), |s| s.to_string())
        );
        Ok(Self {
            signature: viewport.signature(),
            document,
            viewport,
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            next_task: 0,
            active_page: None,
            displayed_page: None,
            rendering: false,
            prefetch,
            events: Vec::new(),
            stats: CacheStats::default(),
            jobs: jobs_tx,
            done: done_rx,
        })
    }

    pub fn document(&self) -> &DocumentHandle {
        &self.document
    }

    pub fn signature(&self) -> Option<SizeSignature> {
        self.signature
    }

    pub fn entry(&self, page: u32) -> Option<&CacheEntry> {
        self.entries.get(&page)
    }

    pub fn contains(&self, page: u32) -> bool {
        self.entries.contains_key(&page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_in_flight(&self, page: u32) -> bool {
        self.in_flight.contains_key(&page)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// True while the active page is waiting for its image.
    pub fn is_rendering(&self) -> bool {
        self.rendering
    }

    pub fn active_page(&self) -> Option<u32> {
        self.active_page
    }

    pub fn displayed_page(&self) -> Option<u32> {
        self.displayed_page
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn take_events(&mut self) -> Vec<RenderEvent> {
        std::mem::take(&mut self.events)
    }

    /// The active page changed: show it, and prefetch the one after it.
    pub fn set_active_page(&mut self, page: u32) {
        self.ensure_page_image(page, EnsureOptions::ACTIVE);
        self.prefetch_after(page);
    }

    /// Make sure `page` is cached at the current size, rendering it if not.
    ///
    /// Called speculatively, so out-of-range pages, an unsized viewport, and
    /// duplicate requests are silently ignored.
    pub fn ensure_page_image(&mut self, page: u32, opts: EnsureOptions) {
        if page < 1 || page > self.document.page_count() {
            debug!("cache: page {page} out of range, ignored");
            return;
        }
        // Remembered even without a size, so the page shows once one arrives.
        if opts.is_active {
            self.active_page = Some(page);
        }
        let Some(signature) = self.signature else {
            debug!("cache: page {page} skipped, viewport unsized");
            return;
        };
        if self.viewport.is_empty() {
            debug!("cache: page {page} skipped, viewport collapsed");
            return;
        }

        if !opts.force {
            let hit = self
                .entries
                .get(&page)
                .is_some_and(|e| e.rendered_at == signature);
            if hit {
                self.stats.hits += 1;
                if opts.is_active {
                    self.display(page);
                }
                return;
            }
        }

        if let Some(flight) = self.in_flight.get(&page) {
            if opts.is_active && !flight.active {
                debug!("cache: page {page} prefetch superseded by active render");
                self.cancel_task(page);
            } else {
                if opts.is_active {
                    self.mark_pending(page);
                }
                debug!("cache: page {page} already in flight");
                return;
            }
        }

        if opts.is_active {
            self.supersede_active(page);
            self.mark_pending(page);
        }
        self.start(page, opts.is_active, signature);
    }

    /// Apply a new viewport size. A changed signature invalidates the whole
    /// cache; a zero size is ignored until a real size arrives.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        let was_empty = self.viewport.is_empty();
        self.viewport = viewport;
        let Some(signature) = viewport.signature() else {
            debug!("cache: viewport collapsed, waiting for a real size");
            return;
        };
        if self.signature == Some(signature) {
            if was_empty {
                self.refresh_active(false);
            }
            return;
        }
        info!(
            "cache: viewport {} -> {signature}, dropping {} entr(y/ies)",
            self.signature
                .map_or_else(|| "unsized".to_string(), |s| s.to_string()),
            self.entries.len()
        );
        self.signature = Some(signature);
        self.invalidate();
        self.refresh_active(true);
    }

    /// Collect finished renders without blocking. Returns how many results
    /// were processed (accepted or discarded).
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(done) = self.done.try_recv() {
            self.complete(done);
            processed += 1;
        }
        processed
    }

    /// Block until nothing is in flight or `timeout` passes. Returns whether
    /// the cache went idle.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.pump();
        while !self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(remaining) {
                Ok(done) => self.complete(done),
                Err(mpsc::RecvTimeoutError::Timeout) => return false,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    error!("cache: render worker is gone");
                    return false;
                }
            }
        }
        true
    }

    fn prefetch_after(&mut self, page: u32) {
        if self.prefetch && page < self.document.page_count() {
            self.ensure_page_image(page + 1, EnsureOptions::PREFETCH);
        }
    }

    fn refresh_active(&mut self, force: bool) {
        let Some(page) = self.active_page else {
            return;
        };
        let opts = if force {
            EnsureOptions::ACTIVE.forced()
        } else {
            EnsureOptions::ACTIVE
        };
        self.ensure_page_image(page, opts);
        self.prefetch_after(page);
    }

    fn start(&mut self, page: u32, active: bool, signature: SizeSignature) {
        self.next_task += 1;
        let task = self.next_task;
        let token = CancellationToken::new();
        let job = RenderJob {
            task,
            page,
            viewport: self.viewport,
            signature,
            token: token.clone(),
        };
        if self.jobs.send(job).is_err() {
            error!("cache: render worker is gone, page {page} not rendered");
            if active {
                self.fail_active(page);
            }
            return;
        }
        debug!(
            "cache: page {page} queued as task {task} ({}) at {signature}",
            if active { "active" } else { "prefetch" }
        );
        self.stats.started += 1;
        self.in_flight.insert(
            page,
            InFlight {
                task,
                active,
                token,
            },
        );
    }

    /// At most one active render at a time: an active render for another
    /// page is cancelled.
    fn supersede_active(&mut self, page: u32) {
        let stale: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(p, f)| f.active && **p != page)
            .map(|(p, _)| *p)
            .collect();
        for p in stale {
            debug!("cache: active render of page {p} superseded by page {page}");
            self.cancel_task(p);
        }
    }

    fn cancel_task(&mut self, page: u32) {
        if let Some(flight) = self.in_flight.remove(&page) {
            flight.token.cancel();
            self.stats.cancelled += 1;
        }
    }

    fn invalidate(&mut self) {
        let pages: Vec<u32> = self.in_flight.keys().copied().collect();
        for page in pages {
            self.cancel_task(page);
        }
        self.entries.clear();
        self.displayed_page = None;
        self.rendering = false;
    }

    fn mark_pending(&mut self, page: u32) {
        self.rendering = true;
        self.events.push(RenderEvent::Pending { page });
    }

    fn display(&mut self, page: u32) {
        if self.active_page != Some(page) {
            return;
        }
        let Some(entry) = self.entries.get(&page) else {
            return;
        };
        self.displayed_page = Some(page);
        self.rendering = false;
        self.events.push(RenderEvent::Displayed {
            page,
            image: entry.image.clone(),
        });
    }

    fn fail_active(&mut self, page: u32) {
        if self.active_page == Some(page) {
            self.rendering = false;
            self.events.push(RenderEvent::Failed { page });
        }
    }

    fn complete(&mut self, done: RenderDone) {
        // Tripping a token always drops the task from `in_flight` first, so a
        // cancelled result never belongs to a live task.
        let live = self
            .in_flight
            .get(&done.page)
            .is_some_and(|f| f.task == done.task)
            && Some(done.signature) == self.signature;
        let rendered = match done.result {
            JobResult::Rendered(image) if live => Ok(image),
            JobResult::Failed(e) if live => Err(e),
            _ => {
                debug!(
                    "cache: discarding stale result for page {} (task {})",
                    done.page, done.task
                );
                self.stats.discarded += 1;
                return;
            }
        };
        self.in_flight.remove(&done.page);

        match rendered {
            Ok(image) => {
                self.stats.completed += 1;
                self.entries.insert(
                    done.page,
                    CacheEntry {
                        page: done.page,
                        image,
                        rendered_at: done.signature,
                    },
                );
                self.display(done.page);
            }
            Err(e) => {
                warn!("cache: failed to render page {}: {e:#}", done.page);
                self.stats.failed += 1;
                self.fail_active(done.page);
            }
        }
    }
}

impl Drop for PageRenderCache {
    /// In-flight renders must never land in a dead cache: cancel them all.
    /// The worker exits once the job sender is gone; it is not joined, since
    /// a stalled engine call would block the window.
    fn drop(&mut self) {
        for flight in self.in_flight.values() {
            flight.token.cancel();
        }
        debug!(
            "cache: dropped for {} ({} in flight cancelled)",
            self.document.location(),
            self.in_flight.len()
        );
    }
}
