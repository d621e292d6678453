//! One presenter-view window: controller, loader and page cache wired to a UI.
//!
//! A window is single-threaded and driven by [`Window::tick`]. Each tick it
//!
//! 1. drains its sync channel into the controller,
//! 2. acts on the controller's events (start or cancel a load, show a page),
//! 3. picks up a finished load and builds the page cache for it,
//! 4. collects finished renders and forwards them to the UI.
//!
//! Everything the UI sees goes through [`UiSink`].

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::cache::{PageRenderCache, RenderEvent, Viewport};
use crate::controller::{
    ControllerError, ControllerEvent, NavTarget, PresentationController, PresentationResource,
    Role, SessionPhase, ViewState,
};
use crate::engine::{Bitmap, DocumentEngine, DocumentRef};
use crate::loader::{DocumentLoader, LoadOutcome};
use crate::payload::PayloadStore;
use crate::sync::{DEFAULT_CHANNEL, PeerId, SyncBus};

/// What the UI should show for the active page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageView {
    Ready { page: u32, image: Bitmap },
    /// Rendering; show a placeholder.
    Pending { page: u32 },
}

/// Callbacks into the UI layer hosting the window.
pub trait UiSink {
    fn on_active_page_changed(&mut self, view: PageView);

    fn on_document_metadata(&mut self, total_pages: u32);

    /// The presentation is over; a presenter should close its view.
    fn on_session_ended(&mut self);

    /// The window left `Ended` and browses locally again. Optional.
    fn on_session_resumed(&mut self) {}

    /// Page indicator update. Optional.
    fn on_view_state(&mut self, _view: ViewState) {}

    /// A load or render failed. Optional.
    fn on_error(&mut self, _message: &str) {}

    /// Open the presenter surface for a new presentation. `None` means the
    /// UI could not open it (blocked popup).
    fn open_presenter(&mut self) -> Option<Box<dyn PresentationResource>> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct WindowOptions {
    pub channel: String,
    pub viewport: Viewport,
    pub prefetch: bool,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            viewport: Viewport::new(1280.0, 720.0),
            prefetch: true,
        }
    }
}

pub struct Window<U: UiSink> {
    controller: PresentationController,
    loader: DocumentLoader,
    payloads: PayloadStore,
    cache: Option<PageRenderCache>,
    viewport: Viewport,
    prefetch: bool,
    /// Payload registered by this window; revoked when replaced or closed.
    owned_payload: Option<DocumentRef>,
    ui: U,
    closed: bool,
}

impl<U: UiSink> Window<U> {
    /// Open a window on `bus`. A presenter asks its peer for the current
    /// state straight away.
    pub fn open(
        role: Role,
        bus: &SyncBus,
        options: WindowOptions,
        engine: Arc<dyn DocumentEngine>,
        payloads: PayloadStore,
        ui: U,
    ) -> Self {
        let channel = bus.open(&options.channel, PeerId::generate());
        let controller = PresentationController::new(role, channel);
        if role == Role::Presenter {
            controller.request_peer_state();
        }
        Self {
            controller,
            loader: DocumentLoader::new(engine, payloads.clone()),
            payloads,
            cache: None,
            viewport: options.viewport,
            prefetch: options.prefetch,
            owned_payload: None,
            ui,
            closed: false,
        }
    }

    pub fn controller(&self) -> &PresentationController {
        &self.controller
    }

    pub fn role(&self) -> Role {
        self.controller.role()
    }

    pub fn phase(&self) -> SessionPhase {
        self.controller.phase()
    }

    pub fn view(&self) -> ViewState {
        self.controller.view()
    }

    pub fn cache(&self) -> Option<&PageRenderCache> {
        self.cache.as_ref()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_loading()
    }

    pub fn ui(&self) -> &U {
        &self.ui
    }

    pub fn ui_mut(&mut self) -> &mut U {
        &mut self.ui
    }

    // -----------------------------------------------------------------------
    // Document
    // -----------------------------------------------------------------------

    /// Take ownership of a document's bytes and show it. The previous payload
    /// this window registered is revoked.
    pub fn supply_payload(&mut self, payload: Vec<u8>) -> DocumentRef {
        let location = self.payloads.register(payload);
        self.revoke_owned();
        self.owned_payload = Some(location.clone());
        self.open_document(location.clone());
        location
    }

    /// Drop the document and revoke the payload this window registered.
    pub fn clear_payload(&mut self) {
        self.controller.clear_document();
        self.process_controller_events();
        self.revoke_owned();
    }

    /// Show the document at `location` (a path or a registered blob).
    pub fn open_document(&mut self, location: DocumentRef) {
        self.controller.load_document(location);
        self.process_controller_events();
    }

    fn revoke_owned(&mut self) {
        if let Some(previous) = self.owned_payload.take() {
            self.payloads.revoke(&previous);
        }
    }

    // -----------------------------------------------------------------------
    // Navigation and session
    // -----------------------------------------------------------------------

    pub fn navigate(&mut self, target: NavTarget) -> Result<bool, ControllerError> {
        let moved = self.controller.navigate(target, None);
        self.process_controller_events();
        moved
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Delta(1))
    }

    pub fn previous(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Delta(-1))
    }

    pub fn first(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Page(1))
    }

    pub fn last(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Page(i64::from(self.view().total_pages)))
    }

    /// Ask the UI for a presenter surface and start broadcasting.
    pub fn start_presentation(&mut self) -> Result<(), ControllerError> {
        if self.controller.document().is_none() {
            return Err(ControllerError::NoDocument);
        }
        self.controller.resume();
        let popup = self.ui.open_presenter();
        let started = self.controller.start_presentation(popup);
        self.process_controller_events();
        started
    }

    pub fn end_session(&mut self) {
        self.controller.end_session();
        self.process_controller_events();
    }

    /// Leave `Ended` and browse the document locally, without broadcasting.
    /// Returns false when the session had not ended.
    pub fn resume(&mut self) -> bool {
        if !self.controller.resume() {
            return false;
        }
        self.ui.on_session_resumed();
        let page = self.controller.view().current_page;
        if let Some(cache) = self.cache.as_mut() {
            cache.set_active_page(page);
        } else if !self.loader.is_loading()
            && let Some(location) = self.controller.document().cloned()
        {
            // A presenter let go of its document when the session ended.
            self.on_document_changed(Some(location));
        }
        self.process_controller_events();
        self.forward_render_events();
        true
    }

    /// The container was resized.
    pub fn resize(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        if let Some(cache) = self.cache.as_mut() {
            cache.set_viewport(viewport);
        }
        self.forward_render_events();
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Run one turn of the event loop. Returns whether anything happened.
    pub fn tick(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let mut busy = self.controller.pump() > 0;
        busy |= self.process_controller_events();

        if let Some(outcome) = self.loader.poll() {
            self.on_load_outcome(outcome);
            busy = true;
        }

        if let Some(cache) = self.cache.as_mut() {
            busy |= cache.pump() > 0;
        }
        busy |= self.forward_render_events();
        busy
    }

    /// Tick until nothing is loading or rendering, or `timeout` passes.
    /// Returns whether the window settled.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self.tick();
            let rendering = self.cache.as_ref().is_some_and(|c| !c.is_idle());
            if !busy && !rendering && !self.loader.is_loading() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !busy {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Shut the window down: a presenter announces its departure, the
    /// channel closes, and in-flight work is cancelled.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("{} {}: closing", self.role(), self.controller.peer());
        self.controller.shutdown();
        self.loader.cancel();
        self.cache = None;
        self.revoke_owned();
    }

    fn process_controller_events(&mut self) -> bool {
        let events = self.controller.take_events();
        let any = !events.is_empty();
        for event in events {
            match event {
                ControllerEvent::DocumentChanged(location) => self.on_document_changed(location),
                ControllerEvent::ViewChanged(view) => self.on_view_changed(view),
                ControllerEvent::SessionEnded => self.on_session_ended(),
            }
        }
        any
    }

    fn on_document_changed(&mut self, location: Option<DocumentRef>) {
        self.cache = None;
        let Some(location) = location else {
            self.loader.cancel();
            return;
        };
        if let Err(e) = self.loader.start(location.clone()) {
            error!("failed to start loading {location}: {e:#}");
            self.ui.on_error(&format!("cannot load {location}: {e}"));
        }
    }

    fn on_view_changed(&mut self, view: ViewState) {
        self.ui.on_view_state(view);
        if let Some(cache) = self.cache.as_mut() {
            cache.set_active_page(view.current_page);
        }
    }

    fn on_session_ended(&mut self) {
        self.ui.on_session_ended();
        if self.role() == Role::Presenter {
            debug!("presenter {}: releasing document", self.controller.peer());
            self.loader.cancel();
            self.cache = None;
        }
    }

    fn on_load_outcome(&mut self, outcome: LoadOutcome) {
        match outcome {
            LoadOutcome::Loaded(handle) => {
                if self.controller.document() != Some(handle.location()) {
                    debug!("dropping load of {}, document moved on", handle.location());
                    return;
                }
                let total = handle.page_count();
                match PageRenderCache::new(handle, self.viewport, self.prefetch) {
                    Ok(cache) => self.cache = Some(cache),
                    Err(e) => {
                        error!("failed to start render worker: {e:#}");
                        self.ui.on_error(&format!("cannot render: {e}"));
                        return;
                    }
                }
                self.ui.on_document_metadata(total);
                self.controller.on_document_loaded(total);
                // The view may not have changed, but the new cache has nothing
                // on screen yet.
                let view = self.controller.view();
                self.process_controller_events();
                if let Some(cache) = self.cache.as_mut()
                    && cache.active_page().is_none()
                {
                    cache.set_active_page(view.current_page);
                }
            }
            LoadOutcome::Failed { location, error } => {
                warn!("{} {}: load failed", self.role(), self.controller.peer());
                self.ui.on_error(&format!("cannot load {location}: {error}"));
            }
        }
    }

    fn forward_render_events(&mut self) -> bool {
        let Some(cache) = self.cache.as_mut() else {
            return false;
        };
        let events = cache.take_events();
        let any = !events.is_empty();
        for event in events {
            match event {
                RenderEvent::Pending { page } => {
                    self.ui.on_active_page_changed(PageView::Pending { page });
                }
                RenderEvent::Displayed { page, image } => {
                    self.ui.on_active_page_changed(PageView::Ready { page, image });
                }
                RenderEvent::Failed { page } => {
                    self.ui.on_error(&format!("failed to render page {page}"));
                }
            }
        }
        any
    }
}

impl<U: UiSink> Drop for Window<U> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::engine::{LoadedDocument, PageSize};

    struct Pages(u32);

    impl LoadedDocument for Pages {
        fn page_count(&self) -> u32 {
            self.0
        }
        fn page_size(&self, _: u32) -> anyhow::Result<PageSize> {
            Ok(PageSize { width: 160.0, height: 90.0 })
        }
        fn render_page(&self, page: u32, scale: f64, _: &CancellationToken) -> anyhow::Result<Bitmap> {
            Ok(Bitmap::new((160.0 * scale) as u32, (90.0 * scale) as u32, vec![page as u8]))
        }
    }

    /// First payload byte is the page count.
    struct ByteEngine;

    impl DocumentEngine for ByteEngine {
        fn load(&self, payload: &[u8], _: &CancellationToken) -> anyhow::Result<Arc<dyn LoadedDocument>> {
            let pages = payload.first().copied().unwrap_or(0);
            anyhow::ensure!(pages > 0, "not a deck");
            Ok(Arc::new(Pages(u32::from(pages))))
        }
    }

    #[derive(Default)]
    struct Recorder {
        shown: Vec<PageView>,
        totals: Vec<u32>,
        errors: Vec<String>,
    }

    impl UiSink for Recorder {
        fn on_active_page_changed(&mut self, view: PageView) {
            self.shown.push(view);
        }
        fn on_document_metadata(&mut self, total_pages: u32) {
            self.totals.push(total_pages);
        }
        fn on_session_ended(&mut self) {}
        fn on_error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn window() -> Window<Recorder> {
        Window::open(
            Role::Controller,
            &SyncBus::new(),
            WindowOptions::default(),
            Arc::new(ByteEngine),
            PayloadStore::new(),
            Recorder::default(),
        )
    }

    fn last_ready(w: &Window<Recorder>) -> Option<u32> {
        w.ui().shown.iter().rev().find_map(|v| match v {
            PageView::Ready { page, .. } => Some(*page),
            PageView::Pending { .. } => None,
        })
    }

    #[test]
    fn supplied_payload_shows_first_page() {
        let mut w = window();
        w.supply_payload(vec![3]);
        assert!(w.run_until_idle(WAIT));

        assert_eq!(w.ui().totals, vec![3]);
        assert_eq!(w.view(), ViewState { current_page: 1, total_pages: 3 });
        assert_eq!(last_ready(&w), Some(1));
        assert!(w.cache().unwrap().contains(2), "next page prefetched");
    }

    #[test]
    fn navigation_shows_new_page() {
        let mut w = window();
        w.supply_payload(vec![3]);
        assert!(w.run_until_idle(WAIT));

        assert_eq!(w.next(), Ok(true));
        assert!(w.run_until_idle(WAIT));
        assert_eq!(last_ready(&w), Some(2));
        assert_eq!(w.last(), Ok(true));
        assert_eq!(w.next(), Ok(false));
    }

    #[test]
    fn replacing_payload_revokes_previous() {
        let mut w = window();
        let first = w.supply_payload(vec![2]);
        w.supply_payload(vec![4]);
        assert!(w.payloads.resolve(&first).is_err());
        assert!(w.run_until_idle(WAIT));
        assert_eq!(w.view().total_pages, 4);

        w.clear_payload();
        assert_eq!(w.phase(), SessionPhase::Idle);
        assert!(w.cache().is_none());
    }

    #[test]
    fn broken_payload_reports_error() {
        let mut w = window();
        w.supply_payload(vec![0]);
        assert!(w.run_until_idle(WAIT));
        assert!(w.cache().is_none());
        assert_eq!(w.ui().errors.len(), 1);
    }

    #[test]
    fn resize_rerenders_at_new_size() {
        let mut w = window();
        w.supply_payload(vec![2]);
        assert!(w.run_until_idle(WAIT));

        w.resize(Viewport::new(320.0, 180.0));
        assert!(w.run_until_idle(WAIT));
        let Some(PageView::Ready { image, .. }) = w.ui().shown.last() else {
            panic!("expected a ready page");
        };
        assert_eq!((image.width(), image.height()), (320, 180));
    }

    #[test]
    fn start_presentation_without_popup_is_blocked() {
        let mut w = window();
        w.supply_payload(vec![2]);
        assert_eq!(w.start_presentation(), Err(ControllerError::PresenterBlocked));
        assert_eq!(w.phase(), SessionPhase::DocumentLoaded);
    }
}
