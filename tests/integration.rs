use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use tandem::cache::Viewport;
use tandem::cancel::CancellationToken;
use tandem::controller::{ControllerError, PresentationResource, Role, SessionPhase, ViewState};
use tandem::engine::{Bitmap, DocumentEngine, LoadedDocument, PageSize};
use tandem::payload::PayloadStore;
use tandem::sync::{DEFAULT_CHANNEL, PeerId, SyncBus};
use tandem::window::{PageView, UiSink, Window, WindowOptions};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fake engine: payload byte 0 is the page count. Pages are 160x90pt.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Probe {
    renders: AtomicUsize,
    loads: AtomicUsize,
    fail_page: Mutex<Option<u32>>,
    held: Mutex<bool>,
    released: Condvar,
}

impl Probe {
    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.released.notify_all();
    }
}

struct FakeDeck {
    pages: u32,
    probe: Arc<Probe>,
}

impl LoadedDocument for FakeDeck {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn page_size(&self, page: u32) -> Result<PageSize> {
        if page == 0 || page > self.pages {
            bail!("no page {page}");
        }
        Ok(PageSize { width: 160.0, height: 90.0 })
    }

    fn render_page(&self, page: u32, scale: f64, _: &CancellationToken) -> Result<Bitmap> {
        let mut held = self.probe.held.lock().unwrap();
        while *held {
            held = self.probe.released.wait(held).unwrap();
        }
        drop(held);
        self.probe.renders.fetch_add(1, Ordering::SeqCst);
        if *self.probe.fail_page.lock().unwrap() == Some(page) {
            bail!("ink ran out on page {page}");
        }
        let w = (160.0 * scale).round() as u32;
        let h = (90.0 * scale).round() as u32;
        Ok(Bitmap::new(w, h, vec![page as u8]))
    }
}

struct FakeEngine(Arc<Probe>);

impl DocumentEngine for FakeEngine {
    fn load(&self, payload: &[u8], _: &CancellationToken) -> Result<Arc<dyn LoadedDocument>> {
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        let Some(&pages) = payload.first().filter(|&&p| p > 0) else {
            bail!("not a deck");
        };
        Ok(Arc::new(FakeDeck {
            pages: u32::from(pages),
            probe: Arc::clone(&self.0),
        }))
    }
}

// ---------------------------------------------------------------------------
// Recording UI
// ---------------------------------------------------------------------------

struct Popup(Rc<Cell<u32>>);

impl PresentationResource for Popup {
    fn label(&self) -> &str {
        "popup"
    }

    fn release(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[derive(Default)]
struct Recorder {
    shown: Vec<PageView>,
    totals: Vec<u32>,
    ended: usize,
    resumed: usize,
    errors: Vec<String>,
    /// `Some` lets `open_presenter` succeed; counts releases.
    popup_releases: Option<Rc<Cell<u32>>>,
}

impl Recorder {
    fn allowing_popups() -> Self {
        Self {
            popup_releases: Some(Rc::new(Cell::new(0))),
            ..Self::default()
        }
    }

    fn last_ready(&self) -> Option<(u32, &Bitmap)> {
        self.shown.iter().rev().find_map(|v| match v {
            PageView::Ready { page, image } => Some((*page, image)),
            PageView::Pending { .. } => None,
        })
    }
}

impl UiSink for Recorder {
    fn on_active_page_changed(&mut self, view: PageView) {
        self.shown.push(view);
    }

    fn on_document_metadata(&mut self, total_pages: u32) {
        self.totals.push(total_pages);
    }

    fn on_session_ended(&mut self) {
        self.ended += 1;
    }

    fn on_session_resumed(&mut self) {
        self.resumed += 1;
    }

    fn on_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    fn open_presenter(&mut self) -> Option<Box<dyn PresentationResource>> {
        let releases = self.popup_releases.as_ref()?;
        Some(Box::new(Popup(Rc::clone(releases))))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Rig {
    bus: SyncBus,
    probe: Arc<Probe>,
    engine: Arc<dyn DocumentEngine>,
    payloads: PayloadStore,
}

impl Rig {
    fn new() -> Self {
        let probe = Arc::new(Probe::default());
        Self {
            bus: SyncBus::new(),
            engine: Arc::new(FakeEngine(Arc::clone(&probe))),
            probe,
            payloads: PayloadStore::new(),
        }
    }

    fn open(&self, role: Role, ui: Recorder) -> Window<Recorder> {
        let options = WindowOptions {
            viewport: Viewport::new(320.0, 180.0),
            ..WindowOptions::default()
        };
        Window::open(
            role,
            &self.bus,
            options,
            Arc::clone(&self.engine),
            self.payloads.clone(),
            ui,
        )
    }

    /// Controller with a 10-page deck loaded and a presenter following it.
    fn presenting(&self) -> (Window<Recorder>, Window<Recorder>) {
        let mut controller = self.open(Role::Controller, Recorder::allowing_popups());
        controller.supply_payload(vec![10]);
        assert!(controller.run_until_idle(WAIT));
        controller.start_presentation().unwrap();
        let mut presenter = self.open(Role::Presenter, Recorder::default());
        settle(&mut [&mut controller, &mut presenter]);
        (controller, presenter)
    }
}

/// Tick every window until none of them has anything left to do.
fn settle(windows: &mut [&mut Window<Recorder>]) {
    let deadline = Instant::now() + WAIT;
    loop {
        let mut busy = false;
        for w in windows.iter_mut() {
            busy |= w.tick();
        }
        let working = windows
            .iter()
            .any(|w| w.is_loading() || w.cache().is_some_and(|c| !c.is_idle()));
        if !busy && !working {
            return;
        }
        assert!(Instant::now() < deadline, "windows did not settle");
        if !busy {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn view(current_page: u32, total_pages: u32) -> ViewState {
    ViewState {
        current_page,
        total_pages,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn presenter_converges_after_five_nexts() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    assert_eq!(presenter.view(), view(1, 10));
    assert_eq!(presenter.phase(), SessionPhase::PresentationActive);

    for _ in 0..5 {
        assert_eq!(controller.next(), Ok(true));
    }
    settle(&mut [&mut controller, &mut presenter]);

    assert_eq!(controller.view(), view(6, 10));
    assert_eq!(presenter.view(), view(6, 10));
    assert_eq!(presenter.ui().last_ready().map(|(p, _)| p), Some(6));
}

#[test]
fn presenter_fetches_state_when_opened_late() {
    let rig = Rig::new();
    let mut controller = rig.open(Role::Controller, Recorder::allowing_popups());
    controller.supply_payload(vec![4]);
    assert!(controller.run_until_idle(WAIT));
    controller.start_presentation().unwrap();
    controller.last().unwrap();

    // Everything published so far went unheard.
    let mut presenter = rig.open(Role::Presenter, Recorder::default());
    settle(&mut [&mut controller, &mut presenter]);

    assert_eq!(presenter.view(), view(4, 4));
    assert_eq!(presenter.ui().totals, vec![4]);
    assert_eq!(presenter.ui().last_ready().map(|(p, _)| p), Some(4));
}

#[test]
fn navigation_before_presenting_stays_local() {
    let rig = Rig::new();
    let mut controller = rig.open(Role::Controller, Recorder::allowing_popups());
    controller.supply_payload(vec![5]);
    assert!(controller.run_until_idle(WAIT));

    // A listener that asks gets the state, but is not sent updates.
    let mut listener = rig.open(Role::Presenter, Recorder::default());
    settle(&mut [&mut controller, &mut listener]);
    assert_eq!(listener.view(), view(1, 5));

    controller.next().unwrap();
    settle(&mut [&mut controller, &mut listener]);
    assert_eq!(controller.view(), view(2, 5));
    assert_eq!(listener.view(), view(1, 5));
}

#[test]
fn presenter_navigation_drives_controller() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();

    presenter.last().unwrap();
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(controller.view(), view(10, 10));
}

#[test]
fn clamped_navigation_publishes_nothing() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();

    assert_eq!(controller.previous(), Ok(false));
    assert_eq!(controller.first(), Ok(false));
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(presenter.view(), view(1, 10));
}

#[test]
fn end_session_stops_both_sides() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    let releases = controller.ui().popup_releases.clone().unwrap();

    controller.end_session();
    settle(&mut [&mut controller, &mut presenter]);

    assert_eq!(releases.get(), 1);
    assert_eq!(controller.phase(), SessionPhase::Ended);
    assert_eq!(presenter.phase(), SessionPhase::Ended);
    assert_eq!(presenter.ui().ended, 1);
    assert!(presenter.cache().is_none());
    assert_eq!(controller.next(), Err(ControllerError::SessionEnded));
    assert_eq!(presenter.next(), Err(ControllerError::SessionEnded));

    // A second end is a no-op on both sides.
    controller.end_session();
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(releases.get(), 1);
    assert_eq!(presenter.ui().ended, 1);
}

#[test]
fn closing_presenter_ends_controller_session() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    let releases = controller.ui().popup_releases.clone().unwrap();

    presenter.close();
    drop(presenter);
    assert!(controller.run_until_idle(WAIT));

    assert_eq!(controller.phase(), SessionPhase::Ended);
    assert_eq!(controller.ui().ended, 1);
    assert_eq!(releases.get(), 1);
}

#[test]
fn controller_resumes_browsing_after_peer_ends() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    let observer = rig.bus.open(DEFAULT_CHANNEL, PeerId::generate());

    presenter.end_session();
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(controller.phase(), SessionPhase::Ended);
    assert_eq!(controller.next(), Err(ControllerError::SessionEnded));
    observer.dispatch(|_| {});

    assert!(controller.resume());
    assert!(!controller.resume());
    assert_eq!(controller.phase(), SessionPhase::DocumentLoaded);
    assert_eq!(controller.ui().resumed, 1);

    assert_eq!(controller.next(), Ok(true));
    assert_eq!(controller.first(), Ok(true));
    assert_eq!(controller.last(), Ok(true));
    assert!(controller.run_until_idle(WAIT));
    assert_eq!(controller.view(), view(10, 10));
    assert_eq!(controller.ui().last_ready().map(|(p, _)| p), Some(10));

    // Browsing after the session is local only.
    let mut heard = Vec::new();
    observer.dispatch(|m| heard.push(m.body));
    assert!(heard.is_empty(), "published {heard:?}");
}

#[test]
fn presenter_resume_reloads_released_deck() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    presenter.last().unwrap();
    settle(&mut [&mut controller, &mut presenter]);

    controller.end_session();
    settle(&mut [&mut controller, &mut presenter]);
    assert!(presenter.cache().is_none());

    assert!(presenter.resume());
    assert!(presenter.run_until_idle(WAIT));
    assert_eq!(presenter.phase(), SessionPhase::DocumentLoaded);
    assert_eq!(presenter.view(), view(10, 10));
    assert!(presenter.cache().is_some_and(|c| c.contains(10)));
}

#[test]
fn presenting_again_after_end() {
    let rig = Rig::new();
    let (mut controller, presenter) = rig.presenting();
    controller.end_session();
    drop(presenter);
    assert!(controller.run_until_idle(WAIT));

    controller.start_presentation().unwrap();
    assert_eq!(controller.phase(), SessionPhase::PresentationActive);
    let mut presenter = rig.open(Role::Presenter, Recorder::default());
    controller.next().unwrap();
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(presenter.view(), view(2, 10));
}

#[test]
fn blocked_popup_is_reported() {
    let rig = Rig::new();
    let mut controller = rig.open(Role::Controller, Recorder::default());
    assert_eq!(controller.start_presentation(), Err(ControllerError::NoDocument));
    controller.supply_payload(vec![3]);
    assert_eq!(
        controller.start_presentation(),
        Err(ControllerError::PresenterBlocked)
    );
    assert_eq!(controller.phase(), SessionPhase::DocumentLoaded);
}

#[test]
fn revoked_payload_never_reaches_presenter() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();

    // Replace the deck; the presenter learns the new location, then it is
    // revoked before the presenter gets to load it.
    controller.supply_payload(vec![3]);
    controller.start_presentation().unwrap();
    controller.clear_payload();
    settle(&mut [&mut controller, &mut presenter]);

    assert_eq!(controller.phase(), SessionPhase::Idle);
    assert!(presenter.cache().is_none());
}

#[test]
fn rapid_navigation_renders_each_page_once() {
    let rig = Rig::new();
    let mut controller = rig.open(Role::Controller, Recorder::default());
    controller.supply_payload(vec![6]);
    assert!(controller.run_until_idle(WAIT));

    for _ in 0..3 {
        controller.next().unwrap();
        controller.previous().unwrap();
    }
    assert!(controller.run_until_idle(WAIT));

    // Pages 1 to 3, each once: 3 is the prefetch behind page 2.
    assert_eq!(rig.probe.renders(), 3);
    let stats = controller.cache().unwrap().stats();
    assert_eq!(stats.started, 3);
    assert!(stats.hits >= 6);
}

#[test]
fn superseded_renders_never_reach_the_screen() {
    let rig = Rig::new();
    let mut controller = rig.open(Role::Controller, Recorder::default());
    controller.supply_payload(vec![6]);
    // Let the load finish, but keep the renders in flight.
    rig.probe.hold();
    let deadline = Instant::now() + WAIT;
    while controller.cache().is_none() {
        controller.tick();
        assert!(Instant::now() < deadline, "deck did not load");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(
        controller.ui().shown.last(),
        Some(PageView::Pending { page: 1 })
    ));

    controller.next().unwrap();
    controller.previous().unwrap();
    rig.probe.release();
    assert!(controller.run_until_idle(WAIT));

    let ready: Vec<u32> = controller
        .ui()
        .shown
        .iter()
        .filter_map(|v| match v {
            PageView::Ready { page, .. } => Some(*page),
            PageView::Pending { .. } => None,
        })
        .collect();
    assert_eq!(ready, vec![1]);
    let stats = controller.cache().unwrap().stats();
    assert!(stats.cancelled >= 3, "{stats:?}");
    assert!(stats.discarded >= 1, "{stats:?}");
}

#[test]
fn resize_invalidates_and_rerenders() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    let before = rig.probe.renders();

    presenter.resize(Viewport::new(640.0, 360.0));
    settle(&mut [&mut controller, &mut presenter]);

    let (page, image) = presenter.ui().last_ready().unwrap();
    assert_eq!(page, 1);
    assert_eq!((image.width(), image.height()), (640, 360));
    let cache = presenter.cache().unwrap();
    assert_eq!(cache.signature().unwrap().to_string(), "640x360");
    // Active page and prefetch, presenter only.
    assert_eq!(rig.probe.renders(), before + 2);

    // Same rounded size: nothing to do.
    presenter.resize(Viewport::new(640.2, 359.9));
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(rig.probe.renders(), before + 2);
}

#[test]
fn zero_size_viewport_defers_rendering() {
    let rig = Rig::new();
    let mut controller = rig.open(Role::Controller, Recorder::default());
    controller.resize(Viewport::new(0.0, 0.0));
    controller.supply_payload(vec![3]);
    assert!(controller.run_until_idle(WAIT));
    assert_eq!(rig.probe.renders(), 0);
    assert!(controller.ui().last_ready().is_none());

    controller.resize(Viewport::new(160.0, 90.0));
    assert!(controller.run_until_idle(WAIT));
    let (page, image) = controller.ui().last_ready().unwrap();
    assert_eq!((page, image.width(), image.height()), (1, 160, 90));
}

#[test]
fn failed_render_is_reported_and_recoverable() {
    let rig = Rig::new();
    *rig.probe.fail_page.lock().unwrap() = Some(2);
    let mut controller = rig.open(Role::Controller, Recorder::default());
    controller.supply_payload(vec![3]);
    assert!(controller.run_until_idle(WAIT));

    controller.next().unwrap();
    assert!(controller.run_until_idle(WAIT));
    assert!(controller.ui().errors.iter().any(|e| e.contains("page 2")));

    *rig.probe.fail_page.lock().unwrap() = None;
    controller.next().unwrap();
    assert!(controller.run_until_idle(WAIT));
    assert_eq!(controller.ui().last_ready().map(|(p, _)| p), Some(3));
    assert_eq!(controller.view(), view(3, 3));
}

#[test]
fn new_deck_restarts_presentation() {
    let rig = Rig::new();
    let (mut controller, mut presenter) = rig.presenting();
    controller.last().unwrap();
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(presenter.view(), view(10, 10));

    // New deck with fewer pages: loading ends the session, presenting again
    // republishes the new document.
    controller.supply_payload(vec![4]);
    assert_eq!(controller.phase(), SessionPhase::DocumentLoaded);
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(presenter.phase(), SessionPhase::Ended);

    let mut presenter = rig.open(Role::Presenter, Recorder::default());
    controller.start_presentation().unwrap();
    settle(&mut [&mut controller, &mut presenter]);
    assert_eq!(controller.view(), view(1, 4));
    assert_eq!(presenter.view(), view(1, 4));
    assert_eq!(rig.probe.loads.load(Ordering::SeqCst), 4);
}
