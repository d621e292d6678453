//! Interactive presenter in the terminal, drawn with the Kitty Graphics
//! Protocol.
//!
//! Both windows of a session live in this process and talk over one
//! [`SyncBus`]: the controller window owns the deck, and pressing `p` opens
//! the presenter window, which asks the controller for its state the way a
//! freshly opened popup would. One window at a time is shown and receives
//! keys; Tab switches.
//!
//! Layout:
//!   rows 0..term_rows-1 : page image of the focused window, centered
//!   row term_rows-1     : status line (both view states, session phase)
//!
//! All Kitty commands use `q=2` so that no responses end up in the key
//! event stream.

mod input;
mod terminal;

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyEventKind},
    terminal as crossterm_terminal,
};
use log::{debug, info, warn};

use crate::config::Config;
use crate::controller::{ControllerError, NavTarget, PresentationResource, Role, SessionPhase};
use crate::engine::DocumentEngine;
use crate::payload::PayloadStore;
use crate::sync::SyncBus;
use crate::window::{PageView, UiSink, Window, WindowOptions};

use input::{Intent, PageAccumulator, map_key_event};
use terminal::Layout;

/// Kitty image ids, one per window.
const CONTROLLER_IMAGE: u32 = 1;
const PRESENTER_IMAGE: u32 = 2;

// ---------------------------------------------------------------------------
// UI sink
// ---------------------------------------------------------------------------

/// Presenter surface handed to the controller. Releasing it asks the event
/// loop to close the presenter window.
struct PresenterPopup(Rc<Cell<bool>>);

impl PresentationResource for PresenterPopup {
    fn label(&self) -> &str {
        "presenter view"
    }

    fn release(&mut self) {
        self.0.set(false);
    }
}

#[derive(Default)]
struct TermUi {
    shown: Option<PageView>,
    total_pages: Option<u32>,
    ended: bool,
    error: Option<String>,
    dirty: bool,
    /// Set by the controller's UI only: whether a presenter should be open.
    popup: Option<Rc<Cell<bool>>>,
}

impl UiSink for TermUi {
    fn on_active_page_changed(&mut self, view: PageView) {
        self.shown = Some(view);
        self.error = None;
        self.dirty = true;
    }

    fn on_document_metadata(&mut self, total_pages: u32) {
        self.total_pages = Some(total_pages);
        self.ended = false;
        self.dirty = true;
    }

    fn on_session_ended(&mut self) {
        self.ended = true;
        self.dirty = true;
    }

    fn on_session_resumed(&mut self) {
        self.ended = false;
        self.dirty = true;
    }

    fn on_view_state(&mut self, _view: crate::controller::ViewState) {
        self.dirty = true;
    }

    fn on_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
        self.dirty = true;
    }

    fn open_presenter(&mut self) -> Option<Box<dyn PresentationResource>> {
        let flag = self.popup.as_ref()?;
        flag.set(true);
        Some(Box::new(PresenterPopup(Rc::clone(flag))))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Focus {
    Controller,
    Presenter,
}

struct Session {
    bus: SyncBus,
    engine: Arc<dyn DocumentEngine>,
    payloads: PayloadStore,
    options: WindowOptions,
    controller: Window<TermUi>,
    presenter: Option<Window<TermUi>>,
    popup_wanted: Rc<Cell<bool>>,
    focus: Focus,
    deck_name: String,
    flash: Option<String>,
}

impl Session {
    fn focused(&mut self) -> &mut Window<TermUi> {
        match (self.focus, self.presenter.as_mut()) {
            (Focus::Presenter, Some(p)) => p,
            _ => &mut self.controller,
        }
    }

    /// Open or close the presenter window to match what the controller's
    /// session asked for. Returns whether anything changed.
    fn sync_presenter(&mut self) -> bool {
        let wanted = self.popup_wanted.get();
        let ended = self.presenter.as_ref().is_some_and(|p| p.ui().ended);
        match (self.presenter.is_some(), wanted && !ended) {
            (false, true) => {
                info!("present: opening presenter window");
                self.presenter = Some(Window::open(
                    Role::Presenter,
                    &self.bus,
                    self.options.clone(),
                    Arc::clone(&self.engine),
                    self.payloads.clone(),
                    TermUi::default(),
                ));
                self.focus = Focus::Presenter;
                true
            }
            (true, false) => {
                info!("present: closing presenter window");
                self.presenter = None;
                self.popup_wanted.set(false);
                self.focus = Focus::Controller;
                let _ = terminal::delete_image(PRESENTER_IMAGE);
                true
            }
            _ => false,
        }
    }

    fn tick(&mut self) -> bool {
        let mut busy = self.controller.tick();
        if let Some(p) = self.presenter.as_mut() {
            busy |= p.tick();
        }
        busy |= self.sync_presenter();
        busy
    }

    fn resize(&mut self, layout: &Layout) {
        let viewport = layout.viewport();
        if viewport.is_empty() {
            warn!("present: terminal reports no pixel size, keeping viewport");
            return;
        }
        self.options.viewport = viewport;
        self.controller.resize(viewport);
        if let Some(p) = self.presenter.as_mut() {
            p.resize(viewport);
        }
    }

    fn is_dirty(&self) -> bool {
        self.controller.ui().dirty || self.presenter.as_ref().is_some_and(|p| p.ui().dirty)
    }

    fn status_text(&self, acc_peek: Option<u32>) -> String {
        let marker = |focus: Focus| if self.focus == focus { "*" } else { " " };
        let ctl = self.controller.view();
        let presenter = match &self.presenter {
            Some(p) => format!("{}presenter {}", marker(Focus::Presenter), p.view()),
            None => " presenter -".to_string(),
        };
        let phase = match self.controller.phase() {
            SessionPhase::Idle => "idle",
            SessionPhase::DocumentLoaded => "ready",
            SessionPhase::PresentationActive => "presenting",
            SessionPhase::Ended => "ended",
        };
        let tail = if let Some(n) = acc_peek {
            format!(":{n}_")
        } else if let Some(msg) = &self.flash {
            msg.clone()
        } else {
            "[p:present e:end r:resume Tab:switch Ng:goto q:quit]".to_string()
        };
        format!(
            " {} | {}controller {ctl} |{presenter} | {phase} | {tail}",
            self.deck_name,
            marker(Focus::Controller)
        )
    }

    fn redraw(&mut self, layout: &Layout, acc_peek: Option<u32>) -> Result<()> {
        let image_id = match self.focus {
            Focus::Presenter if self.presenter.is_some() => PRESENTER_IMAGE,
            _ => CONTROLLER_IMAGE,
        };
        let other = if image_id == CONTROLLER_IMAGE {
            PRESENTER_IMAGE
        } else {
            CONTROLLER_IMAGE
        };
        terminal::delete_image(other)?;
        terminal::clear_screen()?;

        let window = self.focused();
        let ui = window.ui();
        let placeholder = if let Some(err) = &ui.error {
            Some(err.clone())
        } else if ui.ended {
            Some("presentation ended".to_string())
        } else {
            match &ui.shown {
                Some(PageView::Ready { image, .. }) => {
                    terminal::send_image(image.png(), image_id)?;
                    terminal::place_image(layout, image_id, image.width(), image.height())?;
                    None
                }
                Some(PageView::Pending { page }) => Some(format!("rendering page {page}...")),
                None if window.is_loading() => Some("loading...".to_string()),
                None => Some("no document".to_string()),
            }
        };
        if let Some(text) = placeholder {
            terminal::delete_image(image_id)?;
            terminal::draw_placeholder(layout, &text)?;
        }

        self.controller.ui_mut().dirty = false;
        if let Some(p) = self.presenter.as_mut() {
            p.ui_mut().dirty = false;
        }
        terminal::draw_status_bar(layout, &self.status_text(acc_peek))?;
        Ok(())
    }

    /// Returns false when the user asked to quit.
    fn apply(&mut self, intent: Intent) -> bool {
        self.flash = None;
        let outcome = match intent {
            Intent::Quit => return false,
            Intent::Next => self.focused().next().map(|_| ()),
            Intent::Previous => self.focused().previous().map(|_| ()),
            Intent::First => self.focused().first().map(|_| ()),
            Intent::Last => self.focused().last().map(|_| ()),
            Intent::GoTo(n) => self.focused().navigate(NavTarget::Page(i64::from(n))).map(|_| ()),
            Intent::TogglePresentation => {
                if self.controller.phase() == SessionPhase::PresentationActive {
                    self.controller.end_session();
                    Ok(())
                } else {
                    self.controller.start_presentation()
                }
            }
            Intent::EndSession => {
                self.focused().end_session();
                Ok(())
            }
            Intent::Resume => {
                if !self.controller.resume() {
                    self.flash = Some("nothing to resume".to_string());
                }
                Ok(())
            }
            Intent::SwitchFocus => {
                if self.presenter.is_some() {
                    self.focus = match self.focus {
                        Focus::Controller => Focus::Presenter,
                        Focus::Presenter => Focus::Controller,
                    };
                    self.controller.ui_mut().dirty = true;
                }
                Ok(())
            }
            Intent::CancelInput | Intent::Digit => Ok(()),
        };
        if let Err(e) = outcome {
            debug!("present: {e}");
            self.flash = Some(match e {
                ControllerError::SessionEnded => "session ended, r to browse or p to present again".to_string(),
                other => other.to_string(),
            });
        }
        self.controller.ui_mut().dirty = true;
        true
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the interactive presenter on the Typst deck at `deck_path`.
pub fn run(deck_path: &Path, config: Config, engine: Arc<dyn DocumentEngine>) -> Result<()> {
    terminal::check_tty()?;

    let deck_name = deck_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let payload = std::fs::read(deck_path)
        .with_context(|| format!("failed to read {}", deck_path.display()))?;

    let winsize = crossterm_terminal::window_size()
        .map_err(|e| anyhow::anyhow!("failed to get terminal size: {e}"))?;
    let mut layout =
        terminal::compute_layout(winsize.columns, winsize.rows, winsize.width, winsize.height);
    let viewport = if layout.viewport().is_empty() {
        warn!("present: terminal reports no pixel size, using configured viewport");
        config.viewport
    } else {
        layout.viewport()
    };

    let options = WindowOptions {
        channel: config.channel.clone(),
        viewport,
        prefetch: config.render.prefetch,
    };
    let bus = SyncBus::new();
    let payloads = PayloadStore::new();
    let popup_wanted = Rc::new(Cell::new(false));
    let controller_ui = TermUi {
        popup: Some(Rc::clone(&popup_wanted)),
        ..TermUi::default()
    };
    let mut controller = Window::open(
        Role::Controller,
        &bus,
        options.clone(),
        Arc::clone(&engine),
        payloads.clone(),
        controller_ui,
    );
    let location = controller.supply_payload(payload);
    info!("present: {deck_name} registered as {location}");

    let mut session = Session {
        bus,
        engine,
        payloads,
        options,
        controller,
        presenter: None,
        popup_wanted,
        focus: Focus::Controller,
        deck_name,
        flash: None,
    };

    let mut guard = terminal::RawGuard::enter()?;
    let mut acc = PageAccumulator::new();
    session.redraw(&layout, None)?;

    loop {
        session.tick();
        if session.is_dirty() {
            session.redraw(&layout, acc.peek())?;
        }

        if !event::poll(config.render.poll_interval)? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind != KeyEventKind::Release => {
                debug!("event: {key:?}");
                match map_key_event(key, &mut acc) {
                    Some(intent) => {
                        if !session.apply(intent) {
                            break;
                        }
                    }
                    None => acc.reset(),
                }
                session.redraw(&layout, acc.peek())?;
            }
            Event::Resize(cols, rows) => {
                let winsize = crossterm_terminal::window_size()?;
                layout = terminal::compute_layout(cols, rows, winsize.width, winsize.height);
                debug!("resize: {cols}x{rows} cells, viewport {:?}", layout.viewport());
                session.resize(&layout);
                session.redraw(&layout, acc.peek())?;
            }
            _ => {}
        }
    }

    // Presenter first, so its departure reaches a controller that still
    // listens.
    session.presenter = None;
    session.controller.close();
    guard.cleanup();
    Ok(())
}
