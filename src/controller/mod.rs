//! Per-window presentation state and its reconciliation with the peer window.
//!
//! A `PresentationController` is the only writer of its window's
//! [`ViewState`]. Local navigation mutates it synchronously; the peer learns
//! about it through a PAGE_UPDATE on the [`SyncChannel`] and applies it when
//! its own event loop drains the channel. The two windows are therefore only
//! eventually consistent.
//!
//! The controller does no I/O of its own beyond publishing. Everything the
//! hosting window has to act on (load a document, show another page, tear
//! down the presentation view) is queued as a [`ControllerEvent`] and
//! collected with [`PresentationController::take_events`].

mod session;
mod state;

pub use session::{PresentationResource, PresenterSession};
pub use state::{NavTarget, Role, SessionPhase, ViewState};

use log::{debug, info, warn};

use crate::engine::DocumentRef;
use crate::sync::{MessageBody, PeerId, SyncChannel, SyncMessage};

/// Rejected operations. None of these leave the controller in a bad state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("no document loaded")]
    NoDocument,
    #[error("presentation session has ended")]
    SessionEnded,
    #[error("presenter window could not be opened")]
    PresenterBlocked,
}

/// Work for the hosting window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Load this document through the engine, or drop the current one.
    DocumentChanged(Option<DocumentRef>),
    /// The view state changed (local navigation, peer update, or reload).
    ViewChanged(ViewState),
    /// Presentation-only resources were released.
    SessionEnded,
}

pub struct PresentationController {
    role: Role,
    channel: SyncChannel,
    phase: SessionPhase,
    view: ViewState,
    document: Option<DocumentRef>,
    session: PresenterSession,
    events: Vec<ControllerEvent>,
    shut_down: bool,
}

impl PresentationController {
    pub fn new(role: Role, channel: SyncChannel) -> Self {
        info!("{role} {}: controller up on '{}'", channel.peer(), channel.name());
        Self {
            role,
            channel,
            phase: SessionPhase::Idle,
            view: ViewState::default(),
            document: None,
            session: PresenterSession::new(),
            events: Vec::new(),
            shut_down: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> PeerId {
        self.channel.peer()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn document(&self) -> Option<&DocumentRef> {
        self.document.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut PresenterSession {
        &mut self.session
    }

    /// Whether local navigation is published by default.
    pub fn is_broadcasting(&self) -> bool {
        self.phase == SessionPhase::PresentationActive
    }

    pub fn take_events(&mut self) -> Vec<ControllerEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Document lifecycle
    // -----------------------------------------------------------------------

    /// Make `location` this window's document. The view resets to `1/1`
    /// until [`Self::on_document_loaded`] reports the real page count. A
    /// running presentation is ended first.
    pub fn load_document(&mut self, location: DocumentRef) {
        if self.phase == SessionPhase::PresentationActive {
            self.end_session();
        }
        info!("{} {}: loading {location}", self.role, self.peer());
        self.set_document(Some(location));
        self.phase = SessionPhase::DocumentLoaded;
    }

    /// Drop the document and go back to `Idle`.
    pub fn clear_document(&mut self) {
        if self.phase == SessionPhase::PresentationActive {
            self.end_session();
        }
        if self.document.is_some() {
            info!("{} {}: document cleared", self.role, self.peer());
        }
        self.set_document(None);
        self.phase = SessionPhase::Idle;
    }

    /// Called once the engine knows the page count of the current document.
    ///
    /// Re-clamps the view. While broadcasting, a view that changed because of
    /// the new count is republished so the peer's total is corrected.
    pub fn on_document_loaded(&mut self, total_pages: u32) {
        let before = self.view;
        self.view.set_total(total_pages);
        debug!(
            "{} {}: document reports {} page(s), view {before} -> {}",
            self.role,
            self.peer(),
            total_pages,
            self.view
        );
        if self.view != before {
            self.events.push(ControllerEvent::ViewChanged(self.view));
            if self.is_broadcasting() {
                self.publish_view();
            }
        }
    }

    fn set_document(&mut self, location: Option<DocumentRef>) {
        self.document = location.clone();
        self.events.push(ControllerEvent::DocumentChanged(location));
        self.view = ViewState::default();
        self.events.push(ControllerEvent::ViewChanged(self.view));
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Move to `target`, clamped into the document.
    ///
    /// Returns `Ok(false)` when the clamped target is the current page: no
    /// state change and nothing published. `broadcast` overrides whether the
    /// change is published; by default it is while presenting.
    pub fn navigate(
        &mut self,
        target: NavTarget,
        broadcast: Option<bool>,
    ) -> Result<bool, ControllerError> {
        if self.phase == SessionPhase::Ended {
            return Err(ControllerError::SessionEnded);
        }
        if self.document.is_none() {
            return Err(ControllerError::NoDocument);
        }
        let next = self.view.resolve(target);
        if next == self.view.current_page {
            debug!("{} {}: already on page {next}", self.role, self.peer());
            return Ok(false);
        }
        self.view.current_page = next;
        debug!("{} {}: navigated to {}", self.role, self.peer(), self.view);
        self.events.push(ControllerEvent::ViewChanged(self.view));
        if broadcast.unwrap_or_else(|| self.is_broadcasting()) {
            self.publish_view();
        }
        Ok(true)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Delta(1), None)
    }

    pub fn previous(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Delta(-1), None)
    }

    pub fn first(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Page(1), None)
    }

    pub fn last(&mut self) -> Result<bool, ControllerError> {
        self.navigate(NavTarget::Page(i64::from(self.view.total_pages)), None)
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Ask the peer for its state. A freshly opened presenter does this once.
    pub fn request_peer_state(&self) {
        self.channel.publish(MessageBody::RequestState {});
    }

    /// Attach a presenter and start broadcasting.
    ///
    /// `popup` is the presenter surface the UI managed to open, or `None` if
    /// it was blocked. The current document and view are announced right
    /// away so an already-listening presenter needs no round trip.
    pub fn start_presentation(
        &mut self,
        popup: Option<Box<dyn PresentationResource>>,
    ) -> Result<(), ControllerError> {
        let Some(location) = self.document.clone() else {
            return Err(ControllerError::NoDocument);
        };
        let Some(popup) = popup else {
            return Err(ControllerError::PresenterBlocked);
        };
        if self.phase == SessionPhase::PresentationActive {
            // Replace the old surface rather than leaking it.
            self.session.release_all();
        }
        self.session.attach(popup);
        self.phase = SessionPhase::PresentationActive;
        info!("{} {}: presentation started", self.role, self.peer());
        self.channel.publish(MessageBody::FileUrl {
            url: location.to_string(),
        });
        self.publish_view();
        Ok(())
    }

    /// End the session: tell the peer, release presentation resources, and
    /// move to `Ended`. A second call does nothing.
    pub fn end_session(&mut self) {
        if self.phase == SessionPhase::Ended {
            return;
        }
        self.channel.publish(MessageBody::EndSession {});
        self.enter_ended();
    }

    /// Leave `Ended`: back to `DocumentLoaded` if a document is still held,
    /// else `Idle`. Returns false if the session had not ended.
    pub fn resume(&mut self) -> bool {
        if self.phase != SessionPhase::Ended {
            return false;
        }
        self.phase = if self.document.is_some() {
            SessionPhase::DocumentLoaded
        } else {
            SessionPhase::Idle
        };
        debug!("{} {}: resumed as {:?}", self.role, self.peer(), self.phase);
        true
    }

    /// Tear down the window's side of the protocol. A presenter announces its
    /// departure; the channel is closed either way. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.role == Role::Presenter && self.phase != SessionPhase::Ended {
            self.end_session();
        } else {
            self.session.release_all();
        }
        self.channel.close();
    }

    fn enter_ended(&mut self) {
        self.session.release_all();
        self.phase = SessionPhase::Ended;
        info!("{} {}: session ended", self.role, self.peer());
        self.events.push(ControllerEvent::SessionEnded);
    }

    fn publish_view(&self) {
        self.channel.publish(MessageBody::page_update(
            self.view.current_page,
            self.view.total_pages,
        ));
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Drain the channel and apply every message. Returns how many were
    /// handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.channel.try_next() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Apply one message from the peer. Self-echoes never get here; the
    /// channel drops them.
    pub fn handle_message(&mut self, message: SyncMessage) {
        debug!(
            "{} {}: received {} from {}",
            self.role,
            self.peer(),
            message.body.kind(),
            message.sender_id
        );
        match message.body {
            MessageBody::RequestState {} => {
                if let Some(location) = &self.document {
                    self.channel.publish(MessageBody::FileUrl {
                        url: location.to_string(),
                    });
                }
                self.publish_view();
            }
            MessageBody::FileUrl { url } => self.adopt_document(DocumentRef::new(url)),
            MessageBody::PageUpdate { page, total_pages } => {
                self.apply_page_update(page, total_pages);
            }
            MessageBody::EndSession {} => {
                if self.phase != SessionPhase::Ended {
                    self.enter_ended();
                }
            }
        }
    }

    fn adopt_document(&mut self, location: DocumentRef) {
        if self.document.as_ref() == Some(&location) {
            debug!("{} {}: already holding {location}", self.role, self.peer());
        } else {
            info!("{} {}: adopting {location} from peer", self.role, self.peer());
            self.set_document(Some(location));
        }
        self.phase = match (self.role, self.phase) {
            (Role::Presenter, _) => SessionPhase::PresentationActive,
            (Role::Controller, SessionPhase::PresentationActive) => {
                SessionPhase::PresentationActive
            }
            (Role::Controller, _) => SessionPhase::DocumentLoaded,
        };
    }

    /// The sender is authoritative: each field overwrites ours on its own.
    /// The total is applied first so the page is checked against it.
    fn apply_page_update(&mut self, page: Option<u32>, total_pages: Option<u32>) {
        let before = self.view;
        if let Some(total) = total_pages {
            self.view.total_pages = total.max(1);
        }
        match page {
            Some(p) if (1..=self.view.total_pages).contains(&p) => self.view.current_page = p,
            Some(p) => warn!(
                "{} {}: ignoring page {p} outside 1..={}",
                self.role,
                self.peer(),
                self.view.total_pages
            ),
            None => {}
        }
        if self.view.current_page > self.view.total_pages {
            self.view.current_page = self.view.total_pages;
        }
        if self.view != before {
            self.events.push(ControllerEvent::ViewChanged(self.view));
        }
    }
}

impl Drop for PresentationController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
