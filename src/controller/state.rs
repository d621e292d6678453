//! View state and session phase of one window.

use std::fmt;

/// Page position of one window. `current_page` is always in
/// `1..=total_pages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewState {
    pub current_page: u32,
    pub total_pages: u32,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: 1,
        }
    }
}

impl ViewState {
    /// Clamp an arbitrary (possibly negative) page number into range.
    pub fn clamp(&self, target: i64) -> u32 {
        let total = i64::from(self.total_pages.max(1));
        // Lossless: the result lies in 1..=u32::MAX.
        target.clamp(1, total) as u32
    }

    pub fn resolve(&self, target: NavTarget) -> u32 {
        match target {
            NavTarget::Page(n) => self.clamp(n),
            NavTarget::Delta(d) => self.clamp(i64::from(self.current_page).saturating_add(d)),
        }
    }

    /// Set a new page count, pulling `current_page` back into range.
    pub(super) fn set_total(&mut self, total_pages: u32) {
        self.total_pages = total_pages.max(1);
        self.current_page = self.current_page.clamp(1, self.total_pages);
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current_page, self.total_pages)
    }
}

/// Where to navigate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavTarget {
    /// Absolute, 1-based.
    Page(i64),
    Delta(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// No document.
    Idle,
    DocumentLoaded,
    /// A presenter window is attached and navigation is broadcast.
    PresentationActive,
    /// Presenter closed or session ended explicitly.
    Ended,
}

/// Which side of the session a window plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Owns the payload; starts and stops presentations.
    Controller,
    /// Opened by the controller; follows the controller's document.
    Presenter,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Controller => "controller",
            Role::Presenter => "presenter",
        })
    }
}
