//! Input processing layer: key mapping and numeric page prefix.
//!
//! Pure logic, no I/O.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

const MAX_PAGE_NUM: u32 = 99_999;

/// Accumulated page number: `12g` jumps to page 12.
pub(super) struct PageAccumulator {
    count: Option<u32>,
}

impl PageAccumulator {
    pub(super) fn new() -> Self {
        Self { count: None }
    }

    fn push_digit(&mut self, d: u32) {
        let new = self.count.unwrap_or(0).saturating_mul(10).saturating_add(d);
        if new <= MAX_PAGE_NUM {
            self.count = Some(new);
        }
    }

    fn take(&mut self) -> Option<u32> {
        self.count.take()
    }

    pub(super) fn peek(&self) -> Option<u32> {
        self.count
    }

    pub(super) fn reset(&mut self) {
        self.count = None;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Intent {
    Quit,
    Next,
    Previous,
    First,
    Last,
    GoTo(u32),
    TogglePresentation,
    EndSession,
    /// Leave an ended session and browse locally.
    Resume,
    /// Show and drive the other window.
    SwitchFocus,
    CancelInput,
    /// A digit was accumulated; caller should redraw the status line.
    Digit,
}

/// Map a key event to an `Intent`. Returns `None` for unknown keys (caller
/// should reset the accumulator).
pub(super) fn map_key_event(key: KeyEvent, acc: &mut PageAccumulator) -> Option<Intent> {
    let KeyEvent { code, modifiers, .. } = key;

    match (code, modifiers) {
        (KeyCode::Char('q'), _) | (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
            Some(Intent::Quit)
        }

        (KeyCode::Esc, _) => {
            acc.reset();
            Some(Intent::CancelInput)
        }

        (KeyCode::Char(c @ '0'..='9'), KeyModifiers::NONE) => {
            acc.push_digit(c as u32 - '0' as u32);
            Some(Intent::Digit)
        }

        (KeyCode::Right | KeyCode::Down | KeyCode::PageDown | KeyCode::Char(' '), _)
        | (KeyCode::Char('l' | 'j'), _) => Some(Intent::Next),
        (KeyCode::Left | KeyCode::Up | KeyCode::PageUp | KeyCode::Backspace, _)
        | (KeyCode::Char('h' | 'k'), _) => Some(Intent::Previous),

        (KeyCode::Home, _) => Some(Intent::First),
        (KeyCode::End, _) => Some(Intent::Last),
        (KeyCode::Char('g'), _) => match acc.take() {
            None => Some(Intent::First),
            Some(n) => Some(Intent::GoTo(n)),
        },
        (KeyCode::Char('G'), _) => match acc.take() {
            None => Some(Intent::Last),
            Some(n) => Some(Intent::GoTo(n)),
        },

        (KeyCode::Char('p'), _) => Some(Intent::TogglePresentation),
        (KeyCode::Char('e'), _) => Some(Intent::EndSession),
        (KeyCode::Char('r'), _) => Some(Intent::Resume),
        (KeyCode::Tab, _) => Some(Intent::SwitchFocus),

        _ => None,
    }
}
