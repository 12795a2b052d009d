//! The display contract.
//!
//! The core never renders; it pushes cooked-image snapshots and state to an
//! implementation of [`TerminalDisplay`] supplied by the embedder, and
//! receives key, mouse and selection events as plain method calls on the
//! emulation. The trait takes `&self` so implementations sit comfortably
//! behind `Arc` and manage their own interior mutability.

use crate::cell::Cell;
use crate::keymap::KeySym;

/// What the embedder's renderer must provide.
pub trait TerminalDisplay: Send + Sync {
    /// Current grid height in character cells.
    fn lines(&self) -> usize;
    /// Current grid width in character cells.
    fn columns(&self) -> usize;

    /// Receive a fresh cooked-image snapshot. The image is never mutated by
    /// the core after this call.
    fn set_image(&self, image: &[Vec<Cell>], lines: usize, columns: usize);
    fn set_cursor_pos(&self, x: usize, y: usize);
    fn set_line_wrapped(&self, wrapped: Vec<bool>);
    /// Scrollbar state: view position and total history lines.
    fn set_scroll(&self, cursor: usize, total: usize);
    /// Selected text, ready for the clipboard.
    fn set_selection(&self, text: &str);
    fn bell(&self);
    /// When `false`, the display forwards mouse clicks to the emulation
    /// instead of using them for its own click-to-select.
    fn set_mouse_marks(&self, on: bool);
}

/// A key press forwarded by the display.
#[derive(Clone, Debug, Default)]
pub struct KeyEvent {
    pub sym: KeySym,
    /// Text the key produces, if any ("a", "A", "é", ...).
    pub text: String,
    pub control: bool,
    pub shift: bool,
    pub alt: bool,
}

impl KeyEvent {
    pub fn named(sym: KeySym) -> Self {
        Self {
            sym,
            ..Self::default()
        }
    }

    pub fn character(c: char) -> Self {
        Self {
            sym: crate::keymap::keys::from_char(c).unwrap_or(0),
            text: c.to_string(),
            ..Self::default()
        }
    }

    pub fn with_control(mut self) -> Self {
        self.control = true;
        self
    }

    pub fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn with_alt(mut self) -> Self {
        self.alt = true;
        self
    }
}
