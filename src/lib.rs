//! VT100/VT102 terminal emulation core.
//!
//! This crate consumes the byte stream of a child process running under a
//! pseudo-terminal, interprets it according to the DEC VT100/VT102/VT52
//! escape-sequence protocol (with selected XTerm extensions), and maintains
//! a styled character grid with scrollback history. A display supplied by
//! the embedder renders snapshots of that grid; key and mouse events travel
//! the other way through a keyboard translation table to the child.
//!
//! The moving parts:
//!
//! - [`screen::Screen`] — the grid: cursor, margins, modes, tab stops,
//!   selection, scrolling into [`history`].
//! - [`vt102::Vt102Emulation`] — the decoder and dispatcher over an
//!   emulation core that owns the primary and alternate screens, the byte
//!   [`codec`], the [`keymap`] and the refresh scheduler.
//! - [`session::Session`] — binds a [`pty::PtyHost`] to an emulation and
//!   runs the cooperative event loop (PTY data, refresh timer, silence
//!   timer).
//! - [`display::TerminalDisplay`] — the rendering contract; the crate ships
//!   no renderer.
//!
//! Everything is single-threaded by design: the session serializes all
//! input, timers and display pushes, so screens and decoder state are never
//! re-entered. Only the PTY reader/writer threads live elsewhere, and they
//! communicate exclusively through channels.

pub mod cell;
pub mod codec;
pub mod config;
pub mod display;
pub mod emulation;
pub mod history;
pub mod keymap;
pub mod point;
pub mod pty;
pub mod screen;
pub mod session;
pub mod vt102;
pub mod width;

pub use cell::{Cell, ColorEntry, DEFAULT_PALETTE, TABLE_COLORS};
pub use config::TerminalConfig;
pub use display::{KeyEvent, TerminalDisplay};
pub use emulation::{EmulationEvent, SessionState, UiCommand};
pub use history::HistoryType;
pub use keymap::{KeyTranslator, KeymapRegistry};
pub use pty::{LocalPty, PtyEvent, PtyHost};
pub use screen::Screen;
pub use session::{Session, SessionEvent};
pub use vt102::Vt102Emulation;
pub use width::codepoint_width;
