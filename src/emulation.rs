//! Emulation core shared by terminal protocol implementations.
//!
//! Owns the two screens (primary and alternate), the byte codec, the key
//! translator and the refresh scheduler, and talks to the display. The
//! protocol layer ([`Vt102Emulation`]) drives it with decoded input and
//! screen operations.
//!
//! # Refreshing
//!
//! Screen mutations are not propagated to the display one by one. Instead a
//! whole cooked image is pushed when the input stream goes quiet for
//! [`BULK_TIMEOUT`], when more newlines arrived than the display has lines,
//! or when [`BULK_CNT_LIMIT`] byte blocks arrived without a newline. This
//! coalesces fine-grained updates into a few snapshots while keeping both
//! bulk output (`cat`) and interactive typing snappy. The timer is
//! cooperative: the session loop polls [`EmulationCore::refresh_deadline`]
//! and calls back on expiry.
//!
//! [`Vt102Emulation`]: crate::vt102::Vt102Emulation

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::codec::Codec;
use crate::display::TerminalDisplay;
use crate::history::HistoryType;
use crate::keymap::{Command, KeyTranslator};
use crate::screen::Screen;

/// Quiescence interval after which pending mutations are flushed.
pub const BULK_TIMEOUT: Duration = Duration::from_millis(20);
/// Byte blocks without a newline before an immediate flush.
pub const BULK_CNT_LIMIT: u32 = 20;

/// Session activity states surfaced to the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Normal,
    Bell,
    Activity,
    Silence,
}

/// Keytab commands the emulation cannot satisfy itself; forwarded upward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiCommand {
    /// Paste the current selection.
    EmitSelection,
    /// Paste the clipboard.
    EmitClipboard,
    PrevSession,
    NextSession,
    NewSession,
    RenameSession,
    ActivateMenu,
    MoveSessionLeft,
    MoveSessionRight,
}

impl UiCommand {
    pub(crate) fn from_keytab(cmd: Command) -> Option<Self> {
        Some(match cmd {
            Command::EmitSelection => UiCommand::EmitSelection,
            Command::EmitClipboard => UiCommand::EmitClipboard,
            Command::PrevSession => UiCommand::PrevSession,
            Command::NextSession => UiCommand::NextSession,
            Command::NewSession => UiCommand::NewSession,
            Command::RenameSession => UiCommand::RenameSession,
            Command::ActivateMenu => UiCommand::ActivateMenu,
            Command::MoveSessionLeft => UiCommand::MoveSessionLeft,
            Command::MoveSessionRight => UiCommand::MoveSessionRight,
            _ => return None,
        })
    }
}

/// Out-of-band events published by the emulation, drained by the session.
#[derive(Clone, Debug)]
pub enum EmulationEvent {
    /// Bytes for the PTY (reports, key input, answerback).
    SendBlock(Vec<u8>),
    StateChanged(SessionState),
    /// OSC title/icon update: `what` 0 = both, 1 = icon, 2 = title.
    TitleChanged { what: u32, caption: String },
    /// The image was resized; the PTY window size must follow.
    ImageSizeChanged { lines: usize, columns: usize },
    Ui(UiCommand),
}

pub(crate) struct EmulationCore {
    /// 0 = primary, 1 = alternate.
    screens: [Screen; 2],
    current: usize,
    pub connected: bool,
    pub codec: Codec,
    pub key_translator: Arc<KeyTranslator>,
    pub display: Arc<dyn TerminalDisplay>,
    event_tx: Sender<EmulationEvent>,

    bulk_nl_cnt: usize,
    bulk_in_cnt: u32,
    bulk_deadline: Option<Instant>,
}

impl EmulationCore {
    pub fn new(
        display: Arc<dyn TerminalDisplay>,
        event_tx: Sender<EmulationEvent>,
        key_translator: Arc<KeyTranslator>,
    ) -> Self {
        let lines = display.lines();
        let columns = display.columns();
        Self {
            screens: [Screen::new(lines, columns), Screen::new(lines, columns)],
            current: 0,
            connected: false,
            codec: Codec::default(),
            key_translator,
            display,
            event_tx,
            bulk_nl_cnt: 0,
            bulk_in_cnt: 0,
            bulk_deadline: None,
        }
    }

    // ── screens ────────────────────────────────────────────────────────────

    pub fn screen(&self) -> &Screen {
        &self.screens[self.current]
    }

    pub fn screen_mut(&mut self) -> &mut Screen {
        &mut self.screens[self.current]
    }

    pub fn screen_at_mut(&mut self, n: usize) -> &mut Screen {
        &mut self.screens[n]
    }

    pub fn current_screen(&self) -> usize {
        self.current
    }

    /// Switch between primary (0) and alternate (1). The incoming screen's
    /// selection is dropped; an in-progress selection on the old one ends.
    pub fn set_screen(&mut self, n: usize) {
        if n != self.current {
            self.screens[self.current].busy_selecting = false;
            self.current = n;
            self.screens[n].clear_selection();
        }
    }

    /// Apply an operation to both screens (shared modes, margins, resets).
    pub fn both_screens(&mut self, op: impl Fn(&mut Screen)) {
        op(&mut self.screens[0]);
        op(&mut self.screens[1]);
    }

    // ── history ────────────────────────────────────────────────────────────

    pub fn set_history(&mut self, history_type: HistoryType) {
        self.screens[0].set_scroll(history_type);
        if self.connected {
            self.show_bulk();
        }
    }

    pub fn history(&self) -> HistoryType {
        self.screens[0].get_scroll()
    }

    pub fn set_keymap(&mut self, key_translator: Arc<KeyTranslator>) {
        self.key_translator = key_translator;
    }

    // ── events out ─────────────────────────────────────────────────────────

    pub fn emit(&self, event: EmulationEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn notify_state(&self, state: SessionState) {
        self.emit(EmulationEvent::StateChanged(state));
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) {
        self.emit(EmulationEvent::SendBlock(bytes));
    }

    // ── display wiring ─────────────────────────────────────────────────────

    /// Attach or detach the display. Attaching adopts its current size and
    /// pushes a first snapshot.
    pub fn set_connect(&mut self, connected: bool) {
        self.connected = connected;
        if connected {
            self.on_image_size_change(self.display.lines(), self.display.columns());
            self.show_bulk();
        } else {
            self.screen_mut().clear_selection();
        }
    }

    /// Display geometry changed: both screens resize, the PTY follows.
    pub fn on_image_size_change(&mut self, lines: usize, columns: usize) {
        if !self.connected {
            return;
        }
        log::debug!("image size change: {lines}x{columns}");
        self.screens[0].resize_image(lines, columns);
        self.screens[1].resize_image(lines, columns);
        self.show_bulk();
        self.emit(EmulationEvent::ImageSizeChanged { lines, columns });
    }

    /// The display's scrollbar moved.
    pub fn on_history_cursor_change(&mut self, cursor: usize) {
        if self.connected {
            self.screen_mut().set_hist_cursor(cursor);
            self.show_bulk();
        }
    }

    /// Move the history view by `delta` lines (negative scrolls up into
    /// history), for the keytab scroll commands.
    pub fn scroll_view(&mut self, delta: i32) {
        let screen = self.screen_mut();
        let cursor = screen.hist_cursor() as i32 + delta;
        screen.set_hist_cursor(cursor.max(0) as usize);
        self.show_bulk();
    }

    // ── selection plumbing (display events) ────────────────────────────────

    pub fn on_selection_begin(&mut self, x: usize, y: usize) {
        if self.connected {
            self.screen_mut().set_sel_begin_xy(x, y);
            self.show_bulk();
        }
    }

    pub fn on_selection_extend(&mut self, x: usize, y: usize) {
        if self.connected {
            self.screen_mut().set_sel_extend_xy(x, y);
            self.show_bulk();
        }
    }

    /// Hand the selected text to the display.
    pub fn set_selection(&mut self, preserve_line_break: bool) {
        if self.connected
            && let Some(text) = self.screen().get_sel_text(preserve_line_break)
        {
            self.display.set_selection(&text);
        }
    }

    pub fn is_busy_selecting(&mut self, busy: bool) {
        if self.connected {
            self.screen_mut().busy_selecting = busy;
        }
    }

    pub fn test_is_selected(&self, x: usize, y: usize) -> bool {
        self.connected && self.screen().test_is_selected(x, y)
    }

    pub fn clear_selection(&mut self) {
        if self.connected {
            self.screen_mut().clear_selection();
            self.show_bulk();
        }
    }

    // ── refresh scheduling ─────────────────────────────────────────────────

    /// A new input block starts: cancel the pending flush, count the block.
    pub fn bulk_start(&mut self) {
        self.bulk_deadline = None;
        self.bulk_in_cnt += 1;
    }

    /// A newline arrived; the newline rule supersedes the block counter.
    pub fn bulk_newline(&mut self) {
        self.bulk_nl_cnt += 1;
        self.bulk_in_cnt = 0;
    }

    /// Input block finished: flush now if a counter tripped, else arm the
    /// quiescence timer.
    pub fn bulk_end(&mut self) {
        if self.bulk_nl_cnt > self.display.lines() || self.bulk_in_cnt > BULK_CNT_LIMIT {
            self.show_bulk();
        } else {
            self.bulk_deadline = Some(Instant::now() + BULK_TIMEOUT);
        }
    }

    /// When the session loop must wake up to flush, if anything is pending.
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.bulk_deadline
    }

    pub fn on_refresh_timeout(&mut self) {
        self.show_bulk();
    }

    pub fn stop_refresh_timer(&mut self) {
        self.bulk_deadline = None;
    }

    /// Push the cooked image, cursor, wrap flags and scroll state to the
    /// display; reset the coalescing counters.
    pub fn show_bulk(&mut self) {
        self.bulk_nl_cnt = 0;
        self.bulk_in_cnt = 0;
        self.bulk_deadline = None;
        if !self.connected {
            return;
        }
        let screen = self.screen();
        let image = screen.get_cooked_image();
        self.display
            .set_image(&image, screen.lines(), screen.columns());
        self.display
            .set_cursor_pos(screen.cursor_x(), screen.cursor_y());
        self.display.set_line_wrapped(screen.get_cooked_line_wrapped());
        self.display
            .set_scroll(screen.hist_cursor(), screen.hist_lines());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::doubles::RecordingDisplay;
    use crate::keymap::KeyTranslator;
    use crossbeam_channel::unbounded;

    fn core(lines: usize, columns: usize) -> (EmulationCore, Arc<RecordingDisplay>) {
        let display = Arc::new(RecordingDisplay::new(lines, columns));
        let (tx, _rx) = unbounded();
        let mut core = EmulationCore::new(
            display.clone() as Arc<dyn crate::display::TerminalDisplay>,
            tx,
            Arc::new(KeyTranslator::builtin()),
        );
        core.set_connect(true);
        (core, display)
    }

    #[test]
    fn counters_trigger_immediate_flush() {
        let (mut core, display) = core(3, 10);
        let before = *display.image_pushes.lock();
        // More newlines than display lines: flush without waiting.
        core.bulk_start();
        for _ in 0..4 {
            core.bulk_newline();
        }
        core.bulk_end();
        assert!(*display.image_pushes.lock() > before);
        assert!(core.refresh_deadline().is_none());
    }

    #[test]
    fn quiet_input_arms_the_timer() {
        let (mut core, _display) = core(3, 10);
        core.bulk_start();
        core.bulk_end();
        let deadline = core.refresh_deadline().expect("timer armed");
        assert!(deadline > Instant::now() - BULK_TIMEOUT);
        core.on_refresh_timeout();
        assert!(core.refresh_deadline().is_none());
    }

    #[test]
    fn block_counter_trips_after_limit() {
        let (mut core, display) = core(3, 10);
        let before = *display.image_pushes.lock();
        for _ in 0..=BULK_CNT_LIMIT {
            core.bulk_start();
            core.bulk_end();
        }
        assert!(*display.image_pushes.lock() > before);
    }

    #[test]
    fn screen_switch_clears_new_screens_selection() {
        let (mut core, _display) = core(3, 10);
        core.screen_at_mut(1).set_sel_begin_xy(0, 0);
        core.screen_at_mut(1).set_sel_extend_xy(3, 0);
        core.screen_mut().busy_selecting = true;
        core.set_screen(1);
        assert!(!core.screen().has_selection());
        assert_eq!(core.current_screen(), 1);
        core.set_screen(0);
        assert!(!core.screen().busy_selecting);
    }

    #[test]
    fn scroll_view_clamps_to_history() {
        let (mut core, _display) = core(2, 4);
        core.set_history(HistoryType::Buffer { max_lines: 10 });
        for _ in 0..3 {
            core.screen_mut().carriage_return();
            let at_bottom = core.screen().cursor_y() == core.screen().lines() - 1;
            if !at_bottom {
                core.screen_mut().cursor_down(1);
            } else {
                core.screen_mut().index();
            }
        }
        core.scroll_view(-100);
        assert_eq!(core.screen().hist_cursor(), 0);
        core.scroll_view(100);
        assert_eq!(core.screen().hist_cursor(), core.screen().hist_lines());
    }
}
