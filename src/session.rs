//! Session: one PTY host bound to one emulation.
//!
//! The session owns the cooperative event loop: PTY output, the refresh
//! timer and the silence timer are serialized through [`Session::pump_once`],
//! so no screen or decoder state is ever touched from two places at once.
//! Out-of-band happenings (titles, bells, activity/silence, child exit,
//! embedder commands) surface as [`SessionEvent`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::TerminalConfig;
use crate::display::{KeyEvent, TerminalDisplay};
use crate::emulation::{EmulationEvent, SessionState, UiCommand};
use crate::keymap::KeyTranslator;
use crate::pty::{PtyEvent, PtyHost};
use crate::vt102::Vt102Emulation;

/// Events a session surfaces to the embedder.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The title or icon text changed; query [`Session::full_title`].
    TitleChanged,
    /// A keytab command the emulation cannot satisfy itself.
    Ui(UiCommand),
    /// The child exited. The session stops pumping but stays queryable.
    Done { status: Option<u32> },
}

pub struct Session {
    session_id: String,
    title: String,
    user_title: String,
    icon_text: String,
    state_icon_name: String,

    pub monitor_activity: bool,
    monitor_silence: bool,
    silence_timeout: Duration,
    silence_deadline: Option<Instant>,

    emulation: Vt102Emulation,
    emulation_rx: Receiver<EmulationEvent>,
    host: Arc<dyn PtyHost>,
    pty_rx: Receiver<PtyEvent>,
    event_tx: Sender<SessionEvent>,
    done: bool,
}

impl Session {
    /// Bind `host` to a fresh emulation attached to `display`. The window
    /// size is propagated to the child immediately.
    pub fn new(
        host: Arc<dyn PtyHost>,
        pty_rx: Receiver<PtyEvent>,
        display: Arc<dyn TerminalDisplay>,
        key_translator: Arc<KeyTranslator>,
        config: &TerminalConfig,
    ) -> (Self, Receiver<SessionEvent>) {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (mut emulation, emulation_rx) = Vt102Emulation::new(display.clone(), key_translator);
        emulation.set_history(config.history);
        emulation.set_connect(true);
        host.set_size(display.lines() as u16, display.columns() as u16);
        let mut session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            user_title: String::new(),
            icon_text: String::new(),
            state_icon_name: String::new(),
            monitor_activity: false,
            monitor_silence: false,
            silence_timeout: Duration::from_millis(config.silence_timeout_ms),
            silence_deadline: None,
            emulation,
            emulation_rx,
            host,
            pty_rx,
            event_tx,
            done: false,
        };
        // The emulation may already have queued wiring events.
        session.drain_emulation_events();
        (session, event_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn emulation(&self) -> &Vt102Emulation {
        &self.emulation
    }

    // ── titles ─────────────────────────────────────────────────────────────

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_owned();
    }

    pub fn user_title(&self) -> &str {
        &self.user_title
    }

    pub fn icon_text(&self) -> &str {
        &self.icon_text
    }

    /// Apply an OSC title update: `what` 0 changes title and icon, 1 only
    /// the icon, 2 only the title.
    pub fn set_user_title(&mut self, what: u32, caption: &str) {
        if what == 0 || what == 2 {
            self.user_title = caption.to_owned();
        }
        if what == 0 || what == 1 {
            self.icon_text = caption.to_owned();
        }
        let _ = self.event_tx.send(SessionEvent::TitleChanged);
    }

    /// Tab/window caption: the OSC title, decorated with the static title.
    pub fn full_title(&self) -> String {
        if self.user_title.is_empty() {
            self.title.clone()
        } else if self.title.is_empty() {
            self.user_title.clone()
        } else {
            format!("{} - {}", self.user_title, self.title)
        }
    }

    /// Record a state-icon change; true when the name actually changed.
    pub fn test_and_set_state_icon(&mut self, name: &str) -> bool {
        if name != self.state_icon_name {
            self.state_icon_name = name.to_owned();
            true
        } else {
            false
        }
    }

    // ── monitoring ─────────────────────────────────────────────────────────

    pub fn set_monitor_activity(&mut self, monitor: bool) {
        self.monitor_activity = monitor;
    }

    pub fn monitor_silence(&self) -> bool {
        self.monitor_silence
    }

    /// Watch for output pauses: after `silence_timeout` without activity a
    /// `Silence` state event fires (and keeps firing while quiet).
    pub fn set_monitor_silence(&mut self, monitor: bool) {
        if self.monitor_silence == monitor {
            return;
        }
        self.monitor_silence = monitor;
        self.silence_deadline = if monitor {
            Some(Instant::now() + self.silence_timeout)
        } else {
            None
        };
    }

    // ── display-side input, forwarded through the emulation ────────────────

    pub fn on_key_press(&mut self, ev: &KeyEvent) {
        self.emulation.on_key_press(ev);
        self.drain_emulation_events();
    }

    pub fn on_mouse(&mut self, cb: u8, cx: u8, cy: u8) {
        self.emulation.on_mouse(cb, cx, cy);
        self.drain_emulation_events();
    }

    pub fn on_image_size_change(&mut self, lines: usize, columns: usize) {
        self.emulation.on_image_size_change(lines, columns);
        self.drain_emulation_events();
    }

    pub fn on_history_cursor_change(&mut self, cursor: usize) {
        self.emulation.on_history_cursor_change(cursor);
    }

    pub fn on_selection_begin(&mut self, x: usize, y: usize) {
        self.emulation.on_selection_begin(x, y);
    }

    pub fn on_selection_extend(&mut self, x: usize, y: usize) {
        self.emulation.on_selection_extend(x, y);
    }

    pub fn on_selection_end(&mut self, preserve_line_break: bool) {
        self.emulation.set_selection(preserve_line_break);
    }

    pub fn clear_selection(&mut self) {
        self.emulation.clear_selection();
    }

    // ── the event loop ─────────────────────────────────────────────────────

    /// Process one wait-worth of events: PTY data, child exit, or a timer
    /// expiry. Returns `false` once the session is done.
    pub fn pump_once(&mut self) -> bool {
        if self.done {
            return false;
        }
        let deadline = match (self.emulation.refresh_deadline(), self.silence_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let event = match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match self.pty_rx.recv_timeout(timeout) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        self.finish(None);
                        return false;
                    }
                }
            }
            None => match self.pty_rx.recv() {
                Ok(event) => Some(event),
                Err(_) => {
                    self.finish(None);
                    return false;
                }
            },
        };
        match event {
            Some(PtyEvent::Data(data)) => self.emulation.on_rcv_block(&data),
            Some(PtyEvent::Exit(status)) => {
                self.finish(status);
                return false;
            }
            None => {
                let now = Instant::now();
                if self
                    .emulation
                    .refresh_deadline()
                    .is_some_and(|d| d <= now)
                {
                    self.emulation.on_refresh_timeout();
                }
                if self.silence_deadline.is_some_and(|d| d <= now) {
                    self.silence_deadline = Some(now + self.silence_timeout);
                    let _ = self
                        .event_tx
                        .send(SessionEvent::StateChanged(SessionState::Silence));
                }
            }
        }
        self.drain_emulation_events();
        !self.done
    }

    /// Pump until the child exits.
    pub fn run(&mut self) {
        while self.pump_once() {}
    }

    fn drain_emulation_events(&mut self) {
        while let Ok(event) = self.emulation_rx.try_recv() {
            match event {
                EmulationEvent::SendBlock(bytes) => {
                    if !self.done && !bytes.is_empty() {
                        self.host.send_bytes(&bytes);
                    }
                }
                EmulationEvent::StateChanged(state) => self.notify_session_state(state),
                EmulationEvent::TitleChanged { what, caption } => {
                    self.set_user_title(what, &caption);
                }
                EmulationEvent::ImageSizeChanged { lines, columns } => {
                    self.host.set_size(lines as u16, columns as u16);
                }
                EmulationEvent::Ui(cmd) => {
                    let _ = self.event_tx.send(SessionEvent::Ui(cmd));
                }
            }
        }
    }

    fn notify_session_state(&mut self, state: SessionState) {
        if state == SessionState::Activity {
            if self.monitor_silence {
                self.silence_deadline = Some(Instant::now() + self.silence_timeout);
            }
            if !self.monitor_activity {
                return;
            }
        }
        let _ = self.event_tx.send(SessionEvent::StateChanged(state));
    }

    /// Child exit: stop the timers, drop the selection, announce `Done`.
    fn finish(&mut self, status: Option<u32>) {
        if self.done {
            return;
        }
        self.done = true;
        self.silence_deadline = None;
        // Flush whatever the coalescing timer was still holding, then stop.
        self.emulation.on_refresh_timeout();
        self.emulation.stop_refresh_timer();
        self.emulation.clear_selection();
        let _ = self.event_tx.send(SessionEvent::Done { status });
    }
}
