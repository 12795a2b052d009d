//! VT102 terminal protocol: tokenizer, dispatch, charsets, reports.
//!
//! This is the protocol layer on top of [`EmulationCore`]: it tokenizes the
//! decoded input stream into VT/ANSI control tokens and maps each token to
//! an operation on the current [`Screen`] or on the emulation itself.
//!
//! The tokenizer keeps no explicit state machine; the scanned prefix
//! (`pbuf`) plus the incoming character decide the action, checked in a
//! fixed priority order that mirrors the VT100 analyzer states. Tokens are
//! small typed values; their packed 32-bit form
//! (`N << 16 | A << 8 | T`) appears in diagnostics only.
//!
//! [`Screen`]: crate::screen::Screen

use std::io::Write;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::cell::{RE_BLINK, RE_BOLD, RE_REVERSE, RE_UNDERLINE};
use crate::codec::CodecKind;
use crate::display::{KeyEvent, TerminalDisplay};
use crate::emulation::{EmulationCore, EmulationEvent, SessionState, UiCommand};
use crate::history::HistoryType;
use crate::keymap::{keys, Command, KeyTranslator};
use crate::screen::{
    Screen, MODE_CURSOR, MODE_INSERT, MODE_NEWLINE, MODE_ORIGIN, MODE_SCREEN, MODE_WRAP,
    MODES_SCREEN,
};

// Emulation-level modes, continuing the per-screen mode numbering.
pub const MODE_APP_SCREEN: usize = MODES_SCREEN;
pub const MODE_APP_CU_KEYS: usize = MODES_SCREEN + 1;
pub const MODE_APP_KEYPAD: usize = MODES_SCREEN + 2;
pub const MODE_MOUSE_1000: usize = MODES_SCREEN + 3;
/// ANSI vs. VT52 escape language.
pub const MODE_ANSI: usize = MODES_SCREEN + 4;
const PARM_MODES: usize = 5;

const ESC: u32 = 0x1B;
const CAN: u32 = 0x18;
const SUB: u32 = 0x1A;
const BEL: u32 = 0x07;

// Character classes used while scanning.
const CTL: u8 = 1;
const CHR: u8 = 2;
/// Final bytes of two-parameter CSI sequences.
const CPN: u8 = 4;
const DIG: u8 = 8;
/// Charset-selection intermediates.
const SCS: u8 = 16;
/// Intermediates that keep a two-byte prefix alive.
const GRP: u8 = 32;

fn build_char_class() -> [u8; 256] {
    let mut tbl = [0u8; 256];
    let mut i = 0;
    while i < 32 {
        tbl[i] |= CTL;
        i += 1;
    }
    let mut i = 32;
    while i < 256 {
        tbl[i] |= CHR;
        i += 1;
    }
    for b in b"@ABCDGHLMPXcdfry" {
        tbl[*b as usize] |= CPN;
    }
    for b in b"0123456789" {
        tbl[*b as usize] |= DIG;
    }
    for b in b"()+*%" {
        tbl[*b as usize] |= SCS;
    }
    for b in b"()+*#[]%" {
        tbl[*b as usize] |= GRP;
    }
    tbl
}

/// The glyphs the DEC special graphics charset substitutes for 0x5F..0x7E.
const VT100_GRAPHICS: [u32; 32] = [
    0x0020, 0x25C6, 0x2592, 0x2409, 0x240C, 0x240D, 0x240A, 0x00B0, //
    0x00B1, 0x2424, 0x240B, 0x2518, 0x2510, 0x250C, 0x2514, 0x253C, //
    0x23BA, 0x23BB, 0x2500, 0x23BC, 0x23BD, 0x251C, 0x2524, 0x2534, //
    0x252C, 0x2502, 0x2264, 0x2265, 0x03C0, 0x2260, 0x00A3, 0x00B7,
];

const DEFAULT_TRANS: [char; 7] = ['[', '\\', ']', '{', '|', '}', '~'];

/// Per-screen charset state for the VT100 code-page translation layer.
#[derive(Clone)]
struct CharCodes {
    /// Designated charsets for G0..G3.
    charset: [u8; 4],
    /// Invoked slot.
    cu_cs: usize,
    graphic: bool,
    pound: bool,
    /// National replacement characters for `[ \ ] { | } ~`.
    trans: [char; 7],
    sa_graphic: bool,
    sa_pound: bool,
    sa_trans: [char; 7],
}

impl CharCodes {
    fn new() -> Self {
        Self {
            charset: *b"BBBB",
            cu_cs: 0,
            graphic: false,
            pound: false,
            trans: DEFAULT_TRANS,
            sa_graphic: false,
            sa_pound: false,
            sa_trans: DEFAULT_TRANS,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn use_slot(&mut self, n: usize) {
        let n = n & 3;
        self.cu_cs = n;
        self.graphic = self.charset[n] == b'0';
        self.pound = self.charset[n] == b'A';
        self.trans = match self.charset[n] {
            b'K' => ['Ä', 'Ö', 'Ü', 'ä', 'ö', 'ü', 'ß'], // German
            b'R' => ['°', 'ç', '§', 'é', 'ù', 'è', '¨'], // French
            _ => DEFAULT_TRANS,
        };
    }
}

/// A scanned token. The payload carries the final byte and, where the shape
/// includes them, parameter values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    Chr(u32),
    Ctl(u8),
    Esc(u8),
    EscCs(u8, u8),
    EscDe(u8),
    CsiPs(u8, u16),
    CsiPn(u8),
    CsiPr(u8, u16),
    Vt52(u8),
    CsiPg(u8),
}

impl Token {
    /// Stable packed form `N << 16 | A << 8 | T`, used in diagnostics.
    fn packed(self) -> u32 {
        let (t, a, n): (u32, u32, u32) = match self {
            Token::Chr(_) => (0, 0, 0),
            Token::Ctl(a) => (1, a.into(), 0),
            Token::Esc(a) => (2, a.into(), 0),
            Token::EscCs(a, b) => (3, a.into(), b.into()),
            Token::EscDe(a) => (4, a.into(), 0),
            Token::CsiPs(a, n) => (5, a.into(), n.into()),
            Token::CsiPn(a) => (6, a.into(), 0),
            Token::CsiPr(a, n) => (7, a.into(), n.into()),
            Token::Vt52(a) => (8, a.into(), 0),
            Token::CsiPg(a) => (9, a.into(), 0),
        };
        (n << 16) | (a << 8) | t
    }
}

/// Printer-passthrough pipe plus the matcher that spots the `ESC [4i`
/// off-sequence in the raw byte stream.
struct PrinterPipe {
    child: std::process::Child,
    match_len: usize,
}

const PRINTER_OFF_SEQ: &[u8] = b"\x1b[4i";

/// The complete VT102 emulation: protocol state over an [`EmulationCore`].
pub struct Vt102Emulation {
    core: EmulationCore,
    tbl: [u8; 256],
    pbuf: Vec<u32>,
    argv: Vec<u32>,
    curr_parm: [bool; PARM_MODES],
    save_parm: [bool; PARM_MODES],
    charsets: [CharCodes; 2],
    hold_screen: bool,
    printer: Option<PrinterPipe>,
}

impl Vt102Emulation {
    /// Build an emulation bound to `display`; the receiver yields the
    /// out-of-band [`EmulationEvent`]s for the session to drain.
    pub fn new(
        display: Arc<dyn TerminalDisplay>,
        key_translator: Arc<KeyTranslator>,
    ) -> (Self, Receiver<EmulationEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let core = EmulationCore::new(display, tx, key_translator);
        let mut emulation = Self {
            core,
            tbl: build_char_class(),
            pbuf: Vec::new(),
            argv: vec![0],
            curr_parm: [false; PARM_MODES],
            save_parm: [false; PARM_MODES],
            charsets: [CharCodes::new(), CharCodes::new()],
            hold_screen: false,
            printer: None,
        };
        emulation.reset();
        (emulation, rx)
    }

    /// Full reset (RIS): token state, modes, charsets, both screens, codec.
    pub fn reset(&mut self) {
        self.reset_token();
        self.reset_modes();
        self.charsets[0].reset();
        self.core.screen_at_mut(0).reset();
        self.charsets[1].reset();
        self.core.screen_at_mut(1).reset();
        self.core.codec.set_kind(CodecKind::Locale);
    }

    // ── delegation to the core ─────────────────────────────────────────────

    pub fn screen(&self) -> &Screen {
        self.core.screen()
    }

    pub fn set_connect(&mut self, connected: bool) {
        self.core.set_connect(connected);
        if connected {
            // Refresh the display's idea of who owns mouse clicks.
            if self.get_emu_mode(MODE_MOUSE_1000) {
                self.set_mode(MODE_MOUSE_1000);
            } else {
                self.reset_mode(MODE_MOUSE_1000);
            }
        }
    }

    pub fn set_history(&mut self, history_type: HistoryType) {
        self.core.set_history(history_type);
    }

    pub fn history(&self) -> HistoryType {
        self.core.history()
    }

    pub fn set_keymap(&mut self, key_translator: Arc<KeyTranslator>) {
        self.core.set_keymap(key_translator);
    }

    pub fn on_image_size_change(&mut self, lines: usize, columns: usize) {
        self.core.on_image_size_change(lines, columns);
    }

    pub fn on_history_cursor_change(&mut self, cursor: usize) {
        self.core.on_history_cursor_change(cursor);
    }

    pub fn on_selection_begin(&mut self, x: usize, y: usize) {
        self.core.on_selection_begin(x, y);
    }

    pub fn on_selection_extend(&mut self, x: usize, y: usize) {
        self.core.on_selection_extend(x, y);
    }

    pub fn set_selection(&mut self, preserve_line_break: bool) {
        self.core.set_selection(preserve_line_break);
    }

    pub fn is_busy_selecting(&mut self, busy: bool) {
        self.core.is_busy_selecting(busy);
    }

    pub fn test_is_selected(&self, x: usize, y: usize) -> bool {
        self.core.test_is_selected(x, y)
    }

    pub fn clear_selection(&mut self) {
        self.core.clear_selection();
    }

    pub fn scroll_view(&mut self, delta: i32) {
        self.core.scroll_view(delta);
    }

    pub fn refresh_deadline(&self) -> Option<std::time::Instant> {
        self.core.refresh_deadline()
    }

    pub fn on_refresh_timeout(&mut self) {
        self.core.on_refresh_timeout();
    }

    pub fn stop_refresh_timer(&mut self) {
        self.core.stop_refresh_timer();
    }

    pub fn hold_screen(&self) -> bool {
        self.hold_screen
    }

    fn screen_mut(&mut self) -> &mut Screen {
        self.core.screen_mut()
    }

    // ── incoming bytes ─────────────────────────────────────────────────────

    /// Process one block of PTY output: printer interception, byte
    /// decoding, tokenizing, refresh bookkeeping.
    pub fn on_rcv_block(&mut self, block: &[u8]) {
        self.core.notify_state(SessionState::Activity);
        self.core.bulk_start();
        let block = if self.printer.is_some() {
            self.printer_intercept(block)
        } else {
            block.to_vec()
        };
        let mut decoded = Vec::new();
        for &byte in &block {
            decoded.clear();
            self.core.codec.decode_into(byte, &mut decoded);
            for i in 0..decoded.len() {
                self.on_rcv_char(decoded[i]);
            }
            if byte == b'\n' {
                self.core.bulk_newline();
            }
        }
        self.core.bulk_end();
    }

    fn reset_token(&mut self) {
        self.pbuf.clear();
        self.argv.clear();
        self.argv.push(0);
    }

    fn add_digit(&mut self, digit: u32) {
        if let Some(last) = self.argv.last_mut() {
            *last = last.saturating_mul(10).saturating_add(digit);
        }
    }

    fn class(&self, c: u32) -> u8 {
        if c < 256 {
            self.tbl[c as usize]
        } else {
            0
        }
    }

    fn in_osc(&self) -> bool {
        self.pbuf.len() >= 2 && self.pbuf[1] == u32::from(b']')
    }

    /// Tokenize one decoded character.
    ///
    /// The scanned prefix plus the incoming character decide the action;
    /// the guards must be checked in this order.
    pub fn on_rcv_char(&mut self, cc: u32) {
        if cc == 127 {
            return; // DEL: ignored on input
        }
        // Control characters act immediately, even inside escape sequences
        // (but not inside an OSC string, which swallows everything through
        // BEL). CAN, SUB and ESC abort the sequence in progress.
        if cc < 32 && !self.in_osc() {
            if cc == CAN || cc == SUB || cc == ESC {
                self.reset_token();
            }
            if cc != ESC {
                self.tau(Token::Ctl((cc as u8) + b'@'), 0, None);
                return;
            }
        }
        self.pbuf.push(cc);
        if self.get_emu_mode(MODE_ANSI) {
            self.scan_ansi(cc);
        } else {
            self.scan_vt52(cc);
        }
    }

    fn scan_ansi(&mut self, cc: u32) {
        let p = self.pbuf.len();
        let s = &self.pbuf;
        // Incomplete prefixes: wait for more input.
        if p == 1 && s[0] == ESC {
            return;
        }
        if p == 2 && self.class(s[1]) & GRP == GRP {
            return;
        }
        if self.in_osc() {
            if cc == BEL {
                self.xterm_hack();
                self.reset_token();
            }
            return;
        }
        if p == 3 && (s[2] == u32::from(b'?') || s[2] == u32::from(b'>')) {
            return;
        }
        // Complete tokens.
        if p == 1 && cc >= 32 {
            let translated = self.apply_charset(cc);
            self.tau(Token::Chr(translated), 0, None);
            self.reset_token();
            return;
        }
        if p == 2 && s[0] == ESC {
            let a = (s[1] & 0xFF) as u8;
            self.tau(Token::Esc(a), 0, None);
            self.reset_token();
            return;
        }
        if p == 3 && self.class(s[1]) & SCS == SCS {
            let (a, b) = ((s[1] & 0xFF) as u8, (s[2] & 0xFF) as u8);
            self.tau(Token::EscCs(a, b), 0, None);
            self.reset_token();
            return;
        }
        if p == 3 && s[1] == u32::from(b'#') {
            let a = (s[2] & 0xFF) as u8;
            self.tau(Token::EscDe(a), 0, None);
            self.reset_token();
            return;
        }
        if p >= 3
            && s[2] != u32::from(b'?')
            && s[2] != u32::from(b'>')
            && self.class(cc) & CPN == CPN
        {
            let arg0 = self.argv[0];
            let arg1 = if self.argv.len() > 1 {
                Some(self.argv[1])
            } else {
                None
            };
            self.tau(Token::CsiPn((cc & 0xFF) as u8), arg0, arg1);
            self.reset_token();
            return;
        }
        if p >= 3 && self.class(cc) & DIG == DIG {
            self.add_digit(cc - u32::from(b'0'));
            return;
        }
        if p >= 3 && cc == u32::from(b';') {
            self.argv.push(0);
            return;
        }
        // Terminal byte of a CSI sequence.
        if p < 3 {
            self.report_error_token(Token::Chr(cc), 0, None);
            self.reset_token();
            return;
        }
        let private = self.pbuf[2];
        let final_byte = (cc & 0xFF) as u8;
        let args = std::mem::take(&mut self.argv);
        if private == u32::from(b'>') {
            self.tau(Token::CsiPg(final_byte), 0, None);
        } else {
            for arg in args {
                if private == u32::from(b'?') {
                    self.tau(Token::CsiPr(final_byte, (arg & 0xFFFF) as u16), arg, None);
                } else {
                    self.tau(Token::CsiPs(final_byte, (arg & 0xFFFF) as u16), arg, None);
                }
            }
        }
        self.reset_token();
    }

    fn scan_vt52(&mut self, _cc: u32) {
        let p = self.pbuf.len();
        let s = &self.pbuf;
        if p == 1 && s[0] == ESC {
            return;
        }
        if p == 1 {
            let c = s[0];
            self.tau(Token::Chr(c), 0, None);
            self.reset_token();
            return;
        }
        if (p == 2 || p == 3) && s[1] == u32::from(b'Y') {
            return; // direct cursor address: two coordinate bytes follow
        }
        if p < 4 {
            let a = (s[1] & 0xFF) as u8;
            self.tau(Token::Vt52(a), 0, None);
            self.reset_token();
            return;
        }
        let (y, x) = (s[2], s[3]);
        self.tau(Token::Vt52(b'Y'), y, Some(x));
        self.reset_token();
    }

    /// OSC `ESC ] Ps ; Pt BEL`: window title/icon update, dispatched as an
    /// out-of-band title event.
    fn xterm_hack(&mut self) {
        // pbuf holds ESC ] ... BEL at this point.
        let body = &self.pbuf[2..self.pbuf.len().saturating_sub(1)];
        let mut arg = 0u32;
        let mut i = 0;
        while i < body.len() && (u32::from(b'0')..=u32::from(b'9')).contains(&body[i]) {
            arg = arg.saturating_mul(10).saturating_add(body[i] - u32::from(b'0'));
            i += 1;
        }
        if i >= body.len() || body[i] != u32::from(b';') {
            log::debug!("malformed OSC sequence dropped");
            return;
        }
        let caption: String = body[i + 1..]
            .iter()
            .filter_map(|&c| char::from_u32(c))
            .collect();
        self.core.emit(EmulationEvent::TitleChanged { what: arg, caption });
    }

    // ── token interpretation ───────────────────────────────────────────────

    /// Assign meaning to a scanned token: an operation on the current
    /// screen or on the emulation itself. Unknown tokens are logged and
    /// dropped.
    fn tau(&mut self, token: Token, p: u32, q: Option<u32>) {
        use Token::*;
        match token {
            Chr(c) => self.screen_mut().show_character(c),

            Ctl(b'E') => self.report_answer_back(), // ENQ
            Ctl(b'G') => {
                // BEL
                if self.core.connected {
                    self.core.display.bell();
                    self.core.notify_state(SessionState::Bell);
                }
            }
            Ctl(b'H') => self.screen_mut().back_space(),
            Ctl(b'I') => self.screen_mut().tabulate(),
            Ctl(b'J') | Ctl(b'K') | Ctl(b'L') => self.screen_mut().new_line(),
            Ctl(b'M') => self.screen_mut().carriage_return(),
            Ctl(b'N') => self.use_charset(1), // SO
            Ctl(b'O') => self.use_charset(0), // SI
            // Aborted sequences leave a visible mark.
            Ctl(b'X') | Ctl(b'Z') => self.screen_mut().show_character(0x2592),
            // NUL..EOT, ACK, DLE..ETB (XON/XOFF included), EM, FS..US: ignored.
            Ctl(_) => {}

            Esc(b'D') => self.screen_mut().index(),
            Esc(b'E') => self.screen_mut().next_line(),
            Esc(b'H') => self.screen_mut().change_tab_stop(true),
            Esc(b'M') => self.screen_mut().reverse_index(),
            Esc(b'Z') => self.report_terminal_type(),
            Esc(b'c') => self.reset(),
            Esc(b'n') => self.use_charset(2),
            Esc(b'o') => self.use_charset(3),
            Esc(b'7') => self.save_cursor(),
            Esc(b'8') => self.restore_cursor(),
            Esc(b'=') => self.set_mode(MODE_APP_KEYPAD),
            Esc(b'>') => self.reset_mode(MODE_APP_KEYPAD),
            Esc(b'<') => self.set_mode(MODE_ANSI),

            EscCs(slot @ (b'(' | b')' | b'*' | b'+'), cs @ (b'0' | b'A' | b'B' | b'K' | b'R')) => {
                self.set_charset(charset_slot(slot), cs);
            }
            EscCs(b'%', b'G') => self.core.codec.set_kind(CodecKind::Utf8),
            EscCs(b'%', b'@') => self.core.codec.set_kind(CodecKind::Locale),

            // Double-height/width line attributes: accepted and ignored.
            EscDe(b'3') | EscDe(b'4') | EscDe(b'5') | EscDe(b'6') => {}
            EscDe(b'8') => self.screen_mut().help_align(),

            CsiPs(b'K', 0) => self.screen_mut().clear_to_end_of_line(),
            CsiPs(b'K', 1) => self.screen_mut().clear_to_begin_of_line(),
            CsiPs(b'K', 2) => self.screen_mut().clear_entire_line(),
            CsiPs(b'J', 0) => self.screen_mut().clear_to_end_of_screen(),
            CsiPs(b'J', 1) => self.screen_mut().clear_to_begin_of_screen(),
            CsiPs(b'J', 2) => self.screen_mut().clear_entire_screen(),
            CsiPs(b'g', 0) => self.screen_mut().change_tab_stop(false),
            CsiPs(b'g', 3) => self.screen_mut().clear_tab_stops(),
            CsiPs(b'h', 4) => self.screen_mut().set_mode(MODE_INSERT),
            CsiPs(b'h', 20) => self.set_mode(MODE_NEWLINE),
            CsiPs(b'i', 0) | CsiPs(b'i', 4) => {} // IGNORED: attached printer
            CsiPs(b'i', 5) => self.set_printer_mode(true),
            CsiPs(b'l', 4) => self.screen_mut().reset_mode(MODE_INSERT),
            CsiPs(b'l', 20) => self.reset_mode(MODE_NEWLINE),
            CsiPs(b's', 0) => self.save_cursor(),
            CsiPs(b'u', 0) => self.restore_cursor(),

            CsiPs(b'm', 0) => self.screen_mut().set_default_rendition(),
            CsiPs(b'm', 1) => self.screen_mut().set_rendition(RE_BOLD),
            CsiPs(b'm', 4) => self.screen_mut().set_rendition(RE_UNDERLINE),
            CsiPs(b'm', 5) => self.screen_mut().set_rendition(RE_BLINK),
            CsiPs(b'm', 7) => self.screen_mut().set_rendition(RE_REVERSE),
            CsiPs(b'm', 10..=12) => {} // IGNORED: mapping related
            CsiPs(b'm', 22) => self.screen_mut().reset_rendition(RE_BOLD),
            CsiPs(b'm', 24) => self.screen_mut().reset_rendition(RE_UNDERLINE),
            CsiPs(b'm', 25) => self.screen_mut().reset_rendition(RE_BLINK),
            CsiPs(b'm', 27) => self.screen_mut().reset_rendition(RE_REVERSE),
            CsiPs(b'm', n @ 30..=37) => self.screen_mut().set_fore_color(u32::from(n) - 30),
            CsiPs(b'm', 39) => self.screen_mut().set_fore_color_to_default(),
            CsiPs(b'm', n @ 40..=47) => self.screen_mut().set_back_color(u32::from(n) - 40),
            CsiPs(b'm', 49) => self.screen_mut().set_back_color_to_default(),
            CsiPs(b'm', n @ 90..=97) => self.screen_mut().set_fore_color(u32::from(n) - 90 + 8),
            CsiPs(b'm', n @ 100..=107) => self.screen_mut().set_back_color(u32::from(n) - 100 + 8),

            CsiPs(b'n', 5) => self.report_status(),
            CsiPs(b'n', 6) => self.report_cursor_position(),
            CsiPs(b'q', 0..=4) => {} // IGNORED: keyboard LEDs
            CsiPs(b'x', 0) => self.report_terminal_params(2),
            CsiPs(b'x', 1) => self.report_terminal_params(3),

            CsiPn(b'@') => self.screen_mut().insert_chars(p),
            CsiPn(b'A') => self.screen_mut().cursor_up(p),
            CsiPn(b'B') => self.screen_mut().cursor_down(p),
            CsiPn(b'C') => self.screen_mut().cursor_right(p),
            CsiPn(b'D') => self.screen_mut().cursor_left(p),
            CsiPn(b'G') => self.screen_mut().set_cursor_x(p),
            CsiPn(b'H') | CsiPn(b'f') => self.screen_mut().set_cursor_yx(p, q.unwrap_or(0)),
            CsiPn(b'L') => self.screen_mut().insert_lines(p),
            CsiPn(b'M') => self.screen_mut().delete_lines(p),
            CsiPn(b'P') => self.screen_mut().delete_chars(p),
            CsiPn(b'X') => self.screen_mut().erase_chars(p),
            CsiPn(b'c') => self.report_terminal_type(),
            CsiPn(b'd') => self.screen_mut().set_cursor_y(p),
            CsiPn(b'r') => self.set_margins(p, q.unwrap_or(0)),
            CsiPn(b'y') => {} // IGNORED: confidence test

            CsiPr(b'h', 1) => self.set_mode(MODE_APP_CU_KEYS),
            CsiPr(b'l', 1) => self.reset_mode(MODE_APP_CU_KEYS),
            CsiPr(b's', 1) => self.save_mode(MODE_APP_CU_KEYS),
            CsiPr(b'r', 1) => self.restore_mode(MODE_APP_CU_KEYS),

            CsiPr(b'l', 2) => self.reset_mode(MODE_ANSI), // enter VT52

            CsiPr(b'h', 3) => self.set_columns(132),
            CsiPr(b'l', 3) => self.set_columns(80),

            CsiPr(b'h', 4) | CsiPr(b'l', 4) => {} // IGNORED: soft scrolling

            CsiPr(b'h', 5) => self.screen_mut().set_mode(MODE_SCREEN),
            CsiPr(b'l', 5) => self.screen_mut().reset_mode(MODE_SCREEN),

            CsiPr(b'h', 6) => self.screen_mut().set_mode(MODE_ORIGIN),
            CsiPr(b'l', 6) => self.screen_mut().reset_mode(MODE_ORIGIN),
            CsiPr(b's', 6) => self.screen_mut().save_mode(MODE_ORIGIN),
            CsiPr(b'r', 6) => self.screen_mut().restore_mode(MODE_ORIGIN),

            CsiPr(b'h', 7) => self.screen_mut().set_mode(MODE_WRAP),
            CsiPr(b'l', 7) => self.screen_mut().reset_mode(MODE_WRAP),
            CsiPr(b's', 7) => self.screen_mut().save_mode(MODE_WRAP),
            CsiPr(b'r', 7) => self.screen_mut().restore_mode(MODE_WRAP),

            CsiPr(b'h', 8) | CsiPr(b'l', 8) => {} // IGNORED: autorepeat
            CsiPr(b'h', 9) | CsiPr(b'l', 9) => {} // IGNORED: interlace

            CsiPr(b'h', 25) => self.set_mode(MODE_CURSOR),
            CsiPr(b'l', 25) => self.reset_mode(MODE_CURSOR),

            // Obsolete more(1) fix.
            CsiPr(b'h' | b'l' | b's' | b'r', 41) => {}

            CsiPr(b'h', 47) => self.set_mode(MODE_APP_SCREEN),
            CsiPr(b'l', 47) => self.reset_mode(MODE_APP_SCREEN),
            CsiPr(b's', 47) => self.save_mode(MODE_APP_SCREEN),
            CsiPr(b'r', 47) => self.restore_mode(MODE_APP_SCREEN),

            // Mouse tracking variants 1000/1002/1003 are treated alike;
            // 1001 (hilite tracking) is only honored as an off-switch.
            CsiPr(b'h', 1000 | 1002 | 1003) => self.set_mode(MODE_MOUSE_1000),
            CsiPr(b'l', 1000 | 1001 | 1002 | 1003) => self.reset_mode(MODE_MOUSE_1000),
            CsiPr(b's', 1000 | 1002 | 1003) => self.save_mode(MODE_MOUSE_1000),
            CsiPr(b'r', 1000 | 1002 | 1003) => self.restore_mode(MODE_MOUSE_1000),
            CsiPr(b'h' | b's' | b'r', 1001) => {} // IGNORED: hilite tracking

            CsiPr(b'h', 1047) => self.set_mode(MODE_APP_SCREEN),
            CsiPr(b'l', 1047) => {
                self.core.screen_at_mut(1).clear_entire_screen();
                self.reset_mode(MODE_APP_SCREEN);
            }
            CsiPr(b's', 1047) => self.save_mode(MODE_APP_SCREEN),
            CsiPr(b'r', 1047) => self.restore_mode(MODE_APP_SCREEN),

            CsiPr(b'h' | b's', 1048) => self.save_cursor(),
            CsiPr(b'l' | b'r', 1048) => self.restore_cursor(),

            CsiPr(b'h', 1049) => {
                self.save_cursor();
                self.core.screen_at_mut(1).clear_entire_screen();
                self.set_mode(MODE_APP_SCREEN);
            }
            CsiPr(b'l', 1049) => {
                self.reset_mode(MODE_APP_SCREEN);
                self.restore_cursor();
            }

            Vt52(b'A') => self.screen_mut().cursor_up(1),
            Vt52(b'B') => self.screen_mut().cursor_down(1),
            Vt52(b'C') => self.screen_mut().cursor_right(1),
            Vt52(b'D') => self.screen_mut().cursor_left(1),
            Vt52(b'F') => self.set_and_use_charset(0, b'0'),
            Vt52(b'G') => self.set_and_use_charset(0, b'B'),
            Vt52(b'H') => self.screen_mut().set_cursor_yx(1, 1),
            Vt52(b'I') => self.screen_mut().reverse_index(),
            Vt52(b'J') => self.screen_mut().clear_to_end_of_screen(),
            Vt52(b'K') => self.screen_mut().clear_to_end_of_line(),
            Vt52(b'Y') => self
                .screen_mut()
                .set_cursor_yx(p.saturating_sub(31), q.unwrap_or(0).saturating_sub(31)),
            Vt52(b'Z') => self.report_terminal_type(),
            Vt52(b'<') => self.set_mode(MODE_ANSI),
            Vt52(b'=') => self.set_mode(MODE_APP_KEYPAD),
            Vt52(b'>') => self.reset_mode(MODE_APP_KEYPAD),

            CsiPg(b'c') => self.report_secondary_attributes(),

            _ => self.report_error_token(token, p, q),
        }
    }

    fn report_error_token(&self, token: Token, p: u32, q: Option<u32>) {
        log::debug!(
            "undecodable sequence: token {:#010x} p={} q={:?}",
            token.packed(),
            p,
            q
        );
    }

    // ── charsets ───────────────────────────────────────────────────────────

    /// VT100 code-page translation of a plain character: line-drawing
    /// glyphs, the pound hack, national replacement characters.
    fn apply_charset(&self, c: u32) -> u32 {
        let charset = &self.charsets[self.core.current_screen()];
        if charset.graphic && (0x5F..=0x7E).contains(&c) {
            VT100_GRAPHICS[(c - 0x5F) as usize]
        } else if charset.pound && c == u32::from(b'#') {
            0xA3
        } else if (0x5B..=0x5D).contains(&c) {
            u32::from(charset.trans[(c - 0x5B) as usize])
        } else if (0x7B..=0x7E).contains(&c) {
            u32::from(charset.trans[(c - 0x7B + 3) as usize])
        } else {
            c
        }
    }

    /// Designate charset `cs` into slot `n` of both screens and re-derive
    /// each screen's active translation.
    fn set_charset(&mut self, n: usize, cs: u8) {
        for charset in &mut self.charsets {
            charset.charset[n & 3] = cs;
            let current = charset.cu_cs;
            charset.use_slot(current);
        }
    }

    /// VT52 form: designate and invoke in one step, current screen only.
    fn set_and_use_charset(&mut self, n: usize, cs: u8) {
        let charset = &mut self.charsets[self.core.current_screen()];
        charset.charset[n & 3] = cs;
        charset.use_slot(n);
    }

    fn use_charset(&mut self, n: usize) {
        self.charsets[self.core.current_screen()].use_slot(n);
    }

    fn save_cursor(&mut self) {
        let charset = &mut self.charsets[self.core.current_screen()];
        charset.sa_graphic = charset.graphic;
        charset.sa_pound = charset.pound;
        charset.sa_trans = charset.trans;
        self.screen_mut().save_cursor();
    }

    fn restore_cursor(&mut self) {
        let charset = &mut self.charsets[self.core.current_screen()];
        charset.graphic = charset.sa_graphic;
        charset.pound = charset.sa_pound;
        charset.trans = charset.sa_trans;
        self.screen_mut().restore_cursor();
    }

    fn set_margins(&mut self, top: u32, bottom: u32) {
        self.core.both_screens(|s| s.set_margins(top, bottom));
    }

    fn set_columns(&mut self, columns: usize) {
        // DECCOLM: the column count is owned by the display; we only note
        // the request.
        log::debug!("DECCOLM request for {columns} columns ignored");
    }

    // ── modes ──────────────────────────────────────────────────────────────

    pub fn get_emu_mode(&self, m: usize) -> bool {
        if m < MODES_SCREEN {
            self.core.screen().get_mode(m)
        } else {
            self.curr_parm[m - MODES_SCREEN]
        }
    }

    fn reset_modes(&mut self) {
        self.reset_mode(MODE_MOUSE_1000);
        self.save_mode(MODE_MOUSE_1000);
        self.reset_mode(MODE_APP_SCREEN);
        self.save_mode(MODE_APP_SCREEN);
        self.reset_mode(MODE_APP_CU_KEYS);
        self.save_mode(MODE_APP_CU_KEYS);
        self.reset_mode(MODE_NEWLINE);
        self.set_mode(MODE_ANSI);
        self.hold_screen = false;
    }

    fn set_mode(&mut self, m: usize) {
        if m >= MODES_SCREEN {
            self.curr_parm[m - MODES_SCREEN] = true;
            match m {
                MODE_MOUSE_1000 => self.core.display.set_mouse_marks(false),
                MODE_APP_SCREEN => {
                    self.core.screen_at_mut(1).clear_selection();
                    self.core.set_screen(1);
                }
                _ => {}
            }
        } else {
            // Screen modes and NewLine extend over both screens.
            self.core.both_screens(|s| s.set_mode(m));
        }
    }

    fn reset_mode(&mut self, m: usize) {
        if m >= MODES_SCREEN {
            self.curr_parm[m - MODES_SCREEN] = false;
            match m {
                MODE_MOUSE_1000 => self.core.display.set_mouse_marks(true),
                MODE_APP_SCREEN => {
                    self.core.screen_at_mut(0).clear_selection();
                    self.core.set_screen(0);
                }
                _ => {}
            }
        } else {
            self.core.both_screens(|s| s.reset_mode(m));
        }
    }

    fn save_mode(&mut self, m: usize) {
        if m >= MODES_SCREEN {
            self.save_parm[m - MODES_SCREEN] = self.curr_parm[m - MODES_SCREEN];
        }
    }

    fn restore_mode(&mut self, m: usize) {
        if m >= MODES_SCREEN {
            if self.save_parm[m - MODES_SCREEN] {
                self.set_mode(m);
            } else {
                self.reset_mode(m);
            }
        }
    }

    // ── reports back to the application ────────────────────────────────────

    fn send_string(&self, s: String) {
        self.core.send_bytes(s.into_bytes());
    }

    fn report_terminal_type(&self) {
        if self.get_emu_mode(MODE_ANSI) {
            self.send_string("\x1b[?1;2c".into()); // VT100 with AVO
        } else {
            self.send_string("\x1b/Z".into());
        }
    }

    fn report_secondary_attributes(&self) {
        if self.get_emu_mode(MODE_ANSI) {
            self.send_string("\x1b[>0;115;0c".into());
        } else {
            self.send_string("\x1b/Z".into());
        }
    }

    fn report_terminal_params(&self, p: u32) {
        self.send_string(format!("\x1b[{p};1;1;112;112;1;0x"));
    }

    fn report_status(&self) {
        self.send_string("\x1b[0n".into()); // ready, no malfunction
    }

    fn report_cursor_position(&self) {
        let screen = self.core.screen();
        self.send_string(format!(
            "\x1b[{};{}R",
            screen.cursor_y() + 1,
            screen.cursor_x() + 1
        ));
    }

    fn report_answer_back(&self) {
        let answer = std::env::var("ANSWER_BACK").unwrap_or_default();
        self.send_string(answer);
    }

    // ── mouse ──────────────────────────────────────────────────────────────

    /// Forward a mouse event from the display while MODE_Mouse1000 is on.
    /// `cb` is the button, `cx`/`cy` are 1-based cell coordinates.
    pub fn on_mouse(&mut self, cb: u8, cx: u8, cy: u8) {
        if !self.core.connected {
            return;
        }
        self.core.send_bytes(vec![
            0x1B,
            b'[',
            b'M',
            cb.wrapping_add(32),
            cx.wrapping_add(32),
            cy.wrapping_add(32),
        ]);
    }

    // ── scroll lock ────────────────────────────────────────────────────────

    /// Hold the screen by flow-controlling the application (XOFF/XON).
    pub fn scroll_lock(&mut self, lock: bool) {
        self.hold_screen = lock;
        if lock {
            self.core.send_bytes(vec![0x13]); // XOFF
        } else {
            self.core.send_bytes(vec![0x11]); // XON
        }
    }

    // ── printer passthrough ────────────────────────────────────────────────

    /// MC: route the stream to the `PRINT_COMMAND` child until `ESC [4i`.
    fn set_printer_mode(&mut self, on: bool) {
        if on {
            let print_command =
                std::env::var("PRINT_COMMAND").unwrap_or_else(|_| "cat > /dev/null".into());
            match command("sh")
                .arg("-c")
                .arg(&print_command)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
            {
                Ok(child) => {
                    self.printer = Some(PrinterPipe {
                        child,
                        match_len: 0,
                    });
                }
                Err(e) => log::error!("failed to start printer command {print_command:?}: {e}"),
            }
        } else if let Some(mut pipe) = self.printer.take() {
            drop(pipe.child.stdin.take());
            match pipe.child.wait() {
                Ok(status) if !status.success() => {
                    log::warn!("printer command exited with {status}");
                }
                Err(e) => log::warn!("failed to reap printer command: {e}"),
                _ => {}
            }
        }
    }

    /// Feed a block to the printer pipe, watching for the off-sequence.
    /// Returns the bytes remaining after printer mode ended (empty while it
    /// stays on). The off-sequence itself never reaches the pipe.
    fn printer_intercept(&mut self, block: &[u8]) -> Vec<u8> {
        let Some(pipe) = self.printer.as_mut() else {
            return block.to_vec();
        };
        let mut to_pipe = Vec::with_capacity(block.len());
        let mut rest = Vec::new();
        let mut turned_off = false;
        for (i, &byte) in block.iter().enumerate() {
            if byte == PRINTER_OFF_SEQ[pipe.match_len] {
                pipe.match_len += 1;
                if pipe.match_len == PRINTER_OFF_SEQ.len() {
                    rest.extend_from_slice(&block[i + 1..]);
                    turned_off = true;
                    break;
                }
            } else {
                // A partial match was ordinary data after all.
                to_pipe.extend_from_slice(&PRINTER_OFF_SEQ[..pipe.match_len]);
                pipe.match_len = 0;
                if byte == PRINTER_OFF_SEQ[0] {
                    pipe.match_len = 1;
                } else {
                    to_pipe.push(byte);
                }
            }
        }
        if !to_pipe.is_empty()
            && let Some(stdin) = pipe.child.stdin.as_mut()
            && let Err(e) = stdin.write_all(&to_pipe)
        {
            log::error!("printer pipe write failed: {e}");
        }
        if turned_off {
            self.set_printer_mode(false);
        }
        rest
    }

    // ── keyboard ───────────────────────────────────────────────────────────

    /// Translate a key event through the keytab and act on the result:
    /// named commands execute immediately, sends go to the application.
    pub fn on_key_press(&mut self, ev: &KeyEvent) {
        let translator = Arc::clone(&self.core.key_translator);
        let entry = translator.find_entry(
            ev.sym,
            self.get_emu_mode(MODE_NEWLINE),
            self.get_emu_mode(MODE_ANSI),
            self.get_emu_mode(MODE_APP_CU_KEYS),
            ev.control,
            ev.shift,
            ev.alt,
        );
        if let Some(entry) = entry
            && entry.cmd != Command::Send
        {
            match entry.cmd {
                Command::ScrollLineUp => self.core.scroll_view(-1),
                Command::ScrollLineDown => self.core.scroll_view(1),
                Command::ScrollPageUp => {
                    let half = (self.core.display.lines() / 2) as i32;
                    self.core.scroll_view(-half.max(1));
                }
                Command::ScrollPageDown => {
                    let half = (self.core.display.lines() / 2) as i32;
                    self.core.scroll_view(half.max(1));
                }
                Command::ScrollLock => self.scroll_lock(!self.hold_screen),
                other => {
                    if let Some(ui) = UiCommand::from_keytab(other) {
                        self.core.emit(EmulationEvent::Ui(ui));
                    }
                }
            }
            return;
        }
        // Typing reverts the view to the live screen.
        let motion_key = matches!(
            ev.sym,
            keys::UP | keys::DOWN | keys::LEFT | keys::RIGHT | keys::PRIOR | keys::NEXT
        );
        {
            let screen = self.core.screen_mut();
            if screen.hist_cursor() != screen.hist_lines() && (!ev.text.is_empty() || motion_key) {
                let bottom = screen.hist_lines();
                screen.set_hist_cursor(bottom);
            }
        }
        match entry {
            Some(entry) => {
                let mut out = Vec::with_capacity(entry.text.len() + 1);
                if ev.alt && !entry.metaspecified() {
                    out.push(0x1B); // ESC is the Alt prefix
                }
                out.extend_from_slice(&entry.text);
                self.core.send_bytes(out);
            }
            None if !ev.text.is_empty() => {
                let mut out = Vec::new();
                if ev.alt {
                    out.push(0x1B);
                }
                out.extend(self.core.codec.encode(&ev.text));
                self.core.send_bytes(out);
            }
            None => {}
        }
    }
}

impl Drop for Vt102Emulation {
    fn drop(&mut self) {
        self.set_printer_mode(false);
    }
}

fn charset_slot(intermediate: u8) -> usize {
    match intermediate {
        b'(' => 0,
        b')' => 1,
        b'*' => 2,
        _ => 3, // b'+'
    }
}

/// Create a [`std::process::Command`] that does **not** flash a console
/// window on Windows. On other platforms this is identical to
/// `std::process::Command::new(program)`.
fn command(program: &str) -> std::process::Command {
    #![allow(unused_mut)]
    let mut cmd = std::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::RE_CURSOR;
    use crate::display::doubles::RecordingDisplay;

    fn emu(lines: usize, columns: usize) -> (Vt102Emulation, Arc<RecordingDisplay>, Receiver<EmulationEvent>) {
        let display = Arc::new(RecordingDisplay::new(lines, columns));
        let (mut emulation, rx) = Vt102Emulation::new(
            display.clone() as Arc<dyn TerminalDisplay>,
            Arc::new(KeyTranslator::builtin()),
        );
        emulation.set_connect(true);
        // Drop wiring noise so tests see only their own events.
        while rx.try_recv().is_ok() {}
        (emulation, display, rx)
    }

    fn sent_bytes(rx: &Receiver<EmulationEvent>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EmulationEvent::SendBlock(bytes) = event {
                out.extend(bytes);
            }
        }
        out
    }

    fn screen_row(emulation: &Vt102Emulation, y: usize) -> String {
        emulation.screen().image()[y]
            .iter()
            .filter_map(|cell| char::from_u32(cell.c))
            .collect::<String>()
            .trim_end()
            .to_owned()
    }

    #[test]
    fn basic_echo() {
        let (mut emulation, _display, _rx) = emu(4, 10);
        emulation.on_rcv_block(b"hi");
        let screen = emulation.screen();
        assert_eq!(screen.image()[0][0].c, u32::from('h'));
        assert_eq!(screen.image()[0][1].c, u32::from('i'));
        assert_eq!((screen.cursor_x(), screen.cursor_y()), (2, 0));
        assert_eq!(screen.hist_lines(), 0);
    }

    #[test]
    fn sgr_bold_red_then_reset() {
        let (mut emulation, _display, _rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x1b[1;31mA\x1b[0mB");
        let screen = emulation.screen();
        let a = screen.image()[0][0];
        // Bold lifts red (palette 3) into the bright half.
        assert_eq!((a.fg, a.bg), (13, 1));
        let b = screen.image()[0][1];
        assert_eq!((b.fg, b.bg, b.re), (0, 1, 0));
    }

    #[test]
    fn cursor_home_and_erase_line() {
        let (mut emulation, _display, _rx) = emu(5, 10);
        emulation.on_rcv_block(b"AAAAA\x1b[H\x1b[2K");
        let screen = emulation.screen();
        assert_eq!(screen_row(&emulation, 0), "");
        assert_eq!((screen.cursor_x(), screen.cursor_y()), (0, 0));
    }

    #[test]
    fn scroll_into_history() {
        let (mut emulation, _display, _rx) = emu(3, 4);
        emulation.set_history(HistoryType::Buffer { max_lines: 5 });
        emulation.on_rcv_block(b"aaaa\r\nbbbb\r\ncccc\r\ndddd\r\n");
        let screen = emulation.screen();
        assert_eq!(screen.hist_lines(), 2);
        assert_eq!(screen_row(&emulation, 0), "cccc");
        assert_eq!(screen_row(&emulation, 1), "dddd");
        assert_eq!(screen_row(&emulation, 2), "");
        assert_eq!((screen.cursor_x(), screen.cursor_y()), (0, 2));
    }

    #[test]
    fn alternate_screen_discards_output_on_return() {
        let (mut emulation, _display, _rx) = emu(4, 10);
        emulation.on_rcv_block(b"shell\x1b[?1049h");
        assert_eq!(emulation.core.current_screen(), 1);
        emulation.on_rcv_block(b"X");
        assert_eq!(screen_row(&emulation, 0), "X");
        emulation.on_rcv_block(b"\x1b[?1049l");
        assert_eq!(emulation.core.current_screen(), 0);
        assert_eq!(screen_row(&emulation, 0), "shell");
        // Cursor restored to the position saved before switching.
        let screen = emulation.screen();
        assert_eq!((screen.cursor_x(), screen.cursor_y()), (5, 0));
        for y in 0..4 {
            assert!(!screen_row(&emulation, y).contains('X'));
        }
    }

    #[test]
    fn utf8_wide_chars_wrap() {
        let (mut emulation, _display, _rx) = emu(2, 4);
        emulation.on_rcv_block(b"\x1b%G");
        let glyph = "中".as_bytes();
        for _ in 0..4 {
            emulation.on_rcv_block(glyph);
        }
        let screen = emulation.screen();
        assert_eq!(
            screen.image()[0].iter().map(|c| c.c).collect::<Vec<_>>(),
            vec![0x4E2D, 0, 0x4E2D, 0]
        );
        assert!(screen.is_line_wrapped(0));
        assert_eq!(
            screen.image()[1].iter().map(|c| c.c).collect::<Vec<_>>(),
            vec![0x4E2D, 0, 0x4E2D, 0]
        );
    }

    #[test]
    fn osc_sets_title() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x1b]2;my title\x07after");
        let mut title = None;
        while let Ok(event) = rx.try_recv() {
            if let EmulationEvent::TitleChanged { what, caption } = event {
                title = Some((what, caption));
            }
        }
        assert_eq!(title, Some((2, "my title".to_owned())));
        assert_eq!(screen_row(&emulation, 0), "after");
    }

    #[test]
    fn osc_survives_chunk_boundaries() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x1b]0;MOJE");
        assert!(!rx
            .try_iter()
            .any(|e| matches!(e, EmulationEvent::TitleChanged { .. })));
        emulation.on_rcv_block(b"_JMENO\x07");
        let titles: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                EmulationEvent::TitleChanged { what, caption } => Some((what, caption)),
                _ => None,
            })
            .collect();
        assert_eq!(titles, vec![(0, "MOJE_JMENO".to_owned())]);
        // Nothing of the OSC body leaked onto the screen.
        assert_eq!(screen_row(&emulation, 0), "");
    }

    #[test]
    fn device_attribute_reports() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x1b[c");
        assert_eq!(sent_bytes(&rx), b"\x1b[?1;2c");
        emulation.on_rcv_block(b"\x1b[>c");
        assert_eq!(sent_bytes(&rx), b"\x1b[>0;115;0c");
        emulation.on_rcv_block(b"\x1b[5n");
        assert_eq!(sent_bytes(&rx), b"\x1b[0n");
        emulation.on_rcv_block(b"\x1b[x");
        assert_eq!(sent_bytes(&rx), b"\x1b[2;1;1;112;112;1;0x");
    }

    #[test]
    fn cursor_position_report_is_one_based_row_first() {
        let (mut emulation, _display, rx) = emu(5, 10);
        emulation.on_rcv_block(b"\x1b[3;7H\x1b[6n");
        assert_eq!(sent_bytes(&rx), b"\x1b[3;7R");
    }

    #[test]
    fn bell_reaches_display_and_session() {
        let (mut emulation, display, rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x07");
        assert_eq!(*display.bells.lock(), 1);
        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                EmulationEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(states.contains(&SessionState::Bell));
        assert!(states.contains(&SessionState::Activity));
    }

    #[test]
    fn line_drawing_charset() {
        let (mut emulation, _display, _rx) = emu(2, 10);
        emulation.on_rcv_block(b"\x1b(0qqq\x1b(Bq");
        let screen = emulation.screen();
        assert_eq!(screen.image()[0][0].c, 0x2500);
        assert_eq!(screen.image()[0][2].c, 0x2500);
        assert_eq!(screen.image()[0][3].c, u32::from('q'));
    }

    #[test]
    fn shift_out_uses_g1() {
        let (mut emulation, _display, _rx) = emu(2, 10);
        // Designate G1 = graphics, invoke with SO, revert with SI.
        emulation.on_rcv_block(b"\x1b)0a\x0eq\x0fq");
        let screen = emulation.screen();
        assert_eq!(screen.image()[0][0].c, u32::from('a'));
        assert_eq!(screen.image()[0][1].c, 0x2500);
        assert_eq!(screen.image()[0][2].c, u32::from('q'));
    }

    #[test]
    fn national_charset_translates_brackets() {
        let (mut emulation, _display, _rx) = emu(2, 10);
        emulation.on_rcv_block(b"\x1b(K[a\x1b(B[");
        let screen = emulation.screen();
        assert_eq!(screen.image()[0][0].c, u32::from('Ä'));
        assert_eq!(screen.image()[0][1].c, u32::from('a'));
        assert_eq!(screen.image()[0][2].c, u32::from('['));
    }

    #[test]
    fn margins_and_region_scroll() {
        let (mut emulation, _display, _rx) = emu(5, 10);
        emulation.on_rcv_block(b"\x1b[2;4r");
        let screen = emulation.screen();
        assert_eq!((screen.margin_top(), screen.margin_bottom()), (1, 3));
        // Margins apply to both screens.
        emulation.on_rcv_block(b"\x1b[?1049h");
        let alt = emulation.screen();
        assert_eq!((alt.margin_top(), alt.margin_bottom()), (1, 3));
        emulation.on_rcv_block(b"\x1b[?1049l");
    }

    #[test]
    fn unknown_sequences_are_absorbed() {
        let (mut emulation, _display, _rx) = emu(3, 10);
        emulation.on_rcv_block(b"\x1b[999z\x1b[=\x1b#9ok");
        assert!(screen_row(&emulation, 0).ends_with("ok"));
    }

    #[test]
    fn can_aborts_a_sequence() {
        let (mut emulation, _display, _rx) = emu(2, 10);
        // CAN in mid-sequence drops it and leaves a checkerboard mark.
        emulation.on_rcv_block(b"\x1b[2\x18ab");
        let screen = emulation.screen();
        assert_eq!(screen.image()[0][0].c, 0x2592);
        assert_eq!(screen.image()[0][1].c, u32::from('a'));
    }

    #[test]
    fn mouse_mode_and_reports() {
        let (mut emulation, display, rx) = emu(5, 10);
        assert!(*display.mouse_marks.lock());
        emulation.on_rcv_block(b"\x1b[?1000h");
        assert!(!*display.mouse_marks.lock());
        emulation.on_mouse(0, 5, 3);
        assert_eq!(sent_bytes(&rx), b"\x1b[M\x20\x25\x23");
        emulation.on_rcv_block(b"\x1b[?1000l");
        assert!(*display.mouse_marks.lock());
    }

    #[test]
    fn vt52_mode_round_trip() {
        let (mut emulation, _display, rx) = emu(5, 10);
        emulation.on_rcv_block(b"\x1b[?2l");
        assert!(!emulation.get_emu_mode(MODE_ANSI));
        // Direct cursor address: row 3, column 6 (1-based).
        emulation.on_rcv_block(b"\x1bY\x22\x25");
        let screen = emulation.screen();
        assert_eq!((screen.cursor_x(), screen.cursor_y()), (5, 2));
        emulation.on_rcv_block(b"\x1bZ");
        assert_eq!(sent_bytes(&rx), b"\x1b/Z");
        emulation.on_rcv_block(b"\x1bA");
        assert_eq!(emulation.screen().cursor_y(), 1);
        emulation.on_rcv_block(b"\x1b<");
        assert!(emulation.get_emu_mode(MODE_ANSI));
    }

    #[test]
    fn full_reset_restores_power_on_state() {
        let (mut emulation, _display, _rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x1b[?1049h\x1b[4h\x1b(0\x1b[?1h");
        emulation.on_rcv_block(b"\x1bc");
        assert_eq!(emulation.core.current_screen(), 0);
        assert!(!emulation.get_emu_mode(MODE_APP_CU_KEYS));
        assert!(!emulation.screen().get_mode(MODE_INSERT));
        emulation.on_rcv_block(b"q");
        assert_eq!(emulation.screen().image()[0][0].c, u32::from('q'));
    }

    #[test]
    fn cursor_visibility_mode() {
        let (mut emulation, _display, _rx) = emu(3, 10);
        emulation.on_rcv_block(b"x\x1b[?25l");
        let img = emulation.screen().get_cooked_image();
        assert_eq!(img[0][1].re & RE_CURSOR, 0);
        emulation.on_rcv_block(b"\x1b[?25h");
        let img = emulation.screen().get_cooked_image();
        assert_ne!(img[0][1].re & RE_CURSOR, 0);
    }

    #[test]
    fn printer_passthrough_swallows_until_off_sequence() {
        let (mut emulation, _display, _rx) = emu(3, 20);
        emulation.on_rcv_block(b"\x1b[5i");
        assert!(emulation.printer.is_some());
        emulation.on_rcv_block(b"printed bytes");
        emulation.on_rcv_block(b"more\x1b[4ishown");
        assert!(emulation.printer.is_none());
        assert_eq!(screen_row(&emulation, 0), "shown");
    }

    #[test]
    fn printer_off_sequence_split_across_blocks() {
        let (mut emulation, _display, _rx) = emu(3, 20);
        emulation.on_rcv_block(b"\x1b[5i");
        emulation.on_rcv_block(b"data\x1b[4");
        assert!(emulation.printer.is_some());
        emulation.on_rcv_block(b"ivisible");
        assert!(emulation.printer.is_none());
        assert_eq!(screen_row(&emulation, 0), "visible");
    }

    #[test]
    fn newline_mode_affects_line_feed() {
        let (mut emulation, _display, _rx) = emu(4, 10);
        emulation.on_rcv_block(b"ab\x1b[20h\ncd");
        let screen = emulation.screen();
        // LNM: LF implies CR.
        assert_eq!(screen_row(&emulation, 1), "cd");
        assert_eq!((screen.cursor_x(), screen.cursor_y()), (2, 1));
        emulation.on_rcv_block(b"\x1b[20l");
        assert!(!emulation.get_emu_mode(MODE_NEWLINE));
    }

    #[test]
    fn key_return_follows_newline_mode() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_key_press(&KeyEvent::named(keys::RETURN));
        assert_eq!(sent_bytes(&rx), b"\r");
        emulation.on_rcv_block(b"\x1b[20h");
        let _ = sent_bytes(&rx);
        emulation.on_key_press(&KeyEvent::named(keys::RETURN));
        assert_eq!(sent_bytes(&rx), b"\r\n");
    }

    #[test]
    fn cursor_keys_follow_application_mode() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_key_press(&KeyEvent::named(keys::UP));
        assert_eq!(sent_bytes(&rx), b"\x1b[A");
        emulation.on_rcv_block(b"\x1b[?1h");
        let _ = sent_bytes(&rx);
        emulation.on_key_press(&KeyEvent::named(keys::UP));
        assert_eq!(sent_bytes(&rx), b"\x1bOA");
    }

    #[test]
    fn plain_text_keys_fall_through_the_keytab() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_key_press(&KeyEvent::character('a'));
        assert_eq!(sent_bytes(&rx), b"a");
        emulation.on_key_press(&KeyEvent::character('a').with_alt());
        assert_eq!(sent_bytes(&rx), b"\x1ba");
    }

    #[test]
    fn shift_prior_scrolls_the_view_without_sending() {
        let (mut emulation, _display, rx) = emu(2, 4);
        emulation.set_history(HistoryType::Buffer { max_lines: 16 });
        emulation.on_rcv_block(b"a\r\nb\r\nc\r\nd\r\ne\r\n");
        let at_bottom = emulation.screen().hist_cursor();
        assert!(at_bottom > 0);
        let _ = sent_bytes(&rx);
        emulation.on_key_press(&KeyEvent::named(keys::PRIOR).with_shift());
        assert!(emulation.screen().hist_cursor() < at_bottom);
        assert!(sent_bytes(&rx).is_empty());
        // Typing snaps back to the bottom.
        emulation.on_key_press(&KeyEvent::character('x'));
        assert_eq!(
            emulation.screen().hist_cursor(),
            emulation.screen().hist_lines()
        );
    }

    #[test]
    fn scroll_lock_sends_flow_control() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_key_press(&KeyEvent::named(keys::SCROLL_LOCK));
        assert!(emulation.hold_screen());
        assert_eq!(sent_bytes(&rx), b"\x13");
        emulation.on_key_press(&KeyEvent::named(keys::SCROLL_LOCK));
        assert!(!emulation.hold_screen());
        assert_eq!(sent_bytes(&rx), b"\x11");
    }

    #[test]
    fn answer_back_on_enq() {
        let (mut emulation, _display, rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x05");
        let expected = std::env::var("ANSWER_BACK").unwrap_or_default();
        assert_eq!(sent_bytes(&rx), expected.into_bytes());
    }

    #[test]
    fn save_restore_private_modes() {
        let (mut emulation, _display, _rx) = emu(4, 10);
        emulation.on_rcv_block(b"\x1b[?1h\x1b[?1s\x1b[?1l");
        assert!(!emulation.get_emu_mode(MODE_APP_CU_KEYS));
        emulation.on_rcv_block(b"\x1b[?1r");
        assert!(emulation.get_emu_mode(MODE_APP_CU_KEYS));
    }

    #[test]
    fn insert_and_replace_modes_via_csi() {
        let (mut emulation, _display, _rx) = emu(2, 8);
        emulation.on_rcv_block(b"abc\x1b[1;1H\x1b[4hX\x1b[4lY");
        assert_eq!(screen_row(&emulation, 0), "XYbc");
    }

    #[test]
    fn decaln_fills_screen() {
        let (mut emulation, _display, _rx) = emu(2, 3);
        emulation.on_rcv_block(b"\x1b#8");
        assert_eq!(screen_row(&emulation, 0), "EEE");
        assert_eq!(screen_row(&emulation, 1), "EEE");
    }

    #[test]
    fn token_packing_is_stable() {
        assert_eq!(Token::Chr(u32::from('x')).packed(), 0);
        assert_eq!(Token::Ctl(b'G').packed(), 0x0000_4701);
        assert_eq!(Token::Esc(b'D').packed(), 0x0000_4402);
        assert_eq!(Token::EscCs(b'(', b'0').packed(), 0x0030_2803);
        assert_eq!(Token::EscDe(b'8').packed(), 0x0000_3804);
        assert_eq!(Token::CsiPs(b'm', 31).packed(), 0x001F_6D05);
        assert_eq!(Token::CsiPn(b'H').packed(), 0x0000_4806);
        assert_eq!(Token::CsiPr(b'h', 25).packed(), 0x0019_6807);
        assert_eq!(Token::Vt52(b'A').packed(), 0x0000_4108);
        assert_eq!(Token::CsiPg(b'c').packed(), 0x0000_6309);
    }
}
