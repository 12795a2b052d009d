//! The screen image manipulated by the emulation.
//!
//! A `Screen` is a passive rectangular grid of [`Cell`]s driven entirely by
//! the decoder: it knows nothing about escape sequences or rendering. It
//! keeps the cursor, scroll margins, tab stops, per-screen modes, the
//! selection, and a handle to the scrollback history that receives lines
//! scrolled off a full-screen region.
//!
//! Coordinates are `(y, x)` with the origin at the top-left. Selection
//! endpoints live in the combined history + screen space (see [`Point`]).

use crate::cell::{
    Cell, BASE_COLORS, DEFAULT_BACK_COLOR, DEFAULT_FORE_COLOR, DEFAULT_RENDITION, RE_BLINK,
    RE_BOLD, RE_CURSOR, RE_REVERSE, RE_UNDERLINE,
};
use crate::history::{HistoryScroll, HistoryType};
use crate::point::Point;
use crate::width::codepoint_width;

pub const MODE_ORIGIN: usize = 0;
pub const MODE_WRAP: usize = 1;
pub const MODE_INSERT: usize = 2;
/// Reverse video over the whole screen (DECSCNM).
pub const MODE_SCREEN: usize = 3;
/// Cursor visible.
pub const MODE_CURSOR: usize = 4;
pub const MODE_NEWLINE: usize = 5;
/// Number of per-screen modes; emulation-level modes start here.
pub const MODES_SCREEN: usize = 6;

/// When set, backspace blanks the cell it moves off of.
const BS_CLEARS: bool = false;

pub struct Screen {
    lines: usize,
    columns: usize,
    image: Vec<Vec<Cell>>,
    line_wrapped: Vec<bool>,

    hist: HistoryScroll,
    /// View position into history: `hist.lines()` means "at the bottom",
    /// smaller values show older lines above the live image.
    hist_cursor: usize,

    cu_x: usize,
    cu_y: usize,
    cu_fg: u8,
    cu_bg: u8,
    cu_re: u8,

    margin_t: usize,
    margin_b: usize,

    curr_mode: [bool; MODES_SCREEN],
    save_mode: [bool; MODES_SCREEN],
    tab_stops: Vec<bool>,

    eff_fg: u8,
    eff_bg: u8,
    eff_re: u8,

    sa_cu_x: usize,
    sa_cu_y: usize,
    sa_cu_fg: u8,
    sa_cu_bg: u8,
    sa_cu_re: u8,

    pub busy_selecting: bool,
    sel_begin: Point,
    sel_topleft: Point,
    sel_bottomright: Point,
}

impl Screen {
    pub fn new(lines: usize, columns: usize) -> Self {
        let lines = lines.max(1);
        let columns = columns.max(1);
        let mut screen = Self {
            lines,
            columns,
            image: vec![vec![Cell::default(); columns]; lines],
            line_wrapped: vec![false; lines],
            hist: HistoryScroll::None,
            hist_cursor: 0,
            cu_x: 0,
            cu_y: 0,
            cu_fg: DEFAULT_FORE_COLOR,
            cu_bg: DEFAULT_BACK_COLOR,
            cu_re: DEFAULT_RENDITION,
            margin_t: 0,
            margin_b: lines - 1,
            curr_mode: [false; MODES_SCREEN],
            save_mode: [false; MODES_SCREEN],
            tab_stops: Vec::new(),
            eff_fg: DEFAULT_FORE_COLOR,
            eff_bg: DEFAULT_BACK_COLOR,
            eff_re: DEFAULT_RENDITION,
            sa_cu_x: 0,
            sa_cu_y: 0,
            sa_cu_fg: DEFAULT_FORE_COLOR,
            sa_cu_bg: DEFAULT_BACK_COLOR,
            sa_cu_re: DEFAULT_RENDITION,
            busy_selecting: false,
            sel_begin: Point::NONE,
            sel_topleft: Point::NONE,
            sel_bottomright: Point::NONE,
        };
        screen.init_tab_stops();
        screen.reset();
        screen
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// The live image. Rows are `columns` cells wide; for the merged
    /// history + screen view use [`Self::get_cooked_image`].
    pub fn image(&self) -> &[Vec<Cell>] {
        &self.image
    }

    pub fn is_line_wrapped(&self, y: usize) -> bool {
        self.line_wrapped.get(y).copied().unwrap_or(false)
    }

    // ── cursor movement ────────────────────────────────────────────────────

    /// CUU. Bounded by the top margin when starting inside the scroll
    /// region, by the screen top otherwise.
    pub fn cursor_up(&mut self, n: u32) {
        let n = n.max(1) as usize;
        let stop = if self.cu_y < self.margin_t {
            0
        } else {
            self.margin_t
        };
        self.cu_x = self.cu_x.min(self.columns - 1);
        self.cu_y = self.cu_y.saturating_sub(n).max(stop);
    }

    /// CUD. Bounded by the bottom margin when starting inside the scroll
    /// region, by the screen bottom otherwise.
    pub fn cursor_down(&mut self, n: u32) {
        let n = n.max(1) as usize;
        let stop = if self.cu_y > self.margin_b {
            self.lines - 1
        } else {
            self.margin_b
        };
        self.cu_x = self.cu_x.min(self.columns - 1);
        self.cu_y = (self.cu_y + n).min(stop);
    }

    /// CUB.
    pub fn cursor_left(&mut self, n: u32) {
        let n = n.max(1) as usize;
        self.cu_x = self.cu_x.min(self.columns - 1);
        self.cu_x = self.cu_x.saturating_sub(n);
    }

    /// CUF.
    pub fn cursor_right(&mut self, n: u32) {
        let n = n.max(1) as usize;
        self.cu_x = (self.cu_x + n).min(self.columns - 1);
    }

    /// CHA; 1-based, 0 normalized to 1.
    pub fn set_cursor_x(&mut self, x: u32) {
        let x = x.max(1) as usize - 1;
        self.cu_x = x.min(self.columns - 1);
    }

    /// VPA; 1-based, offset by the top margin in origin mode.
    pub fn set_cursor_y(&mut self, y: u32) {
        let y = y.max(1) as usize - 1;
        let dy = if self.get_mode(MODE_ORIGIN) {
            self.margin_t
        } else {
            0
        };
        self.cu_y = (y + dy).min(self.lines - 1);
    }

    /// CUP / HVP.
    pub fn set_cursor_yx(&mut self, y: u32, x: u32) {
        self.set_cursor_x(x);
        self.set_cursor_y(y);
    }

    pub fn cursor_x(&self) -> usize {
        self.cu_x
    }

    pub fn cursor_y(&self) -> usize {
        self.cu_y
    }

    /// DECSTBM; 1-based, 0 meaning the screen edge. Invalid ranges are
    /// logged and ignored.
    pub fn set_margins(&mut self, top: u32, bot: u32) {
        let top = if top == 0 { 1 } else { top };
        let bot = if bot == 0 { self.lines as u32 } else { bot };
        let top = top as usize - 1;
        let bot = bot as usize - 1;
        if !(top < bot && bot < self.lines) {
            log::warn!("set_margins({top}, {bot}): bad range, ignored");
            return;
        }
        self.margin_t = top;
        self.margin_b = bot;
        self.cu_x = 0;
        self.cu_y = if self.get_mode(MODE_ORIGIN) { top } else { 0 };
    }

    pub fn margin_top(&self) -> usize {
        self.margin_t
    }

    pub fn margin_bottom(&self) -> usize {
        self.margin_b
    }

    // ── cursor movement with scrolling ─────────────────────────────────────

    /// LF/VT/FF: index, plus carriage return in NewLine mode (LNM).
    pub fn new_line(&mut self) {
        if self.get_mode(MODE_NEWLINE) {
            self.carriage_return();
        }
        self.index();
    }

    /// NEL: carriage return plus index.
    pub fn next_line(&mut self) {
        self.carriage_return();
        self.index();
    }

    /// Move the cursor down one line; at the bottom margin the region
    /// scrolls up instead, feeding history when the region spans the whole
    /// screen.
    pub fn index(&mut self) {
        if self.cu_y == self.margin_b {
            if self.margin_t == 0 && self.margin_b == self.lines - 1 {
                self.add_history_line();
            }
            self.scroll_up_from(self.margin_t, 1);
        } else if self.cu_y < self.lines - 1 {
            self.cu_y += 1;
        }
    }

    /// Move the cursor up one line; at the top margin the region scrolls
    /// down instead. No history interaction.
    pub fn reverse_index(&mut self) {
        if self.cu_y == self.margin_t {
            self.scroll_down_from(self.margin_t, 1);
        } else if self.cu_y > 0 {
            self.cu_y -= 1;
        }
    }

    /// CR.
    pub fn carriage_return(&mut self) {
        self.cu_x = 0;
    }

    /// HT: advance to the next tab stop, or the last column.
    pub fn tabulate(&mut self) {
        self.cursor_right(1);
        while self.cu_x < self.columns - 1 && !self.tab_stops[self.cu_x] {
            self.cursor_right(1);
        }
    }

    /// BS.
    pub fn back_space(&mut self) {
        self.cu_x = self.cu_x.min(self.columns - 1).saturating_sub(1);
        if BS_CLEARS {
            let old = self.image[self.cu_y][self.cu_x];
            self.image[self.cu_y][self.cu_x] = Cell::new(u32::from(' '), old.fg, old.bg, old.re);
        }
    }

    /// Clear the entire screen and home the cursor.
    pub fn clear(&mut self) {
        self.clear_entire_screen();
        self.home();
    }

    pub fn home(&mut self) {
        self.cu_x = 0;
        self.cu_y = 0;
    }

    /// Restore all modes, margins, rendition and cursor to power-on state.
    pub fn reset(&mut self) {
        self.set_mode(MODE_WRAP);
        self.save_mode(MODE_WRAP);
        self.reset_mode(MODE_ORIGIN);
        self.save_mode(MODE_ORIGIN);
        self.reset_mode(MODE_INSERT);
        self.save_mode(MODE_INSERT);
        self.set_mode(MODE_CURSOR);
        self.reset_mode(MODE_SCREEN);
        self.reset_mode(MODE_NEWLINE);
        self.margin_t = 0;
        self.margin_b = self.lines - 1;
        self.set_default_rendition();
        self.save_cursor();
        self.clear();
    }

    // ── editing ────────────────────────────────────────────────────────────

    /// ECH.
    pub fn erase_chars(&mut self, n: u32) {
        let n = n.max(1) as usize;
        let p = (self.cu_x + n - 1).min(self.columns - 1);
        self.clear_image(
            Point::of(self.cu_y, self.cu_x),
            Point::of(self.cu_y, p),
            ' ',
        );
    }

    /// DCH.
    pub fn delete_chars(&mut self, n: u32) {
        let n = n.max(1) as usize;
        let p = (self.cu_x + n).min(self.columns - 1);
        self.move_image(
            Point::of(self.cu_y, self.cu_x),
            Point::of(self.cu_y, p),
            Point::of(self.cu_y, self.columns - 1),
        );
        self.clear_image(
            Point::of(self.cu_y, self.columns.saturating_sub(n)),
            Point::of(self.cu_y, self.columns - 1),
            ' ',
        );
    }

    /// ICH.
    pub fn insert_chars(&mut self, n: u32) {
        let n = n.max(1) as usize;
        let p = self.columns.saturating_sub(1 + n).min(self.columns - 1);
        let q = (self.cu_x + n).min(self.columns - 1);
        self.move_image(
            Point::of(self.cu_y, q),
            Point::of(self.cu_y, self.cu_x),
            Point::of(self.cu_y, p),
        );
        if q > 0 {
            self.clear_image(
                Point::of(self.cu_y, self.cu_x),
                Point::of(self.cu_y, q - 1),
                ' ',
            );
        }
    }

    /// DL: scroll the region below the cursor up.
    pub fn delete_lines(&mut self, n: u32) {
        let n = n.max(1) as usize;
        self.scroll_up_from(self.cu_y, n);
    }

    /// IL: scroll the region below the cursor down.
    pub fn insert_lines(&mut self, n: u32) {
        let n = n.max(1) as usize;
        self.scroll_down_from(self.cu_y, n);
    }

    // ── tab stops ──────────────────────────────────────────────────────────

    pub fn clear_tab_stops(&mut self) {
        self.tab_stops.fill(false);
    }

    pub fn change_tab_stop(&mut self, set: bool) {
        if self.cu_x >= self.columns {
            return;
        }
        self.tab_stops[self.cu_x] = set;
    }

    fn init_tab_stops(&mut self) {
        self.tab_stops = (0..self.columns).map(|i| i % 8 == 0 && i != 0).collect();
    }

    // ── modes ──────────────────────────────────────────────────────────────

    pub fn set_mode(&mut self, m: usize) {
        self.curr_mode[m] = true;
        if m == MODE_ORIGIN {
            self.cu_x = 0;
            self.cu_y = self.margin_t;
        }
    }

    pub fn reset_mode(&mut self, m: usize) {
        self.curr_mode[m] = false;
        if m == MODE_ORIGIN {
            self.cu_x = 0;
            self.cu_y = 0;
        }
    }

    pub fn save_mode(&mut self, m: usize) {
        self.save_mode[m] = self.curr_mode[m];
    }

    pub fn restore_mode(&mut self, m: usize) {
        self.curr_mode[m] = self.save_mode[m];
    }

    pub fn get_mode(&self, m: usize) -> bool {
        self.curr_mode[m]
    }

    // ── saved cursor (DECSC/DECRC) ─────────────────────────────────────────

    pub fn save_cursor(&mut self) {
        self.sa_cu_x = self.cu_x;
        self.sa_cu_y = self.cu_y;
        self.sa_cu_re = self.cu_re;
        self.sa_cu_fg = self.cu_fg;
        self.sa_cu_bg = self.cu_bg;
    }

    pub fn restore_cursor(&mut self) {
        self.cu_x = self.sa_cu_x.min(self.columns - 1);
        self.cu_y = self.sa_cu_y.min(self.lines - 1);
        self.cu_re = self.sa_cu_re;
        self.cu_fg = self.sa_cu_fg;
        self.cu_bg = self.sa_cu_bg;
        self.effective_rendition();
    }

    // ── erase operations ───────────────────────────────────────────────────

    pub fn clear_entire_screen(&mut self) {
        self.clear_image(
            Point::of(0, 0),
            Point::of(self.lines - 1, self.columns - 1),
            ' ',
        );
    }

    pub fn clear_to_end_of_screen(&mut self) {
        self.clear_image(
            Point::of(self.cu_y, self.cu_x),
            Point::of(self.lines - 1, self.columns - 1),
            ' ',
        );
    }

    pub fn clear_to_begin_of_screen(&mut self) {
        self.clear_image(Point::of(0, 0), Point::of(self.cu_y, self.cu_x), ' ');
    }

    pub fn clear_entire_line(&mut self) {
        self.clear_image(
            Point::of(self.cu_y, 0),
            Point::of(self.cu_y, self.columns - 1),
            ' ',
        );
    }

    pub fn clear_to_end_of_line(&mut self) {
        self.clear_image(
            Point::of(self.cu_y, self.cu_x),
            Point::of(self.cu_y, self.columns - 1),
            ' ',
        );
    }

    pub fn clear_to_begin_of_line(&mut self) {
        self.clear_image(Point::of(self.cu_y, 0), Point::of(self.cu_y, self.cu_x), ' ');
    }

    /// DECALN: fill the screen with 'E'.
    pub fn help_align(&mut self) {
        self.clear_image(
            Point::of(0, 0),
            Point::of(self.lines - 1, self.columns - 1),
            'E',
        );
    }

    // ── rendition ──────────────────────────────────────────────────────────

    pub fn set_rendition(&mut self, re: u8) {
        self.cu_re |= re;
        self.effective_rendition();
    }

    pub fn reset_rendition(&mut self, re: u8) {
        self.cu_re &= !re;
        self.effective_rendition();
    }

    /// ANSI color 0..15; 8..15 select the bright palette half.
    pub fn set_fore_color(&mut self, color: u32) {
        self.cu_fg = ansi_color_index(color);
        self.effective_rendition();
    }

    pub fn set_back_color(&mut self, color: u32) {
        self.cu_bg = ansi_color_index(color);
        self.effective_rendition();
    }

    pub fn set_fore_color_to_default(&mut self) {
        self.cu_fg = DEFAULT_FORE_COLOR;
        self.effective_rendition();
    }

    pub fn set_back_color_to_default(&mut self) {
        self.cu_bg = DEFAULT_BACK_COLOR;
        self.effective_rendition();
    }

    pub fn set_default_rendition(&mut self) {
        self.cu_fg = DEFAULT_FORE_COLOR;
        self.cu_bg = DEFAULT_BACK_COLOR;
        self.cu_re = DEFAULT_RENDITION;
        self.effective_rendition();
    }

    /// Derive the effective colors/bits stored into cells from the current
    /// rendition state: reverse swaps fg/bg, bold toggles the foreground
    /// between the normal and bright palette halves.
    fn effective_rendition(&mut self) {
        self.eff_re = self.cu_re & (RE_UNDERLINE | RE_BLINK);
        if self.cu_re & RE_REVERSE != 0 {
            self.eff_fg = self.cu_bg;
            self.eff_bg = self.cu_fg;
        } else {
            self.eff_fg = self.cu_fg;
            self.eff_bg = self.cu_bg;
        }
        if self.cu_re & RE_BOLD != 0 {
            if self.eff_fg < BASE_COLORS {
                self.eff_fg += BASE_COLORS;
            } else {
                self.eff_fg -= BASE_COLORS;
            }
        }
    }

    // ── cell emission ──────────────────────────────────────────────────────

    /// Write one glyph at the cursor, handling wrap, insert mode and wide
    /// characters. Filling the last column leaves the cursor at `columns`
    /// (pending wrap); the next glyph wraps or overstrikes per MODE_WRAP.
    pub fn show_character(&mut self, c: u32) {
        let w = codepoint_width(c);
        if w <= 0 {
            return;
        }
        let w = w as usize;
        if w > self.columns {
            return;
        }
        if self.cu_x + w > self.columns {
            if self.get_mode(MODE_WRAP) {
                self.line_wrapped[self.cu_y] = true;
                self.next_line();
            } else {
                self.cu_x = self.columns - w;
            }
        }
        if self.get_mode(MODE_INSERT) {
            self.insert_chars(w as u32);
        }
        let cpt = Point::of(self.cu_y, self.cu_x);
        self.check_selection(cpt, cpt);
        let (fg, bg, re) = (self.eff_fg, self.eff_bg, self.eff_re);
        let row = &mut self.image[self.cu_y];
        row[self.cu_x] = Cell::new(c, fg, bg, re);
        // Trailing slots of a wide glyph carry the colors, codepoint 0.
        for i in 1..w {
            row[self.cu_x + i] = Cell::new(0, fg, bg, re);
        }
        self.cu_x += w;
    }

    // ── resize ─────────────────────────────────────────────────────────────

    /// Resize the grid, preserving the top-left subrectangle. Margins reset
    /// to the full screen, tab stops reinitialize, the selection clears.
    pub fn resize_image(&mut self, new_lines: usize, new_columns: usize) {
        let new_lines = new_lines.max(1);
        let new_columns = new_columns.max(1);
        if new_lines == self.lines && new_columns == self.columns {
            return;
        }
        log::debug!(
            "resize image {}x{} -> {}x{}",
            self.lines,
            self.columns,
            new_lines,
            new_columns
        );
        if self.cu_y > new_lines + 1 {
            // Push the rows the cursor would lose into history.
            self.margin_b = self.lines - 1;
            for _ in 0..self.cu_y - (new_lines - 1) {
                self.add_history_line();
                self.scroll_up_from(0, 1);
            }
        }
        let mut image = vec![vec![Cell::default(); new_columns]; new_lines];
        let mut wrapped = vec![false; new_lines];
        for y in 0..self.lines.min(new_lines) {
            for x in 0..self.columns.min(new_columns) {
                image[y][x] = self.image[y][x];
            }
            wrapped[y] = self.line_wrapped[y];
        }
        self.image = image;
        self.line_wrapped = wrapped;
        self.lines = new_lines;
        self.columns = new_columns;
        self.cu_x = self.cu_x.min(new_columns - 1);
        self.cu_y = self.cu_y.min(new_lines - 1);
        self.margin_t = 0;
        self.margin_b = new_lines - 1;
        self.init_tab_stops();
        self.clear_selection();
    }

    // ── history & view ─────────────────────────────────────────────────────

    pub fn hist_lines(&self) -> usize {
        self.hist.lines()
    }

    pub fn hist_cursor(&self) -> usize {
        self.hist_cursor
    }

    pub fn set_hist_cursor(&mut self, cursor: usize) {
        self.hist_cursor = cursor.min(self.hist.lines());
    }

    pub fn has_scroll(&self) -> bool {
        self.hist.has_scroll()
    }

    pub fn get_scroll(&self) -> HistoryType {
        self.hist.history_type()
    }

    /// Swap the history configuration, migrating recent lines. The view
    /// returns to the bottom and the selection clears.
    pub fn set_scroll(&mut self, history_type: HistoryType) {
        self.clear_selection();
        let old = std::mem::replace(&mut self.hist, HistoryScroll::None);
        self.hist = history_type.make_scroll(old);
        self.hist_cursor = self.hist.lines();
    }

    /// Move the topmost image row into history and adjust the view and the
    /// selection for the new point of reference.
    fn add_history_line(&mut self) {
        debug_assert!(self.has_scroll() || self.hist_cursor == 0);
        if !self.has_scroll() {
            return;
        }
        // Trailing default cells are not stored unless the row wraps.
        let mut end = self.columns as i32 - 1;
        if !self.line_wrapped[0] {
            let dca = Cell::default();
            while end >= 0 && self.image[0][end as usize] == dca {
                end -= 1;
            }
        }
        let old_hist_lines = self.hist.lines();
        let cells: Vec<Cell> = self.image[0][..(end + 1) as usize].to_vec();
        self.hist.add_cells(&cells, self.line_wrapped[0]);
        let new_hist_lines = self.hist.lines();

        let begin_is_tl = self.sel_begin == self.sel_topleft;
        if new_hist_lines > old_hist_lines {
            self.hist_cursor += 1;
            // Global coordinates of screen cells shifted down by one.
            if !self.sel_begin.is_none() {
                self.sel_topleft.y += 1;
                self.sel_bottomright.y += 1;
            }
        }
        // Keep the view anchored: stay at the bottom when tracking it,
        // otherwise hold the same absolute content.
        if self.hist_cursor > 0 && (self.hist_cursor != new_hist_lines || self.busy_selecting) {
            self.hist_cursor -= 1;
        }
        if !self.sel_begin.is_none() {
            let top_br = Point::of(1 + new_hist_lines, 0);
            if self.sel_topleft < top_br {
                self.sel_topleft.y -= 1;
            }
            if self.sel_bottomright < top_br {
                self.sel_bottomright.y -= 1;
            }
            if self.sel_bottomright < Point::new(0, 0) {
                self.clear_selection();
            } else if self.sel_topleft < Point::new(0, 0) {
                self.sel_topleft = Point::new(0, 0);
            }
            if begin_is_tl {
                self.sel_begin = self.sel_topleft;
            } else {
                self.sel_begin = self.sel_bottomright;
            }
        }
    }

    // ── cooked image ───────────────────────────────────────────────────────

    /// Build the display-ready snapshot: history rows above live rows per
    /// the view position, selection and reverse-video highlighting applied,
    /// cursor overlay set. The result shares no storage with the screen.
    pub fn get_cooked_image(&self) -> Vec<Vec<Cell>> {
        let mut merged = vec![vec![Cell::default(); self.columns]; self.lines];
        let actual_y = self.hist.lines().saturating_sub(self.hist_cursor);
        for y in 0..self.lines.min(actual_y) {
            let yq = y + self.hist_cursor;
            let len = self.hist.line_len(yq).min(self.columns);
            let cells = self.hist.get_cells(yq, 0, Some(len));
            merged[y][..cells.len()].copy_from_slice(&cells);
            for x in 0..self.columns {
                if self.is_selected_global(Point::of(yq, x)) {
                    reverse_rendition(&mut merged[y][x]);
                }
            }
        }
        for y in actual_y..self.lines {
            let yq = y + self.hist_cursor;
            let yr = y - actual_y;
            for x in 0..self.columns {
                merged[y][x] = self.image[yr][x];
                if self.is_selected_global(Point::of(yq, x)) {
                    reverse_rendition(&mut merged[y][x]);
                }
            }
        }
        if self.get_mode(MODE_SCREEN) {
            for row in &mut merged {
                for cell in row {
                    reverse_rendition(cell);
                }
            }
        }
        let cuy = self.cu_y + actual_y;
        if self.get_mode(MODE_CURSOR) && cuy < self.lines {
            let cux = self.cu_x.min(self.columns - 1);
            merged[cuy][cux].re |= RE_CURSOR;
        }
        merged
    }

    /// Wrap flags matching [`Self::get_cooked_image`] rows.
    pub fn get_cooked_line_wrapped(&self) -> Vec<bool> {
        let mut result = vec![false; self.lines];
        let actual_y = self.hist.lines().saturating_sub(self.hist_cursor);
        for (y, flag) in result.iter_mut().enumerate().take(self.lines.min(actual_y)) {
            *flag = self.hist.is_wrapped(y + self.hist_cursor);
        }
        for y in actual_y..self.lines {
            result[y] = self.line_wrapped[y - actual_y];
        }
        result
    }

    // ── internal image plumbing ────────────────────────────────────────────

    /// Linear offset of a point in the image, reading order.
    fn loc(&self, p: Point) -> i32 {
        p.y * self.columns as i32 + p.x
    }

    fn cell_at_offset(&self, offset: usize) -> Cell {
        self.image[offset / self.columns][offset % self.columns]
    }

    fn set_cell_at_offset(&mut self, offset: usize, cell: Cell) {
        self.image[offset / self.columns][offset % self.columns] = cell;
    }

    /// Fill the reading-order span `[loca, loce]` with `c` in the effective
    /// colors and default rendition; wrap flags of touched rows clear.
    /// Overlapping selections are invalidated.
    fn clear_image(&mut self, loca: Point, loce: Point, c: char) {
        if self.overlap_selection(loca, loce) {
            self.clear_selection();
        }
        let last = self.lines as i32 * self.columns as i32 - 1;
        let start = self.loc(loca).max(0);
        let end = self.loc(loce).min(last);
        if end < start {
            return;
        }
        let cell = Cell::new(u32::from(c), self.eff_fg, self.eff_bg, DEFAULT_RENDITION);
        for offset in start..=end {
            self.set_cell_at_offset(offset as usize, cell);
        }
        let ya = loca.y.max(0) as usize;
        let ye = (loce.y.max(0) as usize).min(self.lines - 1);
        for y in ya..=ye {
            self.line_wrapped[y] = false;
        }
    }

    /// Move the reading-order span `[loca, loce]` so that its first cell
    /// lands on `dest` (memmove semantics, overlap-safe). Row-aligned moves
    /// carry the wrap flags along. Selection endpoints inside the moved span
    /// are translated; endpoints landing in the vacated area invalidate the
    /// selection.
    fn move_image(&mut self, dest: Point, loca: Point, loce: Point) {
        debug_assert!(loce >= loca);
        let last = self.lines as i32 * self.columns as i32 - 1;
        let a = self.loc(loca).max(0);
        let e = self.loc(loce).min(last);
        let d = self.loc(dest).max(0);
        if e >= a && d <= last {
            let count = ((e - a + 1) as usize).min((last - d + 1) as usize);
            if d <= a {
                for i in 0..count {
                    let cell = self.cell_at_offset(a as usize + i);
                    self.set_cell_at_offset(d as usize + i, cell);
                }
            } else {
                for i in (0..count).rev() {
                    let cell = self.cell_at_offset(a as usize + i);
                    self.set_cell_at_offset(d as usize + i, cell);
                }
            }
            if dest.y != loca.y && loca.x == 0 && dest.x == 0 {
                let dy = (loce.y - loca.y + 1).max(0) as usize;
                let ys = loca.y.max(0) as usize;
                let yd = dest.y.max(0) as usize;
                let flags: Vec<bool> = (0..dy)
                    .map(|i| self.line_wrapped.get(ys + i).copied().unwrap_or(false))
                    .collect();
                for (i, flag) in flags.into_iter().enumerate() {
                    if yd + i < self.lines {
                        self.line_wrapped[yd + i] = flag;
                    }
                }
            }
        }

        if self.sel_begin.is_none() {
            return;
        }
        let begin_is_tl = self.sel_begin == self.sel_topleft;
        let diff = dest.sub(loca, self.columns);
        let scr_topleft = Point::of(self.hist.lines(), 0);
        let srca = loca.add(scr_topleft, self.columns);
        let srce = loce.add(scr_topleft, self.columns);
        let desta = srca.add(diff, self.columns);
        let deste = srce.add(diff, self.columns);
        if self.sel_topleft >= srca && self.sel_topleft <= srce {
            self.sel_topleft = self.sel_topleft.add(diff, self.columns);
        } else if self.sel_topleft >= desta && self.sel_topleft <= deste {
            self.sel_bottomright = Point::NONE;
        }
        if self.sel_bottomright >= srca && self.sel_bottomright <= srce {
            self.sel_bottomright = self.sel_bottomright.add(diff, self.columns);
        } else if self.sel_bottomright >= desta && self.sel_bottomright <= deste {
            self.sel_bottomright = Point::NONE;
        }
        if self.sel_bottomright < Point::new(0, 0) {
            self.clear_selection();
        } else if self.sel_topleft < Point::new(0, 0) {
            self.sel_topleft = Point::new(0, 0);
        }
        if begin_is_tl {
            self.sel_begin = self.sel_topleft;
        } else {
            self.sel_begin = self.sel_bottomright;
        }
    }

    fn scroll_up_from(&mut self, from: usize, n: usize) {
        if n == 0 || from + n > self.margin_b {
            return;
        }
        self.move_image(
            Point::of(from, 0),
            Point::of(from + n, 0),
            Point::of(self.margin_b, self.columns - 1),
        );
        self.clear_image(
            Point::of(self.margin_b - n + 1, 0),
            Point::of(self.margin_b, self.columns - 1),
            ' ',
        );
    }

    fn scroll_down_from(&mut self, from: usize, n: usize) {
        if n == 0 || from > self.margin_b {
            return;
        }
        let n = n.min(self.margin_b - from);
        if n == 0 {
            return;
        }
        self.move_image(
            Point::of(from + n, 0),
            Point::of(from, 0),
            Point::of(self.margin_b - n, self.columns - 1),
        );
        self.clear_image(
            Point::of(from, 0),
            Point::of(from + n - 1, self.columns - 1),
            ' ',
        );
    }

    // ── selection ──────────────────────────────────────────────────────────

    /// Begin a selection at display coordinates (`y` is a cooked-image row).
    pub fn set_sel_begin_xy(&mut self, x: usize, y: usize) {
        self.sel_begin = Point::of(y + self.hist_cursor, x);
        if x == self.columns {
            self.sel_begin.advance(-1, self.columns);
        }
        self.sel_topleft = self.sel_begin;
        self.sel_bottomright = self.sel_begin;
    }

    /// Extend the selection; endpoints reorder so that `topleft` is the
    /// lesser point in reading order.
    pub fn set_sel_extend_xy(&mut self, x: usize, y: usize) {
        if self.sel_begin.is_none() {
            return;
        }
        let mut l = Point::of(y + self.hist_cursor, x);
        if l < self.sel_begin {
            self.sel_topleft = l;
            self.sel_bottomright = self.sel_begin;
        } else {
            if x == self.columns {
                l.advance(-1, self.columns);
            }
            self.sel_topleft = self.sel_begin;
            self.sel_bottomright = l;
        }
    }

    pub fn test_is_selected(&self, x: usize, y: usize) -> bool {
        self.is_selected_global(Point::of(y + self.hist_cursor, x))
    }

    fn is_selected_global(&self, pos: Point) -> bool {
        pos >= self.sel_topleft && pos <= self.sel_bottomright
    }

    pub fn clear_selection(&mut self) {
        self.sel_begin = Point::NONE;
        self.sel_topleft = Point::NONE;
        self.sel_bottomright = Point::NONE;
    }

    pub fn has_selection(&self) -> bool {
        !self.sel_begin.is_none()
    }

    /// Extract the selected text. Rows join with `'\n'`
    /// (`preserve_line_break`) or `' '`, except across wrapped rows which
    /// join seamlessly. Trailing whitespace is trimmed per emitted line.
    pub fn get_sel_text(&self, preserve_line_break: bool) -> Option<String> {
        if self.sel_begin.is_none() {
            return None;
        }
        let hist_br = Point::of(self.hist.lines(), 0);
        let columns = self.columns as i32;
        let eol_char = if preserve_line_break { '\n' } else { ' ' };
        let mut out = String::new();
        let mut h_y = self.sel_topleft.y;
        let mut h_x = self.sel_topleft.x;
        let mut s = self.sel_topleft;
        while s <= self.sel_bottomright {
            if s < hist_br {
                // history portion
                let mut eol = self.hist.line_len(h_y.max(0) as usize) as i32;
                if h_y == self.sel_bottomright.y && eol > self.sel_bottomright.x {
                    eol = self.sel_bottomright.x + 1;
                }
                while h_x < eol {
                    if let Some(cell) = self
                        .hist
                        .get_cells(h_y.max(0) as usize, h_x as usize, Some(1))
                        .first()
                        && cell.c != 0
                        && let Some(ch) = char::from_u32(cell.c)
                    {
                        out.push(ch);
                    }
                    s.advance(1, self.columns);
                    h_x += 1;
                }
                if s <= self.sel_bottomright {
                    let wrapped = self.hist.is_wrapped(h_y.max(0) as usize);
                    if eol % columns == 0 {
                        if eol == 0 || !wrapped {
                            out.push(eol_char);
                        }
                    } else if (eol + 1) % columns == 0 {
                        if !wrapped {
                            out.push(eol_char);
                        }
                    } else {
                        out.push(eol_char);
                    }
                }
                h_y += 1;
                h_x = 0;
                s = Point::new(h_y, 0);
            } else {
                // screen portion
                let mut eol = Point::new(s.y + 1, 0);
                eol.advance(-1, self.columns);
                let mut add_new_line = false;
                if eol < self.sel_bottomright {
                    // Trim trailing blanks of the row, unless it wraps.
                    while eol > s {
                        let cell = self.screen_cell(eol.sub(hist_br, self.columns));
                        let row = eol.sub(hist_br, self.columns).y.max(0) as usize;
                        if (cell.c == 0 || cell.is_space()) && !self.is_line_wrapped(row) {
                            eol.advance(-1, self.columns);
                        } else {
                            break;
                        }
                    }
                } else if eol == self.sel_bottomright {
                    let row = eol.sub(hist_br, self.columns).y.max(0) as usize;
                    if !self.is_line_wrapped(row) {
                        add_new_line = true;
                    }
                } else {
                    eol = self.sel_bottomright;
                }
                while s <= eol {
                    let cell = self.screen_cell(s.sub(hist_br, self.columns));
                    if cell.c != 0
                        && let Some(ch) = char::from_u32(cell.c)
                    {
                        out.push(ch);
                    }
                    s.advance(1, self.columns);
                }
                if eol < self.sel_bottomright {
                    let row = eol.sub(hist_br, self.columns).y.max(0) as usize;
                    if eol.x + 1 == columns {
                        if !self.is_line_wrapped(row) {
                            out.push(eol_char);
                        }
                    } else {
                        out.push(eol_char);
                    }
                } else if add_new_line && preserve_line_break {
                    out.push('\n');
                }
                s = Point::new(eol.y + 1, 0);
            }
        }
        let trimmed: Vec<&str> = out.lines().map(str::trim_end).collect();
        Some(trimmed.join("\n"))
    }

    fn screen_cell(&self, pt: Point) -> Cell {
        if pt.y < 0 || pt.x < 0 {
            return Cell::default();
        }
        match self.image.get(pt.y as usize) {
            Some(row) => row.get(pt.x as usize).copied().unwrap_or_default(),
            None => Cell::default(),
        }
    }

    /// Clear the selection when the screen region `[from, to]` overlaps it.
    pub fn check_selection(&mut self, from: Point, to: Point) {
        if self.sel_begin.is_none() {
            return;
        }
        if self.overlap_selection(from, to) {
            self.clear_selection();
        }
    }

    fn overlap_selection(&self, from: Point, to: Point) -> bool {
        let scr_topleft = Point::of(self.hist.lines(), 0);
        self.sel_bottomright > from.add(scr_topleft, self.columns)
            && self.sel_topleft < to.add(scr_topleft, self.columns)
    }
}

/// Palette slot for ANSI color 0..15: 2..9 normal, 12..19 bright.
fn ansi_color_index(color: u32) -> u8 {
    if color & 8 != 0 {
        (color & 7) as u8 + BASE_COLORS + 2
    } else {
        (color & 7) as u8 + 2
    }
}

fn reverse_rendition(cell: &mut Cell) {
    std::mem::swap(&mut cell.fg, &mut cell.bg);
}
