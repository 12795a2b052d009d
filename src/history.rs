//! Scrollback history.
//!
//! Lines scrolled off the top of the primary screen land here. The buffer is
//! a bounded ring: `max_lines` slots of which `max_lines - 1` are usable, one
//! slot being a normalization reserve that keeps the adjusted-line-number
//! arithmetic stable across resizes. Lookups go through [`ScrollbackBuffer::adjust`],
//! which maps logical line numbers (0 = oldest retained) onto ring slots.
//!
//! The alternate screen uses [`HistoryScroll::None`], which swallows lines.

use serde::{Deserialize, Serialize};

use crate::cell::Cell;

/// History configuration, stored in [`TerminalConfig`] and applied through
/// [`HistoryType::make_scroll`].
///
/// [`TerminalConfig`]: crate::config::TerminalConfig
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryType {
    None,
    Buffer { max_lines: usize },
}

impl HistoryType {
    pub fn is_on(&self) -> bool {
        matches!(self, HistoryType::Buffer { .. })
    }

    pub fn size(&self) -> usize {
        match self {
            HistoryType::None => 0,
            HistoryType::Buffer { max_lines } => *max_lines,
        }
    }

    /// Build the scroll for this configuration, migrating the most recent
    /// lines of `old` in order.
    pub fn make_scroll(self, old: HistoryScroll) -> HistoryScroll {
        match self {
            HistoryType::None => HistoryScroll::None,
            HistoryType::Buffer { max_lines } => match old {
                HistoryScroll::Buffer(mut buffer) => {
                    buffer.set_max_lines(max_lines);
                    HistoryScroll::Buffer(buffer)
                }
                HistoryScroll::None => HistoryScroll::Buffer(ScrollbackBuffer::new(max_lines)),
            },
        }
    }
}

/// A screen's scrollback store.
#[derive(Clone, Debug)]
pub enum HistoryScroll {
    /// Swallows added lines; every query reports empty.
    None,
    Buffer(ScrollbackBuffer),
}

impl HistoryScroll {
    pub fn has_scroll(&self) -> bool {
        matches!(self, HistoryScroll::Buffer(_))
    }

    /// Number of retained lines.
    pub fn lines(&self) -> usize {
        match self {
            HistoryScroll::None => 0,
            HistoryScroll::Buffer(b) => b.lines,
        }
    }

    pub fn line_len(&self, line: usize) -> usize {
        match self {
            HistoryScroll::None => 0,
            HistoryScroll::Buffer(b) => b.line_len(line),
        }
    }

    pub fn is_wrapped(&self, line: usize) -> bool {
        match self {
            HistoryScroll::None => false,
            HistoryScroll::Buffer(b) => b.is_wrapped(line),
        }
    }

    /// Cells of `line` starting at `col`; the whole remainder when `count`
    /// is `None`. Out-of-range requests return an empty vector.
    pub fn get_cells(&self, line: usize, col: usize, count: Option<usize>) -> Vec<Cell> {
        match self {
            HistoryScroll::None => Vec::new(),
            HistoryScroll::Buffer(b) => b.get_cells(line, col, count),
        }
    }

    pub fn add_cells(&mut self, cells: &[Cell], wrapped: bool) {
        if let HistoryScroll::Buffer(b) = self {
            b.add_cells(cells, wrapped);
        }
    }

    pub fn history_type(&self) -> HistoryType {
        match self {
            HistoryScroll::None => HistoryType::None,
            HistoryScroll::Buffer(b) => HistoryType::Buffer {
                max_lines: b.max_lines,
            },
        }
    }
}

/// The bounded ring itself.
#[derive(Clone, Debug)]
pub struct ScrollbackBuffer {
    max_lines: usize,
    /// Retained line count, capped at `max_lines - 1`.
    lines: usize,
    /// Next slot to write.
    array_index: usize,
    /// Set once the ring has wrapped around.
    filled: bool,
    buffer: Vec<Option<Vec<Cell>>>,
    wrapped: Vec<bool>,
}

impl ScrollbackBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: 0,
            array_index: 0,
            filled: false,
            buffer: vec![None; max_lines],
            wrapped: vec![false; max_lines],
        }
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Store a snapshot of `cells` as the newest line.
    pub fn add_cells(&mut self, cells: &[Cell], wrapped: bool) {
        self.buffer[self.array_index] = Some(cells.to_vec());
        self.wrapped[self.array_index] = wrapped;
        self.array_index += 1;
        if self.array_index >= self.max_lines {
            self.array_index = 0;
            self.filled = true;
        }
        if self.lines < self.max_lines - 1 {
            self.lines += 1;
        }
    }

    pub fn line_len(&self, line: usize) -> usize {
        if line >= self.max_lines {
            return 0;
        }
        match &self.buffer[self.adjust(line)] {
            Some(cells) => cells.len(),
            None => 0,
        }
    }

    pub fn is_wrapped(&self, line: usize) -> bool {
        if line >= self.max_lines {
            return false;
        }
        self.wrapped[self.adjust(line)]
    }

    pub fn get_cells(&self, line: usize, col: usize, count: Option<usize>) -> Vec<Cell> {
        if line >= self.max_lines {
            return Vec::new();
        }
        let Some(cells) = &self.buffer[self.adjust(line)] else {
            return Vec::new();
        };
        if col >= cells.len() {
            return Vec::new();
        }
        let count = count.unwrap_or(cells.len());
        let end = (col + count).min(cells.len());
        cells[col..end].to_vec()
    }

    /// Map a logical line number onto a ring slot. The `+2` skips the write
    /// slot and the normalization reserve once the ring has wrapped.
    /// Load-bearing constant; change only with the history tests green.
    fn adjust(&self, line: usize) -> usize {
        if self.filled {
            (line + self.array_index + 2) % self.max_lines
        } else {
            line
        }
    }

    /// Change the capacity, preserving the most recent lines in order.
    pub fn set_max_lines(&mut self, new_max: usize) {
        self.normalize();
        if self.max_lines > new_max {
            let start = (self.array_index + 2).saturating_sub(new_max);
            self.buffer = self.buffer.split_off(start);
            self.buffer.truncate(new_max);
            self.wrapped = self.wrapped.split_off(start);
            self.wrapped.truncate(new_max);
            if self.array_index >= new_max {
                self.array_index = new_max - 2;
            }
        } else {
            self.buffer.resize(new_max, None);
            self.wrapped.resize(new_max, false);
        }
        self.max_lines = new_max;
        if self.lines > new_max.saturating_sub(2) {
            self.lines = new_max.saturating_sub(2);
        }
    }

    /// Rewrite the ring so slot 0 holds the oldest retained line and the
    /// write index sits at `max_lines - 2`, leaving the ring unwrapped.
    fn normalize(&mut self) {
        if !self.filled {
            return;
        }
        let max = self.max_lines;
        let mut buffer: Vec<Option<Vec<Cell>>> = vec![None; max];
        let mut wrapped = vec![false; max];
        for k in 0..max.saturating_sub(2) {
            let slot = (self.array_index as i64 - 1 - k as i64).rem_euclid(max as i64) as usize;
            buffer[max - 3 - k] = self.buffer[slot].take();
            wrapped[max - 3 - k] = self.wrapped[slot];
        }
        self.buffer = buffer;
        self.wrapped = wrapped;
        self.array_index = max - 2;
        self.filled = false;
        self.lines = max - 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Vec<Cell> {
        text.chars()
            .map(|c| Cell::new(u32::from(c), 0, 1, 0))
            .collect()
    }

    fn slot_text(buffer: &ScrollbackBuffer, slot: usize) -> Option<String> {
        buffer.buffer[slot].as_ref().map(|cells| {
            cells
                .iter()
                .filter_map(|cell| char::from_u32(cell.c))
                .collect()
        })
    }

    fn slots(buffer: &ScrollbackBuffer) -> Vec<Option<String>> {
        (0..buffer.max_lines).map(|i| slot_text(buffer, i)).collect()
    }

    fn owned(texts: &[Option<&str>]) -> Vec<Option<String>> {
        texts.iter().map(|t| t.map(str::to_owned)).collect()
    }

    #[test]
    fn none_scroll_swallows_lines() {
        let mut hist = HistoryScroll::None;
        hist.add_cells(&line("bonjour"), true);
        assert!(!hist.has_scroll());
        assert_eq!(hist.lines(), 0);
        assert_eq!(hist.line_len(1), 0);
        assert!(!hist.is_wrapped(1));
        assert!(hist.get_cells(1, 0, None).is_empty());
    }

    #[test]
    fn one_line() {
        let mut hist = ScrollbackBuffer::new(5);
        let cells = line("bonjour");
        hist.add_cells(&cells, true);
        assert_eq!(hist.lines(), 1);
        assert_eq!(hist.line_len(0), cells.len());
        assert!(hist.is_wrapped(0));
        assert_eq!(hist.get_cells(0, 0, None), cells);
        assert!(!hist.filled);
    }

    #[test]
    fn ring_wraps_once_full() {
        let mut hist = ScrollbackBuffer::new(5);
        for text in ["1", "22", "333", "4444", "55555", "666666"] {
            hist.add_cells(&line(text), true);
        }
        assert!(hist.filled);
        assert_eq!(
            slots(&hist),
            owned(&[
                Some("666666"),
                Some("22"),
                Some("333"),
                Some("4444"),
                Some("55555"),
            ])
        );
        assert_eq!(hist.lines(), 4);
    }

    #[test]
    fn normalize_keeps_most_recent_lines_in_order() {
        let mut hist = ScrollbackBuffer::new(5);
        for text in ["1", "22", "333", "4444", "55555", "666666"] {
            hist.add_cells(&line(text), true);
        }
        hist.normalize();
        assert!(!hist.filled);
        assert_eq!(
            slots(&hist),
            owned(&[Some("4444"), Some("55555"), Some("666666"), None, None])
        );
        hist.add_cells(&line("7777777"), false);
        assert_eq!(
            slots(&hist),
            owned(&[
                Some("4444"),
                Some("55555"),
                Some("666666"),
                Some("7777777"),
                None,
            ])
        );
    }

    #[test]
    fn resize_before_fill() {
        let mut hist = ScrollbackBuffer::new(5);
        hist.add_cells(&line("1"), true);
        hist.set_max_lines(4);
        assert!(!hist.filled);
        assert_eq!(slots(&hist), owned(&[Some("1"), None, None, None]));
        hist.set_max_lines(5);
        assert!(!hist.filled);
        assert_eq!(slots(&hist), owned(&[Some("1"), None, None, None, None]));
        hist.add_cells(&line("22"), false);
        assert_eq!(
            slots(&hist),
            owned(&[Some("1"), Some("22"), None, None, None])
        );
    }

    #[test]
    fn resize_after_fill() {
        let mut hist = ScrollbackBuffer::new(5);
        for text in ["1", "22", "333", "4444", "55555", "666666"] {
            hist.add_cells(&line(text), true);
        }
        hist.set_max_lines(6);
        assert!(!hist.filled);
        assert_eq!(
            slots(&hist),
            owned(&[
                Some("4444"),
                Some("55555"),
                Some("666666"),
                None,
                None,
                None,
            ])
        );
        hist.add_cells(&line("7777777"), false);
        assert_eq!(
            slots(&hist),
            owned(&[
                Some("4444"),
                Some("55555"),
                Some("666666"),
                Some("7777777"),
                None,
                None,
            ])
        );
        hist.set_max_lines(3);
        assert!(!hist.filled);
        assert_eq!(slots(&hist), owned(&[Some("7777777"), None, None]));
        hist.add_cells(&line("88888888"), false);
        assert_eq!(
            slots(&hist),
            owned(&[Some("7777777"), Some("88888888"), None])
        );
    }

    #[test]
    fn latest_line_reads_back() {
        let mut hist = ScrollbackBuffer::new(8);
        hist.add_cells(&line("first"), false);
        hist.add_cells(&line("second"), true);
        assert_eq!(hist.get_cells(hist.lines() - 1, 0, None), line("second"));
        assert!(hist.is_wrapped(hist.lines() - 1));
    }

    #[test]
    fn out_of_range_queries_are_empty() {
        let mut hist = ScrollbackBuffer::new(4);
        hist.add_cells(&line("abc"), false);
        assert!(hist.get_cells(99, 0, None).is_empty());
        assert!(hist.get_cells(0, 99, Some(1)).is_empty());
        assert_eq!(hist.line_len(99), 0);
        assert!(!hist.is_wrapped(99));
        // Partial reads clamp to the line end.
        assert_eq!(hist.get_cells(0, 1, Some(10)), line("bc"));
    }

    #[test]
    fn type_migration_reuses_buffer() {
        let mut hist = HistoryScroll::Buffer(ScrollbackBuffer::new(5));
        hist.add_cells(&line("keep me"), false);
        let migrated = HistoryType::Buffer { max_lines: 8 }.make_scroll(hist);
        assert_eq!(migrated.lines(), 1);
        assert_eq!(migrated.get_cells(0, 0, None), line("keep me"));
        assert_eq!(
            migrated.history_type(),
            HistoryType::Buffer { max_lines: 8 }
        );

        let dropped = HistoryType::None.make_scroll(migrated);
        assert!(!dropped.has_scroll());
    }
}
