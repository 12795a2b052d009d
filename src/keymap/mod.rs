//! Keyboard translation.
//!
//! A [`KeyTranslator`] maps `(keysym, mode/modifier bits)` queries onto
//! either a byte sequence to send to the application or a named command for
//! the embedder. Tables are loaded from `.keytab` files (see
//! [`parser`]); a built-in XTerm table is always available.
//!
//! Translators are collected in a session-scoped [`KeymapRegistry`] and
//! shared read-only behind `Arc`.

pub mod parser;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::keymap::parser::{KeytabError, KeytabReader};

/// Key symbol: printable keys use their ASCII code (letters uppercase),
/// named keys live at `0x1000` and up.
pub type KeySym = u16;

/// Named key symbols and name lookup.
pub mod keys {
    use super::KeySym;

    pub const ESCAPE: KeySym = 0x1000;
    pub const TAB: KeySym = 0x1001;
    pub const BACKTAB: KeySym = 0x1002;
    pub const BACKSPACE: KeySym = 0x1003;
    pub const RETURN: KeySym = 0x1004;
    pub const ENTER: KeySym = 0x1005;
    pub const INSERT: KeySym = 0x1006;
    pub const DELETE: KeySym = 0x1007;
    pub const PAUSE: KeySym = 0x1008;
    pub const PRINT: KeySym = 0x1009;
    pub const SYS_REQ: KeySym = 0x100A;
    pub const HOME: KeySym = 0x1010;
    pub const END: KeySym = 0x1011;
    pub const LEFT: KeySym = 0x1012;
    pub const UP: KeySym = 0x1013;
    pub const RIGHT: KeySym = 0x1014;
    pub const DOWN: KeySym = 0x1015;
    /// Page up.
    pub const PRIOR: KeySym = 0x1016;
    /// Page down.
    pub const NEXT: KeySym = 0x1017;
    pub const SHIFT: KeySym = 0x1020;
    pub const CONTROL: KeySym = 0x1021;
    pub const META: KeySym = 0x1022;
    pub const ALT: KeySym = 0x1023;
    pub const CAPS_LOCK: KeySym = 0x1024;
    pub const NUM_LOCK: KeySym = 0x1025;
    pub const SCROLL_LOCK: KeySym = 0x1026;
    pub const SUPER_L: KeySym = 0x1053;
    pub const SUPER_R: KeySym = 0x1054;
    pub const MENU: KeySym = 0x1055;
    pub const HYPER_L: KeySym = 0x1056;
    pub const HYPER_R: KeySym = 0x1057;

    const F_BASE: KeySym = 0x1030;

    /// Function key `F<n>`, 1-based, up to F35.
    pub const fn function_key(n: u16) -> KeySym {
        F_BASE + n - 1
    }

    const NAMED: &[(&str, KeySym)] = &[
        ("Escape", ESCAPE),
        ("Tab", TAB),
        ("Backtab", BACKTAB),
        ("Backspace", BACKSPACE),
        ("Return", RETURN),
        ("Enter", ENTER),
        ("Insert", INSERT),
        ("Delete", DELETE),
        ("Pause", PAUSE),
        ("Print", PRINT),
        ("SysReq", SYS_REQ),
        ("Home", HOME),
        ("End", END),
        ("Left", LEFT),
        ("Up", UP),
        ("Right", RIGHT),
        ("Down", DOWN),
        ("Prior", PRIOR),
        ("Next", NEXT),
        ("Shift", SHIFT),
        ("Control", CONTROL),
        ("Meta", META),
        ("Alt", ALT),
        ("CapsLock", CAPS_LOCK),
        ("NumLock", NUM_LOCK),
        ("ScrollLock", SCROLL_LOCK),
        ("Super_L", SUPER_L),
        ("Super_R", SUPER_R),
        ("Menu", MENU),
        ("Hyper_L", HYPER_L),
        ("Hyper_R", HYPER_R),
        ("Space", 0x20),
        ("Exclam", 0x21),
        ("QuoteDbl", 0x22),
        ("NumberSign", 0x23),
        ("Dollar", 0x24),
        ("Percent", 0x25),
        ("Ampersand", 0x26),
        ("Apostrophe", 0x27),
        ("ParenLeft", 0x28),
        ("ParenRight", 0x29),
        ("Asterisk", 0x2A),
        ("Plus", 0x2B),
        ("Comma", 0x2C),
        ("Minus", 0x2D),
        ("Period", 0x2E),
        ("Slash", 0x2F),
        ("Colon", 0x3A),
        ("Semicolon", 0x3B),
        ("Less", 0x3C),
        ("Equal", 0x3D),
        ("Greater", 0x3E),
        ("Question", 0x3F),
        ("At", 0x40),
        ("BracketLeft", 0x5B),
        ("Backslash", 0x5C),
        ("BracketRight", 0x5D),
        ("AsciiCircum", 0x5E),
        ("Underscore", 0x5F),
        ("QuoteLeft", 0x60),
        ("BraceLeft", 0x7B),
        ("Bar", 0x7C),
        ("BraceRight", 0x7D),
        ("AsciiTilde", 0x7E),
    ];

    /// Resolve a keytab key name ("Return", "F5", "A", ...).
    pub fn from_name(name: &str) -> Option<KeySym> {
        if let Some(&(_, sym)) = NAMED.iter().find(|(n, _)| *n == name) {
            return Some(sym);
        }
        // Single letters and digits map to their ASCII code.
        if name.len() == 1 {
            let c = name.as_bytes()[0];
            if c.is_ascii_uppercase() || c.is_ascii_digit() {
                return Some(KeySym::from(c));
            }
        }
        // Function keys F1..F35.
        if let Some(rest) = name.strip_prefix('F')
            && let Ok(n) = rest.parse::<u16>()
            && (1..=35).contains(&n)
        {
            return Some(function_key(n));
        }
        None
    }

    /// Keysym for a printable character (letters fold to uppercase).
    pub fn from_char(c: char) -> Option<KeySym> {
        if c.is_ascii_graphic() || c == ' ' {
            Some(KeySym::from(c.to_ascii_uppercase() as u8))
        } else {
            None
        }
    }
}

// Bit positions of the mode/modifier predicate attached to an entry.
pub const BITS_NEWLINE: u16 = 0;
/// Deprecated, accepted for compatibility with old tables.
pub const BITS_BSHACK: u16 = 1;
pub const BITS_ANSI: u16 = 2;
pub const BITS_APPCUKEYS: u16 = 3;
pub const BITS_CONTROL: u16 = 4;
pub const BITS_SHIFT: u16 = 5;
pub const BITS_ALT: u16 = 6;

pub fn encode_modes(newline: bool, ansi: bool, appcukeys: bool) -> u16 {
    (u16::from(newline) << BITS_NEWLINE)
        | (u16::from(ansi) << BITS_ANSI)
        | (u16::from(appcukeys) << BITS_APPCUKEYS)
}

pub fn encode_buttons(control: bool, shift: bool, alt: bool) -> u16 {
    (u16::from(control) << BITS_CONTROL)
        | (u16::from(shift) << BITS_SHIFT)
        | (u16::from(alt) << BITS_ALT)
}

/// What a matched entry does: send its text, or ask the embedder to perform
/// a named operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Send,
    EmitSelection,
    EmitClipboard,
    ScrollLineUp,
    ScrollLineDown,
    ScrollPageUp,
    ScrollPageDown,
    PrevSession,
    NextSession,
    NewSession,
    RenameSession,
    ActivateMenu,
    MoveSessionLeft,
    MoveSessionRight,
    ScrollLock,
}

impl Command {
    /// Named operations as they appear in keytab files (`Send` has no name;
    /// it is implied by a quoted string).
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "scrollLineUp" => Command::ScrollLineUp,
            "scrollLineDown" => Command::ScrollLineDown,
            "scrollPageUp" => Command::ScrollPageUp,
            "scrollPageDown" => Command::ScrollPageDown,
            "emitSelection" => Command::EmitSelection,
            "emitClipboard" => Command::EmitClipboard,
            "prevSession" => Command::PrevSession,
            "nextSession" => Command::NextSession,
            "newSession" => Command::NewSession,
            "renameSession" => Command::RenameSession,
            "activateMenu" => Command::ActivateMenu,
            "moveSessionLeft" => Command::MoveSessionLeft,
            "moveSessionRight" => Command::MoveSessionRight,
            "scrollLock" => Command::ScrollLock,
            _ => return None,
        })
    }
}

/// One keytab assignment.
#[derive(Clone, Debug)]
pub struct KeyEntry {
    /// Line number of the defining keytab line, for conflict reports.
    pub ref_line: usize,
    pub key: KeySym,
    /// Required values for the bits selected by `mask`.
    pub bits: u16,
    pub mask: u16,
    pub cmd: Command,
    pub text: Vec<u8>,
}

impl KeyEntry {
    fn matches(&self, key: KeySym, bits: u16) -> bool {
        key == self.key && (self.bits & self.mask) == (bits & self.mask)
    }

    /// True when the entry explicitly requires Alt; such entries suppress
    /// the automatic ESC prefix on Alt-modified sends.
    pub fn metaspecified(&self) -> bool {
        (self.mask & (1 << BITS_ALT)) != 0 && (self.bits & (1 << BITS_ALT)) != 0
    }
}

/// A keyboard translation table: ordered entries, first match wins.
#[derive(Clone, Debug)]
pub struct KeyTranslator {
    id: String,
    /// Human-readable title from the `keyboard "..."` header line.
    header: String,
    path: Option<PathBuf>,
    table: Vec<KeyEntry>,
}

impl KeyTranslator {
    fn new(id: String, path: Option<PathBuf>) -> Self {
        Self {
            id,
            header: String::new(),
            path,
            table: Vec::new(),
        }
    }

    /// The built-in XTerm table.
    pub fn builtin() -> Self {
        let mut translator = Self::new("default".into(), None);
        let mut reader = KeytabReader::new("[builtin]", include_str!("default.keytab"));
        reader.parse_to(&mut translator);
        debug_assert!(reader.errors().is_empty(), "builtin keytab must parse");
        translator
    }

    /// Load a table from a `.keytab` file; malformed lines are logged and
    /// skipped, only I/O failures are fatal.
    pub fn from_file(path: &Path) -> Result<Self, KeytabError> {
        let content = std::fs::read_to_string(path).map_err(|source| KeytabError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        let mut translator = Self::new(id, Some(path.to_path_buf()));
        let mut reader = KeytabReader::new(&path.to_string_lossy(), &content);
        reader.parse_to(&mut translator);
        Ok(translator)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub(crate) fn set_header(&mut self, header: String) {
        self.header = header;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Add an assignment; on conflict with an existing entry, returns the
    /// line number of the earlier definition.
    pub fn add_entry(
        &mut self,
        ref_line: usize,
        key: KeySym,
        bits: u16,
        mask: u16,
        cmd: Command,
        text: Vec<u8>,
    ) -> Result<(), usize> {
        if let Some(existing) = self.lookup(key, bits) {
            return Err(existing.ref_line);
        }
        self.table.push(KeyEntry {
            ref_line,
            key,
            bits,
            mask,
            cmd,
            text,
        });
        Ok(())
    }

    /// Find the entry for a key under the given mode and modifier state.
    pub fn find_entry(
        &self,
        key: KeySym,
        newline: bool,
        ansi: bool,
        appcukeys: bool,
        control: bool,
        shift: bool,
        alt: bool,
    ) -> Option<&KeyEntry> {
        let bits = encode_modes(newline, ansi, appcukeys) | encode_buttons(control, shift, alt);
        self.lookup(key, bits)
    }

    fn lookup(&self, key: KeySym, bits: u16) -> Option<&KeyEntry> {
        self.table.iter().find(|entry| entry.matches(key, bits))
    }
}

/// Session-scoped collection of translators, addressed by id. Slot 0 is the
/// built-in table and doubles as the fallback.
pub struct KeymapRegistry {
    maps: Vec<Arc<KeyTranslator>>,
}

impl KeymapRegistry {
    pub fn new() -> Self {
        Self {
            maps: vec![Arc::new(KeyTranslator::builtin())],
        }
    }

    pub fn count(&self) -> usize {
        self.maps.len()
    }

    pub fn default_map(&self) -> Arc<KeyTranslator> {
        Arc::clone(&self.maps[0])
    }

    /// Load and register a keytab file.
    pub fn add_file(&mut self, path: &Path) -> Result<Arc<KeyTranslator>, KeytabError> {
        let translator = Arc::new(KeyTranslator::from_file(path)?);
        self.maps.push(Arc::clone(&translator));
        Ok(translator)
    }

    /// Translator by id, falling back to the built-in table.
    pub fn find(&self, id: &str) -> Arc<KeyTranslator> {
        self.maps
            .iter()
            .find(|map| map.id() == id)
            .cloned()
            .unwrap_or_else(|| self.default_map())
    }
}

impl Default for KeymapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_parses_and_has_a_header() {
        let kt = KeyTranslator::builtin();
        assert!(!kt.is_empty());
        assert_eq!(kt.header(), "XTerm (XFree 4.x.x)");
    }

    #[test]
    fn plain_return_sends_cr() {
        let kt = KeyTranslator::builtin();
        let entry = kt
            .find_entry(keys::RETURN, false, true, false, false, false, false)
            .expect("Return entry");
        assert_eq!(entry.cmd, Command::Send);
        assert_eq!(entry.text, b"\r");
    }

    #[test]
    fn return_with_newline_mode_sends_crlf() {
        let kt = KeyTranslator::builtin();
        let entry = kt
            .find_entry(keys::RETURN, true, true, false, false, false, false)
            .expect("Return+NewLine entry");
        assert_eq!(entry.text, b"\r\n");
    }

    #[test]
    fn cursor_keys_depend_on_ansi_and_appcukeys() {
        let kt = KeyTranslator::builtin();
        let up_vt52 = kt
            .find_entry(keys::UP, false, false, false, false, false, false)
            .unwrap();
        assert_eq!(up_vt52.text, b"\x1bA");
        let up_ansi = kt
            .find_entry(keys::UP, false, true, false, false, false, false)
            .unwrap();
        assert_eq!(up_ansi.text, b"\x1b[A");
        let up_app = kt
            .find_entry(keys::UP, false, true, true, false, false, false)
            .unwrap();
        assert_eq!(up_app.text, b"\x1bOA");
    }

    #[test]
    fn shift_up_scrolls_instead_of_sending() {
        let kt = KeyTranslator::builtin();
        let entry = kt
            .find_entry(keys::UP, false, true, false, false, true, false)
            .unwrap();
        assert_eq!(entry.cmd, Command::ScrollLineUp);
    }

    #[test]
    fn first_matching_entry_wins() {
        let mut kt = KeyTranslator::new("test".into(), None);
        kt.add_entry(1, keys::HOME, 0, 0, Command::Send, b"first".to_vec())
            .unwrap();
        // Unconditionally shadowed by line 1.
        assert_eq!(
            kt.add_entry(2, keys::HOME, 0, 0, Command::Send, b"second".to_vec()),
            Err(1)
        );
        let entry = kt
            .find_entry(keys::HOME, false, true, false, false, false, false)
            .unwrap();
        assert_eq!(entry.text, b"first");
    }

    #[test]
    fn mask_limits_which_bits_matter() {
        let mut kt = KeyTranslator::new("test".into(), None);
        // Require Shift set, ignore everything else.
        kt.add_entry(
            1,
            keys::TAB,
            1 << BITS_SHIFT,
            1 << BITS_SHIFT,
            Command::Send,
            b"\x1b[Z".to_vec(),
        )
        .unwrap();
        assert!(kt
            .find_entry(keys::TAB, true, true, true, false, true, false)
            .is_some());
        assert!(kt
            .find_entry(keys::TAB, true, true, true, false, false, false)
            .is_none());
    }

    #[test]
    fn metaspecified_requires_alt_in_mask_and_bits() {
        let mut kt = KeyTranslator::new("test".into(), None);
        kt.add_entry(
            1,
            keys::LEFT,
            1 << BITS_ALT,
            1 << BITS_ALT,
            Command::Send,
            b"\x1bb".to_vec(),
        )
        .unwrap();
        let entry = kt
            .find_entry(keys::LEFT, false, true, false, false, false, true)
            .unwrap();
        assert!(entry.metaspecified());
    }

    #[test]
    fn key_names_resolve() {
        assert_eq!(keys::from_name("Escape"), Some(keys::ESCAPE));
        assert_eq!(keys::from_name("F5"), Some(keys::function_key(5)));
        assert_eq!(keys::from_name("F35"), Some(keys::function_key(35)));
        assert_eq!(keys::from_name("F36"), None);
        assert_eq!(keys::from_name("A"), Some(0x41));
        assert_eq!(keys::from_name("7"), Some(0x37));
        assert_eq!(keys::from_name("Space"), Some(0x20));
        assert_eq!(keys::from_name("NoSuchKey"), None);
        assert_eq!(keys::from_char('a'), Some(0x41));
    }

    #[test]
    fn registry_finds_by_id_with_fallback() {
        let registry = KeymapRegistry::new();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.find("default").id(), "default");
        assert_eq!(registry.find("missing").id(), "default");
    }
}
