//! Keytab file parser.
//!
//! Line-oriented format: `#` starts a comment, `keyboard "Name"` titles the
//! table, and each `key` line binds a key-plus-predicate to a string or a
//! named operation. Malformed lines are reported with their line number and
//! skipped; parsing always continues.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::keymap::{
    keys, Command, KeyTranslator, BITS_ALT, BITS_ANSI, BITS_APPCUKEYS, BITS_BSHACK, BITS_CONTROL,
    BITS_NEWLINE, BITS_SHIFT,
};

#[derive(Debug, Error)]
pub enum KeytabError {
    #[error("failed to read keytab {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Splits a key definition into its key name and signed modifier tokens,
/// tolerating whitespace around the signs.
fn symbol_regex() -> &'static Regex {
    static SYMBOL_REGEX: OnceLock<Regex> = OnceLock::new();
    SYMBOL_REGEX.get_or_init(|| Regex::new(r"[+-]?\W*\w+").expect("symbol regex must compile"))
}

/// Scanner for one keytab stream.
pub struct KeytabReader<'a> {
    path: String,
    content: &'a str,
    line_no: usize,
    errors: Vec<String>,
}

impl<'a> KeytabReader<'a> {
    pub fn new(path: &str, content: &'a str) -> Self {
        Self {
            path: path.to_owned(),
            content,
            line_no: 0,
            errors: Vec::new(),
        }
    }

    /// Problems encountered so far, one message per skipped line.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Fill `kt` from the stream, skipping malformed lines.
    pub fn parse_to(&mut self, kt: &mut KeyTranslator) {
        for (idx, raw) in self.content.lines().enumerate() {
            self.line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Trailing comments.
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((word, rest)) = split_first_word(line) else {
                continue;
            };
            match word {
                "keyboard" => self.parse_keyboard(kt, rest),
                "key" => self.parse_key(kt, rest),
                _ => self.report("malformed line"),
            }
        }
    }

    /// `keyboard "Title"`.
    fn parse_keyboard(&mut self, kt: &mut KeyTranslator, rest: &str) {
        let rest = rest.trim();
        if rest.len() >= 2 && rest.starts_with('"') && rest.ends_with('"') {
            kt.set_header(rest[1..rest.len() - 1].to_owned());
        } else {
            self.report(&format!("malformed string {rest}"));
        }
    }

    /// `key Name+Mod-Mod : ("text" | operation)`.
    fn parse_key(&mut self, kt: &mut KeyTranslator, rest: &str) {
        let Some((symbols, value)) = rest.split_once(':') else {
            self.report("missing ':' in key line");
            return;
        };
        let mut key = None;
        let mut bits = 0u16;
        let mut mask = 0u16;
        for token in symbol_regex().find_iter(symbols) {
            let token = token.as_str().trim();
            match key {
                None => match keys::from_name(token) {
                    Some(sym) => key = Some(sym),
                    None => {
                        self.report(&format!("{token} is not a valid key"));
                        return;
                    }
                },
                Some(_) => {
                    let mut it = token.chars();
                    let op = it.next();
                    let name = it.as_str().trim();
                    let on = match op {
                        Some('+') => true,
                        Some('-') => false,
                        _ => {
                            self.report(&format!("expected + or - before modifier {token}"));
                            return;
                        }
                    };
                    let Some(bit) = modifier_bit(name) else {
                        self.report(&format!("{name} is not a valid mode or modifier"));
                        return;
                    };
                    if mask & (1 << bit) != 0 {
                        self.report(&format!("mode name {name} used multiple times"));
                        return;
                    }
                    bits |= u16::from(on) << bit;
                    mask |= 1 << bit;
                }
            }
        }
        let Some(key) = key else {
            self.report("missing key name");
            return;
        };
        let value = value.trim();
        let (cmd, text) = if let Some(cmd) = Command::from_name(value) {
            (cmd, Vec::new())
        } else {
            match unquote(value) {
                Some(text) => (Command::Send, text),
                None => {
                    self.report(&format!("malformed string or operation {value}"));
                    return;
                }
            }
        };
        if let Err(prev_line) = kt.add_entry(self.line_no, key, bits, mask, cmd, text) {
            self.report(&format!("keystroke already assigned in line {prev_line}"));
        }
    }

    fn report(&mut self, message: &str) {
        let full = format!("{} line {}: {}", self.path, self.line_no, message);
        log::warn!("{full}");
        self.errors.push(full);
    }
}

fn split_first_word(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.is_empty() {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest)),
        None => Some((line, "")),
    }
}

fn modifier_bit(name: &str) -> Option<u16> {
    Some(match name {
        "Shift" => BITS_SHIFT,
        "Control" => BITS_CONTROL,
        "Alt" => BITS_ALT,
        "BsHack" => BITS_BSHACK,
        "Ansi" => BITS_ANSI,
        "NewLine" => BITS_NEWLINE,
        "AppCuKeys" => BITS_APPCUKEYS,
        _ => return None,
    })
}

/// Decode a double-quoted keytab string into bytes. `\E` is ESC; the usual
/// C escapes and `\xHH` are understood.
fn unquote(value: &str) -> Option<Vec<u8>> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = Vec::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            push_char(&mut out, c);
            continue;
        }
        match chars.next()? {
            'E' | 'e' => out.push(0x1B),
            '\\' => out.push(b'\\'),
            '"' => out.push(b'"'),
            't' => out.push(b'\t'),
            'r' => out.push(b'\r'),
            'n' => out.push(b'\n'),
            'b' => out.push(0x08),
            'f' => out.push(0x0C),
            '0' => out.push(0),
            'x' => {
                let mut value = 0u8;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|d| d.to_digit(16)) {
                        Some(d) => {
                            value = value.wrapping_mul(16).wrapping_add(d as u8);
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return None;
                }
                out.push(value);
            }
            other => push_char(&mut out, other),
        }
    }
    Some(out)
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}
