//! Byte-stream codecs.
//!
//! The PTY delivers bytes; the decoder consumes codepoints. Two codecs are
//! selectable at runtime through `ESC % @` / `ESC % G`: the locale codec
//! (Latin-1, byte = codepoint) and an incremental UTF-8 decoder. Decode
//! errors never propagate: a broken sequence becomes U+FFFD and decoding
//! continues with the offending byte.

pub const REPLACEMENT: u32 = 0xFFFD;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    /// Byte-per-character Latin-1, the startup default.
    Locale,
    Utf8,
}

/// Incremental UTF-8 state: the bytes of a partially received sequence.
#[derive(Debug, Default)]
struct Utf8Decoder {
    buf: [u8; 4],
    len: usize,
    need: usize,
}

impl Utf8Decoder {
    fn reset(&mut self) {
        self.len = 0;
        self.need = 0;
    }

    fn push(&mut self, byte: u8, out: &mut Vec<u32>) {
        if self.need == 0 {
            match byte {
                0x00..=0x7F => out.push(u32::from(byte)),
                0xC2..=0xDF => self.start(byte, 2),
                0xE0..=0xEF => self.start(byte, 3),
                0xF0..=0xF4 => self.start(byte, 4),
                // Stray continuation byte or invalid lead (0x80..0xC1, 0xF5..).
                _ => out.push(REPLACEMENT),
            }
            return;
        }
        if byte & 0xC0 == 0x80 {
            self.buf[self.len] = byte;
            self.len += 1;
            if self.len == self.need {
                match std::str::from_utf8(&self.buf[..self.len]) {
                    Ok(s) => out.push(s.chars().next().map_or(REPLACEMENT, u32::from)),
                    Err(_) => out.push(REPLACEMENT),
                }
                self.reset();
            }
        } else {
            // Sequence broken mid-way: emit a replacement and reprocess the
            // byte as the start of a new sequence.
            self.reset();
            out.push(REPLACEMENT);
            self.push(byte, out);
        }
    }

    fn start(&mut self, byte: u8, need: usize) {
        self.buf[0] = byte;
        self.len = 1;
        self.need = need;
    }
}

/// Runtime-selectable byte codec with incremental decode state.
#[derive(Debug)]
pub struct Codec {
    kind: CodecKind,
    utf8: Utf8Decoder,
}

impl Codec {
    pub fn new(kind: CodecKind) -> Self {
        Self {
            kind,
            utf8: Utf8Decoder::default(),
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Switch codecs, discarding any partial decode state.
    pub fn set_kind(&mut self, kind: CodecKind) {
        self.kind = kind;
        self.utf8.reset();
    }

    /// Feed one byte; completed codepoints are appended to `out`.
    pub fn decode_into(&mut self, byte: u8, out: &mut Vec<u32>) {
        match self.kind {
            CodecKind::Locale => out.push(u32::from(byte)),
            CodecKind::Utf8 => self.utf8.push(byte, out),
        }
    }

    /// Encode key-event text for the application side of the PTY.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self.kind {
            CodecKind::Utf8 => text.as_bytes().to_vec(),
            CodecKind::Locale => text
                .chars()
                .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CodecKind::Locale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut Codec, bytes: &[u8]) -> Vec<u32> {
        let mut out = Vec::new();
        for &b in bytes {
            codec.decode_into(b, &mut out);
        }
        out
    }

    #[test]
    fn locale_is_byte_per_char() {
        let mut codec = Codec::default();
        assert_eq!(decode_all(&mut codec, b"A\xe9"), vec![0x41, 0xE9]);
    }

    #[test]
    fn utf8_ascii_and_multibyte() {
        let mut codec = Codec::new(CodecKind::Utf8);
        assert_eq!(
            decode_all(&mut codec, "hé中".as_bytes()),
            vec![u32::from('h'), u32::from('é'), 0x4E2D]
        );
    }

    #[test]
    fn utf8_sequence_split_across_calls() {
        let mut codec = Codec::new(CodecKind::Utf8);
        let bytes = "中".as_bytes();
        let mut out = Vec::new();
        codec.decode_into(bytes[0], &mut out);
        codec.decode_into(bytes[1], &mut out);
        assert!(out.is_empty());
        codec.decode_into(bytes[2], &mut out);
        assert_eq!(out, vec![0x4E2D]);
    }

    #[test]
    fn utf8_errors_become_replacement() {
        let mut codec = Codec::new(CodecKind::Utf8);
        // Stray continuation byte.
        assert_eq!(decode_all(&mut codec, b"\x80A"), vec![REPLACEMENT, 0x41]);
        // Lead byte followed by ASCII: replacement, then the ASCII char.
        assert_eq!(decode_all(&mut codec, b"\xC3A"), vec![REPLACEMENT, 0x41]);
        // Invalid lead.
        assert_eq!(decode_all(&mut codec, b"\xFF"), vec![REPLACEMENT]);
    }

    #[test]
    fn switching_codecs_discards_partial_state() {
        let mut codec = Codec::new(CodecKind::Utf8);
        let mut out = Vec::new();
        codec.decode_into(0xE4, &mut out); // lead of a 3-byte sequence
        codec.set_kind(CodecKind::Locale);
        codec.decode_into(0xB8, &mut out);
        assert_eq!(out, vec![0xB8]);
    }

    #[test]
    fn encode_follows_codec() {
        let locale = Codec::new(CodecKind::Locale);
        assert_eq!(locale.encode("aé中"), vec![b'a', 0xE9, b'?']);
        let utf8 = Codec::new(CodecKind::Utf8);
        assert_eq!(utf8.encode("aé"), "aé".as_bytes().to_vec());
    }
}
