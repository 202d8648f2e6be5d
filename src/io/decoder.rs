// src/io/decoder.rs
//
// Streaming UTF-8 decoding stage between the raw reader and the read loop.
// Multi-byte sequences split across reads are carried over; invalid bytes
// decode to U+FFFD.

/// Incremental UTF-8 decoder.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` as possible. A trailing incomplete sequence
    /// is held back for the next call.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest: &[u8] = &input;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush at end of stream. A dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }

    /// Number of bytes held back waiting for the rest of a sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"hello"), "hello");
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn test_split_multibyte_sequence() {
        // "ü" = C3 BC, "€" = E2 82 AC
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(&[b'a', 0xC3]), "a");
        assert_eq!(d.pending_len(), 1);
        assert_eq!(d.decode(&[0xBC, 0xE2, 0x82]), "ü");
        assert_eq!(d.decode(&[0xAC, b'!']), "€!");
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn test_invalid_byte_becomes_replacement() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(&[b'x', 0xFF, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn test_finish_flushes_dangling_sequence() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(&[0xE2, 0x82]), "");
        assert_eq!(d.finish(), "\u{FFFD}");
        assert_eq!(d.finish(), "");
    }
}
