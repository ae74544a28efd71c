//! UTF-8 reassembly
//!
//! A single token may decode to only part of a multi-byte character. Bytes are
//! held here until they form complete characters, so the host never receives a
//! malformed or truncated chunk.

/// Expected encoded length for a UTF-8 lead byte, or `None` if `byte` cannot
/// start a character.
pub fn classify_lead_byte(byte: u8) -> Option<usize> {
    if byte & 0x80 == 0x00 {
        Some(1)
    } else if byte & 0xE0 == 0xC0 {
        Some(2)
    } else if byte & 0xF0 == 0xE0 {
        Some(3)
    } else if byte & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Shape of a byte sequence with respect to UTF-8 framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Status {
    /// Every character is complete and well-formed (includes the empty input)
    Complete,
    /// Well-formed so far, but the final character is missing `missing` bytes
    Incomplete { missing: usize },
    /// A lead or continuation byte breaks the length-prefix rules
    Invalid,
}

/// Walks `bytes` using the length-prefix rules.
pub fn scan(bytes: &[u8]) -> Utf8Status {
    let mut i = 0;
    while i < bytes.len() {
        let Some(width) = classify_lead_byte(bytes[i]) else {
            return Utf8Status::Invalid;
        };
        let end = i + width;
        let available = end.min(bytes.len());
        if !bytes[i + 1..available].iter().all(|&b| is_continuation(b)) {
            return Utf8Status::Invalid;
        }
        if end > bytes.len() {
            return Utf8Status::Incomplete {
                missing: end - bytes.len(),
            };
        }
        i = end;
    }
    Utf8Status::Complete
}

/// True when every multi-byte run in `bytes` is complete and framed by
/// `10xxxxxx` continuation bytes. `None` and empty input are valid.
pub fn is_valid_utf8(bytes: Option<&[u8]>) -> bool {
    match bytes {
        None => true,
        Some(bytes) => scan(bytes) == Utf8Status::Complete,
    }
}

/// Result of feeding a piece into the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// A complete run of characters, pending buffer now empty
    Emit(String),
    /// The trailing character needs more bytes
    NeedMore,
    /// The pending bytes could not be decoded and were dropped
    Discarded,
}

/// Holds decoded bytes until they form complete characters.
#[derive(Debug, Default)]
pub struct Utf8Reassembler {
    pending: Vec<u8>,
}

impl Utf8Reassembler {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(8),
        }
    }

    /// Appends `piece` and emits everything if the buffer is now complete.
    pub fn feed(&mut self, piece: &[u8]) -> Feed {
        self.pending.extend_from_slice(piece);

        match scan(&self.pending) {
            Utf8Status::Complete => {
                let bytes = std::mem::take(&mut self.pending);
                match String::from_utf8(bytes) {
                    Ok(text) => Feed::Emit(text),
                    // Surrogates and overlong forms pass the framing rules
                    Err(e) => {
                        tracing::warn!("Dropping {} undecodable bytes: {e}", e.as_bytes().len());
                        Feed::Discarded
                    }
                }
            }
            Utf8Status::Incomplete { missing } => {
                tracing::trace!(
                    "Holding {} bytes, {missing} more needed",
                    self.pending.len()
                );
                Feed::NeedMore
            }
            Utf8Status::Invalid => {
                tracing::warn!("Dropping {} malformed bytes", self.pending.len());
                self.pending.clear();
                Feed::Discarded
            }
        }
    }

    /// Expected length of the character at the head of the buffer
    pub fn expected_len(&self) -> Option<usize> {
        self.pending.first().and_then(|&b| classify_lead_byte(b))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
