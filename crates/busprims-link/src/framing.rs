use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// End-of-message rule for byte-stream links.
///
/// A message ends at the first EOI character, or at a CR-LF / LF-CR pair
/// when `line_pairs` is set. With no EOI characters and no line pairs every
/// read is delivered as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Terminator {
    pub eoi_chars: Vec<u8>,
    pub line_pairs: bool,
}

impl Default for Terminator {
    fn default() -> Self {
        Self {
            eoi_chars: vec![b'\n'],
            line_pairs: true,
        }
    }
}

impl Terminator {
    /// Deliver whatever each read returns.
    pub fn none() -> Self {
        Self {
            eoi_chars: Vec::new(),
            line_pairs: false,
        }
    }

    /// Terminate on any of `chars`.
    pub fn eoi(chars: impl Into<Vec<u8>>) -> Self {
        Self {
            eoi_chars: chars.into(),
            line_pairs: false,
        }
    }

    pub fn with_line_pairs(mut self, line_pairs: bool) -> Self {
        self.line_pairs = line_pairs;
        self
    }

    pub fn is_chunked(&self) -> bool {
        self.eoi_chars.is_empty() && !self.line_pairs
    }

    /// Length of the first complete message in `buf`, terminator included.
    pub fn message_len(&self, buf: &[u8]) -> Option<usize> {
        for (i, &byte) in buf.iter().enumerate() {
            if self.line_pairs {
                if let Some(&next) = buf.get(i + 1) {
                    if matches!((byte, next), (b'\r', b'\n') | (b'\n', b'\r')) {
                        return Some(i + 2);
                    }
                }
            }
            if self.eoi_chars.contains(&byte) {
                return Some(i + 1);
            }
        }
        None
    }
}

/// Accumulates received bytes and splits off complete messages.
///
/// Bytes after a terminator stay buffered for the next message.
#[derive(Debug)]
pub struct MessageBuffer {
    buf: BytesMut,
    terminator: Terminator,
    max_len: usize,
}

impl MessageBuffer {
    pub fn new(terminator: Terminator, max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            terminator,
            max_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Split off the next complete message, if one is buffered.
    ///
    /// Fails with [`LinkError::MessageTooLong`] once more than `max_len`
    /// bytes are pending without a terminator. The pending bytes are
    /// discarded in that case.
    pub fn take_message(&mut self) -> Result<Option<Bytes>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.terminator.is_chunked() {
            let len = self.buf.len().min(self.max_len);
            return Ok(Some(self.buf.split_to(len).freeze()));
        }

        match self.terminator.message_len(&self.buf) {
            Some(len) => Ok(Some(self.buf.split_to(len).freeze())),
            None if self.buf.len() > self.max_len => {
                let size = self.buf.len();
                self.buf.clear();
                Err(LinkError::MessageTooLong {
                    size,
                    max: self.max_len,
                })
            }
            None => Ok(None),
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }
}
