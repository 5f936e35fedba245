//! Line-ending normalization
//!
//! Rewrites bare LF as CRLF in a byte stream that arrives in arbitrary
//! chunks. The one piece of state is whether the previous chunk ended with
//! a carriage return, so a CRLF split across two chunks is not turned into
//! CR CR LF.

use bytes::{BufMut, Bytes, BytesMut};

/// Stateful LF -> CRLF rewriter
#[derive(Debug, Default)]
pub struct LineNormalizer {
    last_was_cr: bool,
}

impl LineNormalizer {
    /// Create a normalizer with clean state
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one chunk, carrying CR state across calls
    pub fn normalize(&mut self, data: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(data.len() + data.len() / 8);

        for &b in data {
            if b == b'\n' && !self.last_was_cr {
                out.put_u8(b'\r');
            }
            out.put_u8(b);
            self.last_was_cr = b == b'\r';
        }

        out.freeze()
    }
}
