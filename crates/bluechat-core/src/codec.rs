//! Message payload codec
//!
//! Text travels as raw UTF-8 with no framing: one write or notification carries
//! exactly one message. Text that does not fit in a single payload is rejected
//! rather than truncated or split.

use crate::errors::CodecError;

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Converts between chat text and characteristic payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCodec {
    max_payload_size: usize,
}

impl MessageCodec {
    /// Create a codec bounded by the configured payload size
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// Narrow the bound to what the link negotiated, if the transport reports it
    pub fn with_link_limit(self, link_limit: Option<usize>) -> Self {
        match link_limit {
            Some(limit) => Self::new(self.max_payload_size.min(limit)),
            None => self,
        }
    }

    /// Current payload bound in bytes
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encode outgoing text into a single payload
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, CodecError> {
        let payload = text.as_bytes();
        if payload.len() > self.max_payload_size {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                max_size: self.max_payload_size,
            });
        }
        Ok(payload.to_vec())
    }

    /// Decode an inbound payload; invalid UTF-8 sequences become U+FFFD
    pub fn decode(&self, payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}
