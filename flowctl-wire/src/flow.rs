//! The data-plane flow protocol.
//!
//! A flow is a run of filler bytes followed by a terminator token. The receiver answers
//! with an acknowledgement token once it has seen the terminator. The filler must never
//! contain the terminator, which is why an all-filler terminator is refused.

use bytes::Bytes;
use thiserror::Error;

/// The token that ends a flow.
pub const DEFAULT_TERMINATOR: &[u8] = b"s";
/// The token a responder writes back once a flow has been received.
pub const DEFAULT_ACK: &[u8] = b"r";
/// The byte flow bodies are made of.
pub const FILLER_BYTE: u8 = b'0';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Flow tokens must not be empty")]
    Empty,
    #[error("Terminator consists only of filler bytes")]
    AmbiguousTerminator,
}

/// The terminator and acknowledgement tokens a sender and its responder agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTokens {
    terminator: Bytes,
    ack: Bytes,
}

impl Default for FlowTokens {
    fn default() -> Self {
        Self {
            terminator: Bytes::from_static(DEFAULT_TERMINATOR),
            ack: Bytes::from_static(DEFAULT_ACK),
        }
    }
}

impl FlowTokens {
    pub fn new(terminator: impl Into<Bytes>, ack: impl Into<Bytes>) -> Result<Self, TokenError> {
        let terminator = terminator.into();
        let ack = ack.into();

        if terminator.is_empty() || ack.is_empty() {
            return Err(TokenError::Empty);
        }

        if terminator.iter().all(|b| *b == FILLER_BYTE) {
            return Err(TokenError::AmbiguousTerminator);
        }

        Ok(Self { terminator, ack })
    }

    pub fn terminator(&self) -> &Bytes {
        &self.terminator
    }

    pub fn ack(&self) -> &Bytes {
        &self.ack
    }

    /// Returns a matcher for the terminator, for use on the receiving side.
    pub fn terminator_matcher(&self) -> TailMatcher {
        TailMatcher::new(self.terminator.clone())
    }

    /// Returns a matcher for the acknowledgement, for use on the sending side.
    pub fn ack_matcher(&self) -> TailMatcher {
        TailMatcher::new(self.ack.clone())
    }
}

/// Detects a token at the end of a byte stream, across arbitrary read boundaries.
///
/// Only the last `token.len()` bytes seen are retained.
#[derive(Debug, Clone)]
pub struct TailMatcher {
    token: Bytes,
    tail: Vec<u8>,
}

impl TailMatcher {
    pub fn new(token: Bytes) -> Self {
        let tail = Vec::with_capacity(token.len());
        Self { token, tail }
    }

    /// Feeds the next chunk of the stream. Returns `true` if the stream seen so far ends
    /// with the token.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        let n = self.token.len();

        if chunk.len() >= n {
            self.tail.clear();
            self.tail.extend_from_slice(&chunk[chunk.len() - n..]);
        } else {
            self.tail.extend_from_slice(chunk);
            let excess = self.tail.len().saturating_sub(n);
            self.tail.drain(..excess);
        }

        self.tail == self.token
    }

    pub fn reset(&mut self) {
        self.tail.clear();
    }
}
