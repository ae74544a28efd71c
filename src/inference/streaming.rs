//! Streaming output types
//!
//! What the controller hands back per step, and what the worker thread sends
//! over its channel.

use std::fmt;

use crate::inference::batch::TokenId;

/// Why (or whether) generation has stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    /// Keep calling `step`
    #[default]
    None,
    /// The model produced an end-of-generation (or null) token
    EndOfGeneration,
    /// The response reached the requested length
    MaxLengthReached,
    /// The stop policy matched a turn boundary
    SyntheticStop,
}

impl StopSignal {
    pub fn is_stop(&self) -> bool {
        !matches!(self, StopSignal::None)
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopSignal::None => "none",
            StopSignal::EndOfGeneration => "end of generation",
            StopSignal::MaxLengthReached => "max length reached",
            StopSignal::SyntheticStop => "stop phrase",
        };
        f.write_str(name)
    }
}

/// Result of one public `step` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Complete UTF-8 text, possibly empty
    pub chunk: String,
    pub signal: StopSignal,
    /// Cursor to pass into the next `step`
    pub cursor: usize,
    /// Token already sampled by a lookahead, to be fed on the next step
    /// instead of sampling again
    pub pending_lookahead: Option<TokenId>,
}

impl StepOutput {
    pub fn is_stop(&self) -> bool {
        self.signal.is_stop()
    }
}

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated text chunk
    Token(String),
    /// Generation completed; `StopSignal::None` when the caller cancelled
    Done(StopSignal),
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// The stop reason if this is a Done variant
    pub fn stop_signal(&self) -> Option<StopSignal> {
        match self {
            StreamToken::Done(signal) => Some(*signal),
            _ => None,
        }
    }
}
