//! Error taxonomy for the harness.
//!
//! Every fallible operation in the crate surfaces a [`HarnessError`]. The
//! variants mirror the stages of the compile-execute loop: problems with the
//! inbound message itself (`EmptyMessage`, `InvalidType`), classification and
//! synthesis failures (`ClassificationFailed`, `SynthesisEmpty`,
//! `NotImplemented`), runtime failures of synthesized artifacts
//! (`Invocation`, `MissingFinalNotification`), and transport failures of the
//! underlying LM provider (`LmUnavailable`).
//!
//! Propagation policy: `EmptyMessage`, `InvalidType`, `ClassificationFailed`
//! and `NotImplemented` are raised before any session mutation. `Invocation`
//! and `MissingFinalNotification` may leave freshly installed skills behind,
//! but never tidings — tiding commits happen only after a fully successful
//! invocation (or on a streaming routine's `final` notification).

use std::error::Error;
use std::fmt;

/// The error kinds produced by the harness and its components.
#[derive(Debug)]
pub enum HarnessError {
    /// The user message was empty or whitespace-only.
    EmptyMessage,
    /// A message type outside the closed set was supplied, or a flow was
    /// invoked with a type it cannot carry.
    InvalidType(String),
    /// The classification errand produced no answer matching the allowed
    /// message types.
    ClassificationFailed(String),
    /// The LM produced no parsable top-level function where one was
    /// structurally required.
    SynthesisEmpty,
    /// Execution of a synthesized artifact raised inside the script engine.
    Invocation(String),
    /// A streaming routine's notification sequence ended without a `final`
    /// element.
    MissingFinalNotification,
    /// The classifier selected a message type whose pipeline is reserved.
    NotImplemented(String),
    /// The LM transport failed; retries are the caller's concern.
    LmUnavailable(String),
    /// An errand file or embedded errand text is malformed.
    InvalidErrand(String),
    /// A trace sink could not be created.
    Io(std::io::Error),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::EmptyMessage => {
                write!(f, "empty message provided for instruction processing")
            }
            HarnessError::InvalidType(detail) => write!(f, "invalid message type: {}", detail),
            HarnessError::ClassificationFailed(detail) => {
                write!(f, "message type could not be determined: {}", detail)
            }
            HarnessError::SynthesisEmpty => {
                write!(f, "synthesis produced no parsable top-level function")
            }
            HarnessError::Invocation(detail) => write!(f, "invocation failed: {}", detail),
            HarnessError::MissingFinalNotification => {
                write!(f, "streaming routine ended without a final notification")
            }
            HarnessError::NotImplemented(message_type) => {
                write!(f, "message type '{}' has no pipeline yet", message_type)
            }
            HarnessError::LmUnavailable(detail) => {
                write!(f, "language model unavailable: {}", detail)
            }
            HarnessError::InvalidErrand(detail) => write!(f, "invalid errand: {}", detail),
            HarnessError::Io(err) => write!(f, "trace i/o error: {}", err),
        }
    }
}

impl Error for HarnessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HarnessError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Io(err)
    }
}
