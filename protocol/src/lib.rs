//! Wire protocol for the manager/worker control channel.
//!
//! Every control message is a UTF-8 line terminated by `\n`; some carry a
//! following binary or text payload whose length is given on the header
//! line. This crate only knows how to parse and format lines — it never
//! touches a socket. Parsing is strict: anything that doesn't match a
//! known keyword is reported as [`ProtocolError::UnknownMessage`] and it
//! is the caller's job to decide what that means for the connection.

mod format;
mod message;
mod result_code;

pub use format::*;
pub use message::{parse_header_line, InboundHeader, InboundMessage, PROTOCOL_VERSION};
pub use result_code::ResultStatus;

use thiserror::Error;

/// Parse/format failures. None of these should ever crash the manager —
/// callers log and drop the offending connection (spec.md §7).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    #[error("empty line")]
    EmptyLine,
    #[error("unknown message keyword: {0:?}")]
    UnknownMessage(String),
    #[error("malformed {kind} line: {line:?}")]
    Malformed { kind: &'static str, line: String },
    #[error("line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
}

/// The codec's return discipline (spec.md §4.1, "Return discipline").
///
/// A handler returns one of these to tell the event loop what to do with
/// the worker connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Message handled, connection stays open.
    Processed,
    /// Message handled, but the connection must now be closed (e.g. a
    /// status query was answered, or the greeting failed verification).
    ProcessedDisconnect,
    /// The message wasn't recognized/applicable here; caller decides.
    NotProcessed,
    /// Handling the message failed outright (malformed payload, I/O
    /// error while draining a payload, etc) — the worker must be
    /// dropped as a worker failure.
    Failure,
}

/// Maximum line length accepted on a worker connection. Anything longer
/// is treated as a malformed message and the worker is dropped.
pub const LINE_MAX: usize = 1 << 20;

/// Maximum bytes of a task's stdout ever retained (spec.md §6).
pub const MAX_TASK_STDOUT_STORAGE: u64 = 1 << 30;
