//! The closed error taxonomy and the bounded last-error record a [`Context`]
//! carries.
//!
//! [`Context`]: crate::context::Context

use std::fmt;

/// The closed set of failure codes a `Context` operation can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No error. Not normally constructed directly — `Result::Ok` is used
    /// for the success path; this variant exists so the code is part of the
    /// same enum embedders may want to match exhaustively against.
    Ok,
    /// An allocation request was refused.
    Oom,
    /// The image structure or instruction stream violates its grammar.
    BadBytecode,
    /// A semantic fault during execution (type mismatch, division by zero,
    /// stack underflow in a call).
    Runtime,
    /// A named entity (native, required global) is absent.
    NotFound,
    /// An embedder call received a disallowed argument.
    BadArg,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Ok => "ok",
            Error::Oom => "out of memory",
            Error::BadBytecode => "bad bytecode",
            Error::Runtime => "runtime error",
            Error::NotFound => "not found",
            Error::BadArg => "bad argument",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for Error {}

impl From<vlcore::Oom> for Error {
    fn from(_: vlcore::Oom) -> Self {
        Error::Oom
    }
}

/// Bound on the error message buffer, in bytes.
pub const MAX_ERROR_MESSAGE: usize = 256;

/// The last error recorded by a context: a code plus a bounded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: Error,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: Error, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE {
            // Truncate on a char boundary so the bounded message stays valid
            // UTF-8.
            let mut end = MAX_ERROR_MESSAGE;
            while end > 0 && !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        ErrorRecord { code, message }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_bounded() {
        let long = "x".repeat(1000);
        let rec = ErrorRecord::new(Error::Runtime, long);
        assert!(rec.message.len() <= MAX_ERROR_MESSAGE);
    }

    #[test]
    fn short_message_untouched() {
        let rec = ErrorRecord::new(Error::NotFound, "nope");
        assert_eq!(rec.message, "nope");
    }

    #[test]
    fn display_format() {
        let rec = ErrorRecord::new(Error::Oom, "stack growth refused");
        assert_eq!(format!("{rec}"), "out of memory: stack growth refused");
    }
}
