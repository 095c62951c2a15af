//! # Error
//! The error taxonomy shared by every module in this crate. Every fallible
//! public operation returns [`Result<T>`], never a bare `std::io::Error` or
//! a `String`, so that callers can match on the kind of failure instead of
//! grepping a message.

use std::fmt;
use std::io;

/// The kind of failure that occurred. Carried alongside a human-readable
/// reason naming the faulting parameter (a resource name, a peer id, an
/// expected vs. actual count, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad bit widths, duplicate names, registration mismatch, or an
    /// attempt to set a directory key that already exists.
    Config,
    /// Allocation failure reported by the driver or the operating system.
    Resource,
    /// Verbs poll failure, socket read/write failure, or unexpected EOF.
    Io,
    /// A malformed handshake frame: wrong discriminant, wrong `"DONE"`
    /// bytes, or a length field that exceeds the remaining stream.
    Protocol,
    /// An identifier field does not fit in its configured bit width.
    Overflow,
    /// A lookup by name missed.
    NotFound,
    /// The handshake client saw `"NK"`, or any response other than `"OK"`.
    Handshake,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config error",
            ErrorKind::Resource => "resource error",
            ErrorKind::Io => "io error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Overflow => "overflow error",
            ErrorKind::NotFound => "not found",
            ErrorKind::Handshake => "handshake error",
        };
        write!(f, "{}", s)
    }
}

/// The crate-wide error type. Setup-phase errors (registration, bind,
/// directory set) are meant to be fatal to the caller; data-path errors
/// (poll failure, write failure) are meant to close the affected connection
/// without tearing down the rest of the process.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    reason: String,
}

impl Error {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Error {
            kind,
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, reason)
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, reason)
    }

    pub fn io(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, reason)
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, reason)
    }

    pub fn overflow(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overflow, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason)
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handshake, reason)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::io(e.to_string())
    }
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
