//! Error related business logic of `chirp`.
//!
//! Contains the `ErrorKind` enum (discriminants kept bit-compatible with
//! the original `libchirp/error.h`, so log scrapers and cross-language
//! peers that key off the numeric code keep working), plus extensions of
//! the standard library's `Result` type to work with our own `Error`.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `chirp::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait drops the underlying
/// error value, which is useful when it doesn't implement `Send`, or
/// when the caller has no use for the original error's `Display` output.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "Error::Simple({:?})", k),
            ErrorInner::Wrapped(k, e) => write!(f, "Error::Wrapped({:?}, {:?})", k, e),
        }
    }
}

impl Error {
    /// Returns an error not wrapping another error implementation,
    /// with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { inner: ErrorInner::Simple(kind) }
    }

    /// Wraps an arbitrary error in an `Error`, with kind `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error { inner: ErrorInner::Wrapped(kind, e.into()) }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`, keeping any wrapped cause.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::UvError, e)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.inner {
            ErrorInner::Simple(_) => None,
            ErrorInner::Wrapped(_, e) => Some(e.as_ref()),
        }
    }
}

/// Status/error kind reported to send callbacks, release callbacks, and
/// the `log_cb` hook. Discriminants are kept numerically identical to
/// the original C library's `ch_error_t`, for interoperability with
/// existing log scrapers and cross-language peers keying off the code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// No error.
    Success = 0,
    /// Supplied value is not allowed.
    ValueError = 1,
    /// General event-loop/OS error (a `tokio`/`std::io::Error`, where the
    /// original used a libuv error).
    UvError = 2,
    /// Bad values were received, or the remote died unexpectedly.
    ProtocolError = 3,
    /// The chirp port is already in use.
    EAddrInUse = 4,
    /// Should not happen in normal operation: no entropy source, closing
    /// an already-closed chirp, can't get the remote's address, can't
    /// accept a connection, can't set a socket option.
    Fatal = 5,
    /// General TLS error.
    TlsError = 6,
    /// Chirp (or another object) is not initialized.
    Uninit = 7,
    /// Action is already in progress.
    InProgress = 8,
    /// A timeout happened during an action.
    Timeout = 9,
    /// Allocation failure.
    ENoMem = 10,
    /// The error occurred because chirp is shutting down.
    Shutdown = 11,
    /// The remote refused the connection, or the connect attempt timed out.
    CannotConnect = 12,
    /// The message has been placed in the send queue.
    Queued = 13,
    /// The message is already in use; it will not be sent.
    Used = 14,
    /// The message has not been sent completely.
    More = 15,
    /// The writer is busy, or still waiting for an ack; no message was
    /// processed.
    Busy = 16,
    /// Queues are empty; no message was sent.
    Empty = 17,
    /// Error while writing to the socket.
    WriteError = 18,
    /// Initializing some resource failed.
    InitFail = 19,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_match_libchirp_error_h() {
        assert_eq!(ErrorKind::Success as u8, 0);
        assert_eq!(ErrorKind::ValueError as u8, 1);
        assert_eq!(ErrorKind::UvError as u8, 2);
        assert_eq!(ErrorKind::ProtocolError as u8, 3);
        assert_eq!(ErrorKind::EAddrInUse as u8, 4);
        assert_eq!(ErrorKind::Fatal as u8, 5);
        assert_eq!(ErrorKind::TlsError as u8, 6);
        assert_eq!(ErrorKind::Uninit as u8, 7);
        assert_eq!(ErrorKind::InProgress as u8, 8);
        assert_eq!(ErrorKind::Timeout as u8, 9);
        assert_eq!(ErrorKind::ENoMem as u8, 10);
        assert_eq!(ErrorKind::Shutdown as u8, 11);
        assert_eq!(ErrorKind::CannotConnect as u8, 12);
        assert_eq!(ErrorKind::Queued as u8, 13);
        assert_eq!(ErrorKind::Used as u8, 14);
        assert_eq!(ErrorKind::More as u8, 15);
        assert_eq!(ErrorKind::Busy as u8, 16);
        assert_eq!(ErrorKind::Empty as u8, 17);
        assert_eq!(ErrorKind::WriteError as u8, 18);
        assert_eq!(ErrorKind::InitFail as u8, 19);
    }

    #[test]
    fn wrapped_preserves_kind_and_message() {
        let e: Result<()> = Err(io::Error::new(io::ErrorKind::Other, "boom"))
            .wrapped(ErrorKind::WriteError);
        let e = e.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::WriteError);
        assert!(e.to_string().contains("boom"));
    }

    #[test]
    fn swap_kind_keeps_source() {
        let e = Error::wrapped(ErrorKind::UvError, "x");
        let e = e.swap_kind(ErrorKind::CannotConnect);
        assert_eq!(e.kind(), ErrorKind::CannotConnect);
        assert!(e.to_string().contains('x'));
    }
}
