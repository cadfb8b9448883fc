// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Kinded errors.
//!
//! Every recoverable failure in the crate tree is an [`Error`]: an
//! [`ErrorKind`] plus a message plus an optional wrapped cause. The kind is
//! what the HTTP layer maps to a status code and what callers match on;
//! everything else is for humans.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[error("Cancelled")] Cancelled,
    #[error("Unknown")] Unknown,
    #[error("Invalid argument")] InvalidArgument,
    #[error("Deadline exceeded")] DeadlineExceeded,
    #[error("Not found")] NotFound,
    #[error("Already exists")] AlreadyExists,
    #[error("Permission denied")] PermissionDenied,
    #[error("Unauthenticated")] Unauthenticated,
    #[error("Resource exhausted")] ResourceExhausted,
    #[error("Failed precondition")] FailedPrecondition,
    #[error("Aborted")] Aborted,
    #[error("Out of range")] OutOfRange,
    #[error("Unimplemented")] Unimplemented,
    #[error("Internal")] Internal,
    #[error("Unavailable")] Unavailable,
    #[error("Data loss")] DataLoss,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Error {
            kind,
            msg: Some(msg),
            source: None,
        }
    }

    pub fn wrap<E: Into<Box<dyn std::error::Error + Send + Sync>>>(kind: ErrorKind, e: E) -> Self {
        Error {
            kind,
            msg: None,
            source: Some(e.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn map<F: FnOnce(ErrorKind) -> ErrorKind>(mut self, f: F) -> Self {
        self.kind = f(self.kind);
        self
    }

    /// Returns a `Display` adapter which includes the whole source chain,
    /// `outer: inner: innermost` style, for log lines.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cur: Option<&(dyn std::error::Error + 'static)> =
            self.0.source.as_deref().map(|e| e as _);
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => match &self.source {
                Some(source) => write!(f, "{}: {}", self.kind, source),
                None => fmt::Display::fmt(&self.kind, f),
            },
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.msg {
            // With a message of its own, the source is an additional cause.
            Some(_) => self.source.as_deref().map(|e| e as _),
            // Without one, the source was already folded into `Display`.
            None => self.source.as_deref().and_then(|e| e.source()),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }
}

impl From<crate::shutdown::ShutdownError> for Error {
    fn from(e: crate::shutdown::ShutdownError) -> Self {
        Error::wrap(ErrorKind::Cancelled, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    ///
    /// Example:
    /// ```
    /// use sightline_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`], like `format!` with a leading [`ErrorKind`].
///
/// Example:
/// ```
/// use sightline_base::err;
/// let e = err!(NotFound, "no such camera {}", "back");
/// assert_eq!(e.kind(), sightline_base::ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no such camera back");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::from($crate::ErrorKind::$kind)
    };
    ($kind:ident, $fmt:expr) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($fmt))
    };
    ($kind:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($fmt, $($arg)+))
    };
}

/// Returns an [`Error`] from the enclosing function, like `err!` + `return`.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_and_without_msg() {
        let e = err!(Unavailable, "camera {} is gone", "main");
        assert_eq!(e.to_string(), "Unavailable: camera main is gone");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = Error::wrap(ErrorKind::Internal, io);
        assert_eq!(e.to_string(), "Internal: disk on fire");
    }

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "inner");
        let mut e = Error::wrap(ErrorKind::Internal, io);
        e.msg = Some("outer".to_owned());
        assert_eq!(e.chain().to_string(), "Internal: outer: inner");
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            bail!(InvalidArgument, "bad {}", 42);
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}
