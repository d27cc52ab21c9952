//! Error types for the crate

use std::{fmt, io};

use hickory_proto::{op::ResponseCode, ProtoError};
use thiserror::Error;

/// The error kind for errors that get returned in the crate
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An error with an arbitrary message, referenced as &'static str
    #[error("{0}")]
    Message(&'static str),

    /// An error with an arbitrary message, stored as String
    #[error("{0}")]
    Msg(String),

    /// A configuration file could not be loaded or was invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// A trust anchor string or file could not be parsed
    #[error("trust anchor parse error: {0}")]
    Anchor(String),

    /// An error got returned from IO
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An error got returned by the hickory-proto crate
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),

    /// A request timed out
    #[error("request timed out")]
    Timeout,

    /// The upstream server refused or could not serve the zone
    #[error("upstream server is lame for the zone")]
    Lame,

    /// A query exceeded its work budget and was terminated
    #[error("query exceeded its {0} budget")]
    BudgetExceeded(&'static str),

    /// The query was denied by local policy
    #[error("query denied by policy")]
    Refused,
}

/// The error type for errors that get returned in the crate
#[derive(Debug, Error)]
#[non_exhaustive]
pub struct Error {
    /// Kind of error that occurred
    pub kind: Box<ErrorKind>,
}

impl Error {
    /// Get the kind of the error
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns true if the failure is one a retry against another target may fix
    pub fn is_transient(&self) -> bool {
        matches!(*self.kind, ErrorKind::Timeout | ErrorKind::Lame)
    }

    /// The DNS RCODE a terminal failure maps to
    pub fn as_response_code(&self) -> ResponseCode {
        match *self.kind {
            ErrorKind::Refused => ResponseCode::Refused,
            _ => ResponseCode::ServFail,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(error: E) -> Self {
        Self {
            kind: Box::new(error.into()),
        }
    }
}

impl From<&'static str> for Error {
    fn from(msg: &'static str) -> Self {
        ErrorKind::Message(msg).into()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        ErrorKind::Msg(msg).into()
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match *e.kind() {
            ErrorKind::Timeout => Self::new(io::ErrorKind::TimedOut, e),
            _ => Self::other(e),
        }
    }
}

/// A result type with the crate error
pub type Result<T> = std::result::Result<T, Error>;
