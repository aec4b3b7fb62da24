//! Error representations for every layer of the protocol stack.

use std::{error, fmt, io};

/// Frame-level failures: the byte stream no longer carries a well-formed
/// message and the connection cannot be trusted afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes than the fixed 7-byte header
    HeaderTooShort,
    /// Declared size below the header size, or body bytes left over/missing
    Malformed,
    /// Declared size above the negotiated ceiling
    FrameTooLarge { size: u32, limit: u32 },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FramingError::HeaderTooShort => write!(f, "message header too short"),
            FramingError::Malformed => write!(f, "malformed message frame"),
            FramingError::FrameTooLarge { size, limit } => {
                write!(f, "frame of {} bytes exceeds negotiated limit of {}", size, limit)
            }
        }
    }
}

/// Violations of the request/response discipline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The type byte does not name any known message
    UnknownMessageType(u8),
    /// A reply arrived whose type is not legal for the outstanding request
    ProtocolMismatch,
    /// The server could not agree on any protocol version
    VersionMismatch(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ProtocolError::UnknownMessageType(t) => write!(f, "unknown message type {}", t),
            ProtocolError::ProtocolMismatch => write!(f, "unexpected response type for tag"),
            ProtocolError::VersionMismatch(ref v) => {
                write!(f, "protocol version not supported: {}", v)
            }
        }
    }
}

/// Per-connection bookkeeping failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// Every transaction slot is occupied by an outstanding request
    TagsExhausted,
    /// The fid pool has no free entries
    FidsExhausted,
    /// The fid is not bound on this connection
    NoSuchFid(u32),
    /// The fid is already bound
    FidInUse(u32),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SessionError::TagsExhausted => write!(f, "no free transaction slots"),
            SessionError::FidsExhausted => write!(f, "no free fids"),
            SessionError::NoSuchFid(fid) => write!(f, "unknown fid {}", fid),
            SessionError::FidInUse(fid) => write!(f, "fid {} already in use", fid),
        }
    }
}

/// Failures raised by nodes of the served namespace.
///
/// These are reported to the peer as `RError` and never terminate a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NamespaceError {
    /// A path element did not resolve; `walked` counts the elements that
    /// did before the failing one
    NotFound { walked: usize },
    NotADirectory,
    NotWalkable,
    NotAllowed,
    AlreadyExists,
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            NamespaceError::NotFound { .. } => write!(f, "not found"),
            NamespaceError::NotADirectory => write!(f, "not a directory"),
            NamespaceError::NotWalkable => write!(f, "fid is not a directory"),
            NamespaceError::NotAllowed => write!(f, "operation not allowed"),
            NamespaceError::AlreadyExists => write!(f, "already exists"),
        }
    }
}

/// The error type for every operation in this crate.
#[derive(Debug)]
pub enum Error {
    /// The underlying byte stream failed
    Transport(io::Error),
    /// The byte stream does not frame correctly
    Framing(FramingError),
    /// A well-framed message broke the protocol rules
    Protocol(ProtocolError),
    /// Tag/fid bookkeeping failed
    Session(SessionError),
    /// A namespace node rejected the operation
    Namespace(NamespaceError),
    /// The peer rejected authentication
    Auth(String),
    /// The peer answered with `RError`
    Remote(String),
    /// The request was flushed or the session was torn down
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Transport(ref e) => write!(f, "transport error: {}", e),
            Error::Framing(ref e) => e.fmt(f),
            Error::Protocol(ref e) => e.fmt(f),
            Error::Session(ref e) => e.fmt(f),
            Error::Namespace(ref e) => e.fmt(f),
            Error::Auth(ref msg) => write!(f, "authentication rejected: {}", msg),
            Error::Remote(ref ename) => write!(f, "{}", ename),
            Error::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Transport(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Session(e)
    }
}

impl From<NamespaceError> for Error {
    fn from(e: NamespaceError) -> Self {
        Error::Namespace(e)
    }
}
