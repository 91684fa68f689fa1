use std::fmt;

/// Errors surfaced by the storage engines.
///
/// `NOTFOUND` is deliberately absent here — a missing key or sequence is
/// represented as `Option::None` / an empty map in return values, never as
/// an `Err`.
#[derive(Debug)]
pub enum Error {
    /// `seq < 1`, a non-positive segment size, or a partition/tag name that
    /// violates the naming rules (empty, containing `.` or whitespace).
    BadArgument(String),
    /// A malformed line, a segment missing its leading snapshot, or a
    /// segment whose records don't agree with its index.
    Corrupt(String),
    /// `reload` computed a maximum on-disk sequence that disagrees with an
    /// already non-zero in-memory counter.
    Inconsistent { expected: u64, found: u64 },
    /// Underlying filesystem failure.
    Io(std::io::Error),
    /// A snapshot or delta line failed to parse as JSON.
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadArgument(msg) => write!(f, "bad argument: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Inconsistent { expected, found } => write!(
                f,
                "inconsistent state: in-memory sequence {expected} disagrees with on-disk maximum {found}"
            ),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Json(err) => write!(f, "json error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
