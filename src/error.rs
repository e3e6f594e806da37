use std::fmt;
use std::io;
use std::net::AddrParseError;
use std::num::ParseIntError;

/// `Error` boxes its kind to keep `Result<T>` small on the hot path (every
/// transaction step returns one of these).
#[derive(Debug)]
pub struct Error {
    kind: Box<ErrorKind>,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// The request buffer hit `MAX_MSG` without a headers terminator, or the
    /// terminator arrived but no `X-Unique-ID:` header was present.
    ParseFailure,
    /// A verdict connection sent bytes that didn't parse as a decimal id.
    VerdictMalformed,
    Io(io::Error),
    AddrParse(AddrParseError),
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind: Box::new(kind) }
    }

    pub fn parse_failure() -> Self {
        Error::new(ErrorKind::ParseFailure)
    }

    pub fn verdict_malformed() -> Self {
        Error::new(ErrorKind::VerdictMalformed)
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::new(ErrorKind::Config(msg.into()))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind {
            ErrorKind::ParseFailure => write!(f, "failed to parse request (no id header or buffer overflow)"),
            ErrorKind::VerdictMalformed => write!(f, "malformed verdict message"),
            ErrorKind::Io(e) => write!(f, "io error: {}", e),
            ErrorKind::AddrParse(e) => write!(f, "invalid address: {}", e),
            ErrorKind::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::new(ErrorKind::AddrParse(e))
    }
}

impl From<ParseIntError> for Error {
    fn from(_: ParseIntError) -> Self {
        Error::parse_failure()
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::config(e.to_string())
    }
}
