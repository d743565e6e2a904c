use std::fmt;
use std::io;
use std::time::Duration;

/// Error raised by user handler code.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A usage or framing problem such as reading a closed body, or an
    /// invalid `content-length` header.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// Bad or missing configuration.
    Config(String),
    /// The `fn-deadline` header could not be understood.
    Deadline(String),
    /// The handler did not finish inside its execution window.
    Timeout(Duration),
    /// The user handler failed.
    Handler(HandlerError),
}

impl Error {
    /// Tells if this is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Tells if the peer closed the transport mid-frame.
    pub fn is_eof(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::Config(v) => write!(f, "config: {}", v),
            Error::Deadline(v) => write!(f, "deadline: {}", v),
            Error::Timeout(v) => write!(f, "function timed out after {}s", v.as_secs()),
            Error::Handler(v) => fmt::Display::fmt(v, f),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

impl From<HandlerError> for Error {
    fn from(e: HandlerError) -> Self {
        Error::Handler(e)
    }
}
