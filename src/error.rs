//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use http::StatusCode;

/// Result type often returned from methods that can have hearth `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// A malformed byte was seen while parsing a preamble, chunk framing, or
    /// multipart framing.
    Parse(Parse),
    /// The request target grew past the preamble budget.
    UriTooLong { limit: usize },
    /// The preamble grew past the configured budget.
    RequestTooLarge { limit: usize },
    /// The request body grew past the configured limit.
    ContentTooLarge { limit: u64 },
    /// Draining an unread request body passed the configured cap.
    TooManyBytesToDrain { drained: u64, limit: u64 },
    /// A `Transfer-Encoding` other than `chunked`.
    UnsupportedTransferEncoding(String),
    /// A character encoding the server cannot decode.
    UnsupportedEncoding(String),
    /// A media type the server cannot process.
    UnsupportedMedia,
    /// A request claims a body but carries no framing for it.
    LengthRequired,
    /// A blocking operation ran out of time.
    Timeout(Phase),
    /// A client transferred bytes below the configured minimum rate.
    SlowClient { direction: Direction, rate: u64 },
    /// A TLS handshake or record-layer failure.
    Tls,
    /// An `io::Error` from a socket read or write.
    Io,
    /// The connection closed in the middle of a message.
    IncompleteMessage,
    /// The user handler failed.
    Handler { status: Option<StatusCode> },
    /// A response was mutated after its preamble was written.
    IllegalState(&'static str),
    /// Error binding a listener socket.
    Listen,
    /// Error accepting a connection.
    Accept,
}

/// Where a parse failure happened, down to the offending byte and the state
/// the machine was in when it saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Parse {
    pub(crate) section: Section,
    pub(crate) byte: Option<u8>,
    pub(crate) state: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Section {
    Preamble,
    Chunk,
    Multipart,
}

/// The blocking operation a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    InitialRead,
    KeepAlive,
    #[allow(unused)]
    Preamble,
    RequestBody,
    #[allow(unused)]
    ResponseWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_parse(section: Section, byte: u8, state: &'static str) -> Error {
        Error::new(Kind::Parse(Parse {
            section,
            byte: Some(byte),
            state,
        }))
    }

    pub(crate) fn new_incomplete_parse(section: Section, state: &'static str) -> Error {
        Error::new(Kind::Parse(Parse {
            section,
            byte: None,
            state,
        }))
    }

    pub(crate) fn new_uri_too_long(limit: usize) -> Error {
        Error::new(Kind::UriTooLong { limit })
    }

    pub(crate) fn new_request_too_large(limit: usize) -> Error {
        Error::new(Kind::RequestTooLarge { limit })
    }

    pub(crate) fn new_content_too_large(limit: u64) -> Error {
        Error::new(Kind::ContentTooLarge { limit })
    }

    pub(crate) fn new_too_many_bytes_to_drain(drained: u64, limit: u64) -> Error {
        Error::new(Kind::TooManyBytesToDrain { drained, limit })
    }

    pub(crate) fn new_unsupported_transfer_encoding(name: &str) -> Error {
        Error::new(Kind::UnsupportedTransferEncoding(name.to_owned()))
    }

    pub(crate) fn new_unsupported_encoding(name: &str) -> Error {
        Error::new(Kind::UnsupportedEncoding(name.to_owned()))
    }

    pub(crate) fn new_unsupported_media() -> Error {
        Error::new(Kind::UnsupportedMedia)
    }

    pub(crate) fn new_length_required() -> Error {
        Error::new(Kind::LengthRequired)
    }

    pub(crate) fn new_timeout(phase: Phase) -> Error {
        Error::new(Kind::Timeout(phase))
    }

    pub(crate) fn new_slow_client(direction: Direction, rate: u64) -> Error {
        Error::new(Kind::SlowClient { direction, rate })
    }

    pub(crate) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_handler(status: Option<StatusCode>, message: Option<String>) -> Error {
        let err = Error::new(Kind::Handler { status });
        match message {
            Some(msg) => err.with(msg),
            None => err,
        }
    }

    pub(crate) fn new_illegal_state(what: &'static str) -> Error {
        Error::new(Kind::IllegalState(what))
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept(cause: io::Error) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    /// Recovers a structured `Error` smuggled through an `io::Error`, or wraps
    /// a plain one as `Kind::Io`.
    pub(crate) fn from_io(err: io::Error) -> Error {
        if err
            .get_ref()
            .map(|inner| inner.is::<Error>())
            .unwrap_or(false)
        {
            let inner = err.into_inner().expect("get_ref was Some");
            return *inner.downcast::<Error>().expect("is::<Error> was true");
        }
        Error::new_io(err)
    }

    /// Buries this error inside an `io::Error` so it can travel through
    /// `Read`/`Write` pipelines without losing its kind.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self.inner.kind {
            Kind::Timeout(_) => io::ErrorKind::TimedOut,
            Kind::Parse(_) => io::ErrorKind::InvalidData,
            Kind::IncompleteMessage => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// The status an error response should carry, if this error kind warrants
    /// one at all.
    pub(crate) fn status_hint(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            Kind::UriTooLong { .. } => Some(StatusCode::URI_TOO_LONG),
            Kind::RequestTooLarge { .. } => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Kind::ContentTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Kind::UnsupportedTransferEncoding(_) => Some(StatusCode::NOT_IMPLEMENTED),
            Kind::UnsupportedEncoding(_) | Kind::UnsupportedMedia => {
                Some(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            }
            Kind::LengthRequired => Some(StatusCode::LENGTH_REQUIRED),
            Kind::Handler { status } => Some(status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)),
            _ => None,
        }
    }

    /// Whether the underlying cause is a socket timeout, which blocking
    /// sockets report as `WouldBlock` or `TimedOut`.
    pub(crate) fn would_block(&self) -> bool {
        self.inner
            .cause
            .as_ref()
            .and_then(|cause| cause.downcast_ref::<io::Error>())
            .map(|io_err| {
                matches!(
                    io_err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                )
            })
            .unwrap_or(false)
    }

    /// Returns true if this was a parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns true if a client was dropped for transferring too slowly.
    pub fn is_slow_client(&self) -> bool {
        matches!(self.inner.kind, Kind::SlowClient { .. })
    }

    /// Returns true if this error came from the TLS layer.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if this error wraps a socket `io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the connection closed mid-message.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the user handler failed.
    pub fn is_handler(&self) -> bool {
        matches!(self.inner.kind, Kind::Handler { .. })
    }

    /// Returns true if a declared limit was exceeded.
    pub fn is_over_limit(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::UriTooLong { .. }
                | Kind::RequestTooLarge { .. }
                | Kind::ContentTooLarge { .. }
                | Kind::TooManyBytesToDrain { .. }
        )
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Cause> {
        self.inner.cause
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        Description(self)
    }

    fn description(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Parse(Parse {
                section,
                byte: Some(byte),
                state,
            }) => write!(
                f,
                "invalid {} byte {:#04x} in state {}",
                section.name(),
                byte,
                state
            ),
            Kind::Parse(Parse {
                section,
                byte: None,
                state,
            }) => write!(f, "{} ran out of data in state {}", section.name(), state),
            Kind::UriTooLong { limit } => write!(f, "request target longer than {} bytes", limit),
            Kind::RequestTooLarge { limit } => {
                write!(f, "request preamble larger than {} bytes", limit)
            }
            Kind::ContentTooLarge { limit } => {
                write!(f, "request content larger than {} bytes", limit)
            }
            Kind::TooManyBytesToDrain { drained, limit } => write!(
                f,
                "drained {} bytes of unread body, over the {} byte cap",
                drained, limit
            ),
            Kind::UnsupportedTransferEncoding(ref name) => {
                write!(f, "unsupported transfer encoding {:?}", name)
            }
            Kind::UnsupportedEncoding(ref name) => {
                write!(f, "unsupported character encoding {:?}", name)
            }
            Kind::UnsupportedMedia => f.write_str("unsupported media type"),
            Kind::LengthRequired => f.write_str("request body without framing"),
            Kind::Timeout(phase) => write!(f, "timed out during {}", phase.name()),
            Kind::SlowClient { direction, rate } => write!(
                f,
                "client {} rate of {} bytes/sec below the configured minimum",
                match direction {
                    Direction::Read => "upload",
                    Direction::Write => "download",
                },
                rate
            ),
            Kind::Tls => f.write_str("TLS failure"),
            Kind::Io => f.write_str("connection error"),
            Kind::IncompleteMessage => f.write_str("connection closed before message completed"),
            Kind::Handler { .. } => f.write_str("handler failed"),
            Kind::IllegalState(what) => write!(f, "{} after response was committed", what),
            Kind::Listen => f.write_str("error binding listener"),
            Kind::Accept => f.write_str("error accepting connection"),
        }
    }
}

impl Section {
    fn name(&self) -> &'static str {
        match self {
            Section::Preamble => "preamble",
            Section::Chunk => "chunk framing",
            Section::Multipart => "multipart framing",
        }
    }
}

impl Phase {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Phase::InitialRead => "initial read",
            Phase::KeepAlive => "keep-alive wait",
            Phase::Preamble => "preamble read",
            Phase::RequestBody => "request body read",
            Phase::ResponseWrite => "response write",
        }
    }
}

struct Description<'a>(&'a Error);

impl fmt::Display for Description<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.description(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hearth::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description(f)?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn io_round_trip_preserves_kind() {
        let err = Error::new_content_too_large(1024);
        let io_err = err.into_io();
        let back = Error::from_io(io_err);
        assert!(matches!(back.kind(), Kind::ContentTooLarge { limit: 1024 }));
    }

    #[test]
    fn plain_io_becomes_io_kind() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(Error::from_io(io_err).is_io());
    }

    #[test]
    fn status_hints() {
        assert_eq!(
            Error::new_request_too_large(128).status_hint(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
        assert_eq!(
            Error::new_unsupported_transfer_encoding("gzip").status_hint(),
            Some(StatusCode::NOT_IMPLEMENTED)
        );
        assert_eq!(Error::new_timeout(Phase::InitialRead).status_hint(), None);
    }
}
