use bytes::Bytes;
use std::error::Error as _;
use std::fmt;
use thiserror::Error;

/// Which of the six request deadlines fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// DNS lookup for this request.
    Resolve,
    /// TCP connect plus TLS and HTTP handshakes.
    Connection,
    /// Request transmit up to response headers.
    Write,
    /// Response body, headers-received to end.
    Read,
    /// Gap between consecutive response-body frames.
    Data,
    /// Whole-request wall clock.
    Request,
}

impl TimeoutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutKind::Resolve => "resolve",
            TimeoutKind::Connection => "connection",
            TimeoutKind::Write => "write",
            TimeoutKind::Read => "read",
            TimeoutKind::Data => "data",
            TimeoutKind::Request => "request",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure classes, mirroring the OS error codes the
/// original socket layer reports. Classification drives retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkClass {
    ConnectionReset,
    NameNotFound,
    SocketTimeout,
    GenericTimeout,
    ConnectionRefused,
    HostUnreachable,
    BrokenPipe,
    TransientNameServerFailure,
    ResourceBusy,
    /// The resolver returned an empty answer for the hostname.
    NoRecords,
    /// Anything the transport reports that has no retriable mapping.
    Other,
}

impl NetworkClass {
    pub fn is_retriable(self) -> bool {
        !matches!(self, NetworkClass::Other)
    }

    pub(crate) fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::ConnectionReset => NetworkClass::ConnectionReset,
            ErrorKind::ConnectionRefused => NetworkClass::ConnectionRefused,
            ErrorKind::ConnectionAborted => NetworkClass::ConnectionReset,
            ErrorKind::BrokenPipe => NetworkClass::BrokenPipe,
            ErrorKind::TimedOut => NetworkClass::SocketTimeout,
            ErrorKind::HostUnreachable => NetworkClass::HostUnreachable,
            ErrorKind::NetworkUnreachable => NetworkClass::HostUnreachable,
            ErrorKind::ResourceBusy => NetworkClass::ResourceBusy,
            ErrorKind::UnexpectedEof => NetworkClass::ConnectionReset,
            _ => NetworkClass::Other,
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkClass::ConnectionReset => "connection reset",
            NetworkClass::NameNotFound => "name not found",
            NetworkClass::SocketTimeout => "socket timeout",
            NetworkClass::GenericTimeout => "timeout",
            NetworkClass::ConnectionRefused => "connection refused",
            NetworkClass::HostUnreachable => "host unreachable",
            NetworkClass::BrokenPipe => "broken pipe",
            NetworkClass::TransientNameServerFailure => "transient name server failure",
            NetworkClass::ResourceBusy => "resource busy",
            NetworkClass::NoRecords => "no address records",
            NetworkClass::Other => "network error",
        };
        f.write_str(s)
    }
}

/// Every failure the engine surfaces to a caller.
///
/// The enum is `Clone` so a single terminal error can reach both the sink's
/// error channel and a memoized probe result without re-running the request.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A parsed `<Error><Code>…</Code><Message>…</Message></Error>` body.
    /// `code` is preserved verbatim (`NoSuchKey`, `AccessDenied`, …) so
    /// callers can branch on it.
    #[error("S3 error {code} (http status {status_code}): {message}")]
    S3Protocol {
        code: String,
        message: String,
        status_code: u16,
        body: Bytes,
    },

    /// A non-2xx response whose body is not a recognizable S3 error
    /// document, or a 2xx response that violates the GetObject contract.
    #[error("unexpected response (http status {status_code})")]
    UnexpectedResponse {
        status_code: u16,
        content_type: Option<String>,
        body: Bytes,
    },

    /// XML arrived where an `<Error>` document was expected but did not
    /// match the shape.
    #[error("response XML does not match the S3 error document shape")]
    UnexpectedXml { body: Bytes },

    /// Transport failure, classified for retry.
    #[error("{class}: {detail}")]
    Network { class: NetworkClass, detail: String },

    /// One of the six request deadlines fired.
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// Caller-driven abort, carrying the caller-supplied cause or the
    /// default reason.
    #[error("{reason}")]
    Cancelled { reason: String },

    /// Invalid inputs detected when the download was created.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local file sink failure.
    #[error("file I/O: {detail}")]
    Io { detail: String },
}

impl Error {
    pub(crate) fn cancelled() -> Self {
        Error::Cancelled { reason: "aborted".to_string() }
    }

    pub(crate) fn network(class: NetworkClass, detail: impl fmt::Display) -> Self {
        Error::Network { class, detail: detail.to_string() }
    }

    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        Error::network(NetworkClass::from_io_kind(err.kind()), err)
    }

    /// Map a hyper error by walking its source chain down to the underlying
    /// `io::Error` when there is one. A connection that dies mid-message
    /// shows up as `IncompleteMessage` without an io source and is treated
    /// as a reset.
    pub(crate) fn from_hyper(err: &hyper::Error) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return Error::from_io(io);
            }
            source = cause.source();
        }
        if err.is_incomplete_message() || err.is_closed() {
            Error::network(NetworkClass::ConnectionReset, err)
        } else if err.is_timeout() {
            Error::network(NetworkClass::GenericTimeout, err)
        } else {
            Error::network(NetworkClass::Other, err)
        }
    }

    /// Retriable failures: the fixed network classes, every timeout kind,
    /// and nothing else. Retriable HTTP statuses are classified separately
    /// because a delivered response is not an `Error`.
    pub(crate) fn is_retriable(&self) -> bool {
        match self {
            Error::Network { class, .. } => class.is_retriable(),
            Error::Timeout(_) => true,
            _ => false,
        }
    }
}

/// HTTP statuses the retry wrapper re-attempts: 429 and the whole 5xx range.
pub(crate) fn is_retriable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}
