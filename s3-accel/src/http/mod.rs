//! Single-request executor.
//!
//! One call performs one HTTP(S) exchange: resolve the hostname through the
//! record cache, open TCP (and TLS), handshake HTTP/1.1, transmit the
//! request, and collect the response body into one contiguous buffer. Each
//! stage is raced against its own deadline from the [`TimeoutProfile`], the
//! whole call against the `request` deadline, and everything against the
//! caller's cancellation token.

mod pool;

pub use pool::{ConnectionPool, PoolConfig};
pub(crate) use pool::Sender;

use crate::error::{Error, TimeoutKind};
use crate::resolver::{self, AddressFamily};
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request is sent: scheme, hostname (or IP literal) and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Endpoint {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Endpoint {
    pub(crate) fn https(host: impl Into<String>) -> Self {
        Self { scheme: Scheme::Https, host: host.into(), port: 443 }
    }

    pub(crate) fn http(host: impl Into<String>, port: u16) -> Self {
        Self { scheme: Scheme::Http, host: host.into(), port }
    }

    /// Parse a caller-supplied endpoint override: `host`, `host:port`, or a
    /// full `http(s)://host[:port]` URL without a path.
    pub(crate) fn parse(value: &str) -> Result<Self, Error> {
        let (scheme, rest) = if let Some(rest) = value.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = value.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            (Scheme::Https, value)
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() || rest.contains('/') {
            return Err(Error::Config(format!(
                "endpoint {value:?} must be host, host:port, or scheme://host[:port]"
            )));
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Config(format!("endpoint {value:?} has an invalid port"))
                })?;
                (host.to_string(), port)
            }
            _ => (rest.to_string(), scheme.default_port()),
        };
        Ok(Self { scheme, host, port })
    }

    /// Value of the `Host` header: the port is included only when it is not
    /// the scheme default.
    pub(crate) fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Five independent per-request deadlines plus the whole-request one.
/// `None` disables a deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutProfile {
    pub(crate) resolve: Option<Duration>,
    pub(crate) connection: Option<Duration>,
    pub(crate) write: Option<Duration>,
    pub(crate) read: Option<Duration>,
    pub(crate) data: Option<Duration>,
    pub(crate) request: Option<Duration>,
}

impl TimeoutProfile {
    /// The instance-metadata profile: 3 s to connect, 3 s overall, nothing
    /// else armed.
    pub(crate) fn imds() -> Self {
        Self {
            resolve: None,
            connection: Some(Duration::from_secs(3)),
            write: None,
            read: None,
            data: None,
            request: Some(Duration::from_secs(3)),
        }
    }
}

impl Default for TimeoutProfile {
    fn default() -> Self {
        Self {
            resolve: Some(Duration::from_secs(3)),
            connection: Some(Duration::from_secs(3)),
            write: Some(Duration::from_secs(300)),
            read: Some(Duration::from_secs(300)),
            data: Some(Duration::from_secs(3)),
            request: Some(Duration::from_secs(300)),
        }
    }
}

/// `0` disables a timeout in the public options; map it accordingly.
pub(crate) fn timeout_from_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

pub(crate) struct HttpRequest {
    pub(crate) method: Method,
    pub(crate) endpoint: Endpoint,
    pub(crate) path_and_query: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

#[derive(Debug)]
pub(crate) struct HttpResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl HttpResponse {
    pub(crate) fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// TCP or TLS-over-TCP; both are `Unpin`, so delegation is direct.
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

static TLS_CONNECTOR: LazyLock<TlsConnector> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
});

async fn maybe_sleep(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Race one stage of the request against its own limit, the whole-request
/// deadline, and cancellation. Exactly one outcome wins; losers are dropped,
/// which also cancels any resolve or connect they had in flight.
async fn stage<T, F>(
    fut: F,
    kind: TimeoutKind,
    limit: Option<Duration>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled()),
        _ = maybe_sleep_until(deadline) => Err(Error::Timeout(TimeoutKind::Request)),
        _ = maybe_sleep(limit) => Err(Error::Timeout(kind)),
        result = fut => result,
    }
}

async fn dial(
    endpoint: &Endpoint,
    timeouts: &TimeoutProfile,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<Sender, Error> {
    let addr: IpAddr = match endpoint.host.parse() {
        Ok(ip) => ip,
        Err(_) => {
            stage(
                resolver::resolve(&endpoint.host, AddressFamily::V4),
                TimeoutKind::Resolve,
                timeouts.resolve,
                deadline,
                cancel,
            )
            .await?
        }
    };

    let scheme = endpoint.scheme;
    let host = endpoint.host.clone();
    let port = endpoint.port;
    let connect = async move {
        let tcp = TcpStream::connect((addr, port)).await.map_err(|e| Error::from_io(&e))?;
        let _ = tcp.set_nodelay(true);
        let transport = match scheme {
            Scheme::Http => Transport::Plain(tcp),
            Scheme::Https => {
                let name = ServerName::try_from(host.clone())
                    .map_err(|_| Error::Config(format!("invalid TLS server name {host:?}")))?;
                let tls = TLS_CONNECTOR
                    .connect(name, tcp)
                    .await
                    .map_err(|e| Error::from_io(&e))?;
                Transport::Tls(Box::new(tls))
            }
        };
        let (sender, conn) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(transport))
            .await
            .map_err(|e| Error::from_hyper(&e))?;
        tokio::spawn(async move {
            // Drives the connection until close; errors surface on the
            // sender side.
            let _ = conn.await;
        });
        Ok(sender)
    };
    let sender =
        stage(connect, TimeoutKind::Connection, timeouts.connection, deadline, cancel).await?;
    trace!(host = %endpoint.host, %addr, port, "connection established");
    Ok(sender)
}

fn build_request(req: &HttpRequest) -> Result<Request<Full<Bytes>>, Error> {
    let uri = if req.path_and_query.is_empty() { "/" } else { req.path_and_query.as_str() };
    let mut request = Request::builder()
        .method(req.method.clone())
        .uri(uri)
        .body(Full::new(req.body.clone()))
        .map_err(|e| Error::Config(format!("invalid request: {e}")))?;
    let headers = request.headers_mut();
    headers.insert(
        HOST,
        HeaderValue::from_str(&req.endpoint.host_header())
            .map_err(|_| Error::Config(format!("invalid host {:?}", req.endpoint.host)))?,
    );
    headers.extend(req.headers.iter().map(|(name, value)| (name.clone(), value.clone())));
    Ok(request)
}

/// Perform one request and read the whole body.
///
/// Exactly one of `Ok`/`Err` comes back. On success the keep-alive sender
/// returns to the pool; on any failure it is dropped, since the connection
/// state is unknown.
pub(crate) async fn execute(
    req: &HttpRequest,
    timeouts: &TimeoutProfile,
    pool: &ConnectionPool,
    cancel: &CancellationToken,
) -> Result<HttpResponse, Error> {
    let deadline = timeouts.request.map(|d| Instant::now() + d);

    let mut pooled = true;
    let mut sender = match pool.checkout(&req.endpoint) {
        Some(sender) => sender,
        None => {
            pooled = false;
            dial(&req.endpoint, timeouts, deadline, cancel).await?
        }
    };

    let response = loop {
        let request = build_request(req)?;
        let send = async {
            sender.ready().await.map_err(|e| Error::from_hyper(&e))?;
            sender.send_request(request).await.map_err(|e| Error::from_hyper(&e))
        };
        let outcome = stage(send, TimeoutKind::Write, timeouts.write, deadline, cancel).await;
        match outcome {
            Ok(response) => break response,
            // A parked keep-alive connection may have died while idle; dial
            // a fresh one and resend once.
            Err(err @ Error::Network { .. }) if pooled => {
                debug!(%err, "pooled connection was stale, redialing");
                pooled = false;
                sender = dial(&req.endpoint, timeouts, deadline, cancel).await?;
            }
            Err(err) => return Err(err),
        }
    };

    let (parts, mut body) = response.into_parts();
    let content_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());
    let mut collected = match content_length {
        Some(length) => BytesMut::with_capacity(length),
        None => BytesMut::new(),
    };

    let read_deadline = timeouts.read.map(|d| Instant::now() + d);
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            _ = maybe_sleep_until(deadline) => return Err(Error::Timeout(TimeoutKind::Request)),
            _ = maybe_sleep_until(read_deadline) => return Err(Error::Timeout(TimeoutKind::Read)),
            _ = maybe_sleep(timeouts.data) => return Err(Error::Timeout(TimeoutKind::Data)),
            frame = body.frame() => frame,
        };
        match frame {
            None => break,
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    collected.extend_from_slice(&data);
                }
            }
            Some(Err(e)) => return Err(Error::from_hyper(&e)),
        }
    }

    pool.checkin(&req.endpoint, sender);
    trace!(status = parts.status.as_u16(), bytes = collected.len(), "response collected");
    Ok(HttpResponse { status: parts.status, headers: parts.headers, body: collected.freeze() })
}
