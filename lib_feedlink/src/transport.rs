//! # Transport
//!
//! Physical I/O for the feed session. Nothing here knows about items,
//! policies or failover; it opens byte streams and moves frames.
//!
//! ## Pieces
//! - **`Transport`**: `open(ChannelConfig) -> byte stream`. `TcpTransport` is
//!   the network implementation; tests plug in in-memory pipes.
//! - **`Authenticator`**: answers proxy challenges during an HTTP `CONNECT`
//!   tunnel. `BasicAuthenticator` covers the common case.
//! - **Link worker** (`spawn_link`): one task per live connection that frames
//!   the stream with a length-delimited codec, forwards inbound frames to the
//!   session's event queue and writes outbound frames handed to it.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::catalog::{ChannelConfig, ConnectionFlavor};
use crate::error::ConnectError;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedIo = Box<dyn AsyncStream>;

/// Opens raw byte streams to configured channels.
pub trait Transport: Send + Sync {
    fn open<'a>(&'a self, channel: &'a ChannelConfig) -> BoxFuture<'a, Result<BoxedIo, ConnectError>>;
}

// --- Proxy authentication ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Final `Proxy-Authorization` value; the proxy should accept it.
    Credentials(String),
    /// Intermediate token; the proxy is expected to answer with another 407.
    NeedsMoreRounds(String),
}

pub trait Authenticator: Send + Sync {
    /// Called with the raw 407 response (status line, headers and body).
    fn challenge(&self, server_response: &[u8]) -> Result<AuthStep, ConnectError>;
}

pub struct BasicAuthenticator {
    user: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(user: &str, password: &str) -> Self {
        Self { user: user.to_string(), password: password.to_string() }
    }
}

impl Authenticator for BasicAuthenticator {
    fn challenge(&self, server_response: &[u8]) -> Result<AuthStep, ConnectError> {
        let response = String::from_utf8_lossy(server_response);
        let offers_basic = response
            .lines()
            .filter(|l| l.to_ascii_lowercase().starts_with("proxy-authenticate:"))
            .any(|l| l.to_ascii_lowercase().contains("basic"));
        if !offers_basic {
            return Err(ConnectError::Proxy("proxy does not offer Basic authentication".to_string()));
        }
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.user, self.password));
        Ok(AuthStep::Credentials(format!("Basic {}", token)))
    }
}

impl fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthenticator").field("user", &self.user).finish_non_exhaustive()
    }
}

const MAX_AUTH_ROUNDS: usize = 4;
const MAX_RESPONSE_HEADER: usize = 16 * 1024;

/// Reads one HTTP response (headers plus any `Content-Length` body).
/// Returns the status code and the raw bytes.
async fn read_http_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u16, Vec<u8>), ConnectError> {
    let mut raw = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    // Byte at a time so nothing past the header block is consumed from the tunnel
    while !raw.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(ConnectError::Proxy("proxy closed the connection during CONNECT".to_string()));
        }
        raw.push(byte[0]);
        if raw.len() > MAX_RESPONSE_HEADER {
            return Err(ConnectError::Proxy("proxy response header too large".to_string()));
        }
    }

    let head = String::from_utf8_lossy(&raw).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ConnectError::Proxy(format!("malformed proxy status line: {}", head.lines().next().unwrap_or(""))))?;

    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        stream.read_exact(&mut body).await?;
        raw.extend_from_slice(&body);
    }

    Ok((status, raw))
}

/// Runs the `CONNECT` exchange on an already-open proxy connection.
pub async fn establish_tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target: &str,
    authenticator: Option<&dyn Authenticator>,
) -> Result<(), ConnectError> {
    let mut authorization: Option<String> = None;
    let mut sent_final = false;

    for round in 0..MAX_AUTH_ROUNDS {
        let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: Keep-Alive\r\n", target);
        if let Some(value) = &authorization {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", value));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let (status, response) = read_http_response(stream).await?;
        log::debug!("Proxy CONNECT {} round {} answered {}", target, round + 1, status);

        match status {
            200..=299 => return Ok(()),
            407 => {
                if sent_final {
                    return Err(ConnectError::Proxy("proxy rejected the supplied credentials".to_string()));
                }
                let auth = authenticator.ok_or_else(|| {
                    ConnectError::Proxy("proxy requires authentication but no authenticator is configured".to_string())
                })?;
                match auth.challenge(&response)? {
                    AuthStep::Credentials(value) => {
                        sent_final = true;
                        authorization = Some(value);
                    }
                    AuthStep::NeedsMoreRounds(value) => authorization = Some(value),
                }
            }
            other => return Err(ConnectError::Proxy(format!("proxy answered CONNECT with status {}", other))),
        }
    }

    Err(ConnectError::Proxy(format!("proxy authentication did not finish within {} rounds", MAX_AUTH_ROUNDS)))
}

// --- TCP transport ---

#[derive(Default)]
pub struct TcpTransport {
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    async fn dial(address: &str) -> Result<TcpStream, ConnectError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(channel: &ChannelConfig, stream: TcpStream) -> Result<BoxedIo, ConnectError> {
        use rustls::pki_types::ServerName;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnectError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name =
            ServerName::try_from(channel.host.clone()).map_err(|e| ConnectError::Tls(e.to_string()))?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tls = connector.connect(server_name, stream).await?;
        Ok(Box::new(tls))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(channel: &ChannelConfig, _stream: TcpStream) -> Result<BoxedIo, ConnectError> {
        Err(ConnectError::Tls(format!("{} requires TLS but the crate was built without the tls feature", channel.name)))
    }
}

impl Transport for TcpTransport {
    fn open<'a>(&'a self, channel: &'a ChannelConfig) -> BoxFuture<'a, Result<BoxedIo, ConnectError>> {
        Box::pin(async move {
            match &channel.flavor {
                ConnectionFlavor::Plain => {
                    let stream = Self::dial(&channel.address()).await?;
                    Ok(Box::new(stream) as BoxedIo)
                }
                ConnectionFlavor::Encrypted => {
                    let stream = Self::dial(&channel.address()).await?;
                    Self::wrap_tls(channel, stream).await
                }
                ConnectionFlavor::Tunneled { proxy_host, proxy_port } => {
                    let mut stream = Self::dial(&format!("{}:{}", proxy_host, proxy_port)).await?;
                    establish_tunnel(&mut stream, &channel.address(), self.authenticator.as_deref()).await?;
                    Ok(Box::new(stream) as BoxedIo)
                }
            }
        })
    }
}

// --- Link worker ---

/// Identity of one physical connection for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame { conn: ConnectionId, bytes: Bytes },
    Lost { conn: ConnectionId, reason: String },
}

/// Write side and kill switch of a running link worker.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl LinkHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame for writing. False once the worker has stopped.
    pub fn send(&self, frame: Bytes) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Stops the worker without reporting the connection as lost.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

/// Spawns the I/O worker for `io`. Events go to `events` as long as the
/// receiving loop is alive. The worker ends on a stream failure or when
/// `parent` is cancelled or the handle is closed.
pub fn spawn_link<E>(
    id: ConnectionId,
    io: BoxedIo,
    events: mpsc::WeakUnboundedSender<E>,
    parent: &CancellationToken,
) -> LinkHandle
where
    E: From<LinkEvent> + Send + 'static,
{
    let cancel = parent.child_token();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let token = cancel.clone();

    tokio::spawn(async move {
        let (mut sink, mut stream) = Framed::new(io, LengthDelimitedCodec::new()).split();

        let lost: Option<String> = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    // Frames queued before the cancel (closes on shutdown) still go out
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if sink.feed(frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    break None;
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        break Some(format!("write failed: {}", e));
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(bytes)) => {
                        let Some(tx) = events.upgrade() else { break None };
                        if tx.send(E::from(LinkEvent::Frame { conn: id, bytes: bytes.freeze() })).is_err() {
                            break None;
                        }
                    }
                    Some(Err(e)) => break Some(format!("read failed: {}", e)),
                    None => break Some("connection closed by remote".to_string()),
                },
            }
        };

        match lost {
            Some(reason) if !token.is_cancelled() => {
                log::warn!("Link {} lost: {}", id, reason);
                if let Some(tx) = events.upgrade() {
                    let _ = tx.send(E::from(LinkEvent::Lost { conn: id, reason }));
                }
            }
            _ => log::debug!("Link {} stopped", id),
        }
    });

    LinkHandle { id, outbound, cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_basic_authenticator_builds_header() {
        let auth = BasicAuthenticator::new("user", "secret");
        let response = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"p\"\r\n\r\n";
        assert_eq!(auth.challenge(response).unwrap(), AuthStep::Credentials("Basic dXNlcjpzZWNyZXQ=".to_string()));
    }

    #[test]
    fn test_basic_authenticator_requires_basic_offer() {
        let auth = BasicAuthenticator::new("user", "secret");
        let response = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\n\r\n";
        assert!(matches!(auth.challenge(response), Err(ConnectError::Proxy(_))));
    }

    #[tokio::test]
    async fn test_tunnel_with_basic_auth() {
        let (mut client, mut proxy) = duplex(4096);

        let proxy_task = tokio::spawn(async move {
            // 1. First CONNECT without credentials
            let (_, first) = read_request(&mut proxy).await;
            assert!(!first.contains("Proxy-Authorization"));
            let body = "denied";
            let reply = format!(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"x\"\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            proxy.write_all(reply.as_bytes()).await.unwrap();

            // 2. Second CONNECT with credentials
            let (_, second) = read_request(&mut proxy).await;
            assert!(second.contains("Proxy-Authorization: Basic dTpw"));
            proxy.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();

            // 3. Tunnel carries raw bytes afterwards
            proxy.write_all(b"hello").await.unwrap();
        });

        let auth = BasicAuthenticator::new("u", "p");
        establish_tunnel(&mut client, "feed.example:14002", Some(&auth)).await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_without_authenticator_fails_on_407() {
        let (mut client, mut proxy) = duplex(4096);
        tokio::spawn(async move {
            let _ = read_request(&mut proxy).await;
            proxy.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });
        let err = establish_tunnel(&mut client, "feed.example:14002", None).await.unwrap_err();
        assert!(matches!(err, ConnectError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_link_forwards_frames_both_ways() {
        let (local, remote) = duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let root = CancellationToken::new();
        let link = spawn_link(ConnectionId(7), Box::new(local), tx.downgrade(), &root);

        let mut remote = Framed::new(remote, LengthDelimitedCodec::new());
        remote.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Frame { conn: ConnectionId(7), bytes: Bytes::from_static(b"ping") })
        );

        assert!(link.send(Bytes::from_static(b"pong")));
        let echoed = remote.next().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"pong");

        drop(remote);
        match rx.recv().await {
            Some(LinkEvent::Lost { conn, .. }) => assert_eq!(conn, ConnectionId(7)),
            other => panic!("expected Lost, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_link_does_not_report_loss() {
        let (local, _remote) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let root = CancellationToken::new();
        let link = spawn_link(ConnectionId(1), Box::new(local), tx.downgrade(), &root);

        link.close();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> (usize, String) {
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            raw.push(byte[0]);
        }
        (raw.len(), String::from_utf8(raw).unwrap())
    }
}
