use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use uuid::Uuid;

use crate::addon::AddonChain;
use crate::http1::Buffered;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamScheme {
    Http,
    Https,
}

/// The client leg of a connection context: who connected, and whether
/// their TLS has been terminated by the interceptor.
pub struct ClientInfo {
    remote_addr: SocketAddr,
    tls: AtomicBool,
}

impl ClientInfo {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_tls(&self) {
        self.tls.store(true, Ordering::Relaxed);
    }
}

/// Per-client-connection record. Owns the client leg and the at-most-one
/// lazily dialled server leg; every exchange on the connection reuses the
/// same upstream connection once it exists.
pub struct ConnContext {
    id: Uuid,
    client: ClientInfo,
    server: Mutex<ServerLeg>,
}

pub(crate) enum ServerLeg {
    /// No upstream mode chosen yet.
    Idle,
    /// Upstream mode chosen, dial deferred until the first exchange.
    Configured {
        scheme: UpstreamScheme,
        insecure: bool,
    },
    Connected(ServerConn),
    /// Dialled once and gone; the connection context never re-dials.
    Closed,
}

pub(crate) struct ServerConn {
    pub(crate) conn: Buffered<UpstreamStream>,
    pub(crate) authority: String,
}

pub(crate) enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl ConnContext {
    pub(crate) fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            client: ClientInfo {
                remote_addr,
                tls: AtomicBool::new(false),
            },
            server: Mutex::new(ServerLeg::Idle),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    /// Chooses a plain-HTTP upstream for this connection. The first
    /// `init_*_server` call wins; later calls are no-ops.
    pub(crate) async fn init_http_server(&self, insecure: bool) {
        self.configure(UpstreamScheme::Http, insecure).await;
    }

    /// Chooses an HTTPS-only upstream, as used after TLS termination where
    /// every inner request forwards with scheme https.
    pub(crate) async fn init_https_server(&self, insecure: bool) {
        self.configure(UpstreamScheme::Https, insecure).await;
    }

    async fn configure(&self, scheme: UpstreamScheme, insecure: bool) {
        let mut leg = self.server.lock().await;
        if matches!(&*leg, ServerLeg::Idle) {
            *leg = ServerLeg::Configured { scheme, insecure };
        }
    }

    pub(crate) async fn server_leg(&self) -> MutexGuard<'_, ServerLeg> {
        self.server.lock().await
    }
}

/// Returns the connected server leg, dialling it on first use. The
/// `server_connected` hook fires here, exactly once per connection
/// context, after the dial (and TLS handshake, for https) succeeds.
pub(crate) async fn ensure_connected<'leg>(
    leg: &'leg mut ServerLeg,
    ctx: &Arc<ConnContext>,
    addons: &AddonChain,
    authority: &str,
    sni_host: &str,
) -> io::Result<&'leg mut ServerConn> {
    if matches!(&*leg, ServerLeg::Closed) {
        return Err(io::Error::other(
            "upstream connection is gone for this client connection",
        ));
    }

    if !matches!(&*leg, ServerLeg::Connected(_)) {
        let (scheme, insecure) = match &*leg {
            ServerLeg::Configured { scheme, insecure } => (*scheme, *insecure),
            _ => (UpstreamScheme::Http, false),
        };
        let stream = dial(scheme, insecure, authority, sni_host).await?;
        *leg = ServerLeg::Connected(ServerConn {
            conn: Buffered::new(stream),
            authority: authority.to_string(),
        });
        tracing::debug!(conn_id = %ctx.id(), authority, "server connected");
        addons.server_connected(ctx);
    }

    match leg {
        ServerLeg::Connected(server) => {
            if server.authority != authority {
                return Err(io::Error::other(format!(
                    "upstream leg is bound to {} but the request targets {}",
                    server.authority, authority
                )));
            }
            Ok(server)
        }
        _ => Err(io::Error::other("upstream leg unavailable")),
    }
}

async fn dial(
    scheme: UpstreamScheme,
    insecure: bool,
    authority: &str,
    sni_host: &str,
) -> io::Result<UpstreamStream> {
    let tcp = TcpStream::connect(authority).await?;
    match scheme {
        UpstreamScheme::Http => Ok(UpstreamStream::Plain(tcp)),
        UpstreamScheme::Https => {
            let config = tapwire_tls::upstream_client_config(insecure);
            let server_name = ServerName::try_from(sni_host.to_string())
                .map_err(|_| io::Error::other("invalid server name for upstream TLS"))?;
            let tls = TlsConnector::from(config)
                .connect(server_name, tcp)
                .await?;
            Ok(UpstreamStream::Tls(Box::new(tls)))
        }
    }
}

/// Replaces a connected leg with `Closed`, dropping (and thereby closing)
/// the upstream socket. Returns whether a live connection was torn down,
/// so the caller can fire `server_disconnected` exactly once.
pub(crate) fn close_connected_leg(leg: &mut ServerLeg) -> bool {
    if matches!(leg, ServerLeg::Connected(_)) {
        *leg = ServerLeg::Closed;
        return true;
    }
    false
}

/// Connection teardown half of the pairwise close rule: when the client
/// leg goes away, the server leg is reaped and its disconnect hook fires
/// before the client's.
pub(crate) async fn close_server_leg(ctx: &ConnContext, addons: &AddonChain) {
    let mut leg = ctx.server.lock().await;
    let had_connection = close_connected_leg(&mut leg);
    drop(leg);
    if had_connection {
        tracing::debug!(conn_id = %ctx.id(), "server disconnected");
        addons.server_disconnected(ctx);
    }
}
