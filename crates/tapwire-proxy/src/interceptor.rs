use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use tapwire_tls::CertificateAuthority;

use crate::addon::AddonChain;
use crate::connection::ConnContext;
use crate::http1::{self, Buffered};
use crate::options::Options;
use crate::pipe::{self, PipeConn, PipeHandle, PipeListener};
use crate::server::{self, ExchangeEnd, ExchangeOrigin};
use crate::websocket;

const PIPE_HANDOFF_CAPACITY: usize = 16;
const TLS_PREFIX_LEN: usize = 3;

/// The MITM core: classifies hijacked CONNECT tunnels by peeking their
/// first bytes, and runs an embedded TLS server over the in-memory pipes
/// that turn out to carry TLS. The server's certificates come from the
/// authority, minted per ClientHello SNI.
pub(crate) struct Interceptor {
    acceptor: TlsAcceptor,
    handoff: mpsc::Sender<PipeConn>,
    addons: Arc<AddonChain>,
    opts: Arc<Options>,
}

impl Interceptor {
    pub(crate) fn new(
        authority: Arc<CertificateAuthority>,
        addons: Arc<AddonChain>,
        opts: Arc<Options>,
    ) -> (Arc<Self>, PipeListener) {
        let tls_config = tapwire_tls::server_config_with_authority(authority);
        let (handoff, listener) = pipe::pipe_listener(PIPE_HANDOFF_CAPACITY);
        let interceptor = Arc::new(Self {
            acceptor: TlsAcceptor::from(tls_config),
            handoff,
            addons,
            opts,
        });
        (interceptor, listener)
    }

    /// Mints a pipe pair for a CONNECT tunnel. The caller gets the client
    /// end back immediately; classification of the server end runs on its
    /// own task once the client starts sending.
    pub(crate) fn dial(
        self: &Arc<Self>,
        connect_authority: String,
        client_addr: SocketAddr,
        context: Arc<ConnContext>,
    ) -> PipeHandle {
        let (handle, pipe) = pipe::pipe_pair(connect_authority, client_addr, context);
        let interceptor = Arc::clone(self);
        tokio::spawn(async move { interceptor.classify(pipe).await });
        handle
    }

    async fn classify(&self, mut pipe: PipeConn) {
        let mut prefix = [0_u8; TLS_PREFIX_LEN];
        match pipe.peek(TLS_PREFIX_LEN).await {
            Ok(peeked) => prefix.copy_from_slice(peeked),
            Err(error) => {
                tracing::debug!(host = %pipe.connect_authority(), %error, "tunnel closed before classification");
                return;
            }
        }

        if tapwire_tls::is_tls_record_prefix(&prefix) {
            let context = Arc::clone(pipe.context());
            context.client().mark_tls();
            context.init_https_server(self.opts.ssl_insecure).await;
            tracing::debug!(conn_id = %context.id(), client = %pipe.client_addr(), host = %pipe.connect_authority(), "tunnel classified as TLS");
            if self.handoff.send(pipe).await.is_err() {
                tracing::error!("embedded TLS server is gone; dropping tunnel");
            }
        } else {
            tracing::debug!(host = %pipe.connect_authority(), "tunnel classified as plaintext; passing through");
            websocket::relay_plain(pipe).await;
        }
    }

    /// Accept loop of the embedded TLS server: every pipe handed off by
    /// classification becomes one terminated TLS session on its own task.
    pub(crate) async fn serve(self: Arc<Self>, mut listener: PipeListener) {
        while let Some(pipe) = listener.accept().await {
            let interceptor = Arc::clone(&self);
            tokio::spawn(async move { interceptor.serve_tls_session(pipe).await });
        }
    }

    async fn serve_tls_session(&self, pipe: PipeConn) {
        let context = Arc::clone(pipe.context());
        let connect_authority = pipe.connect_authority().to_string();

        let tls = match self.acceptor.accept(pipe).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!(conn_id = %context.id(), host = %connect_authority, %error, "TLS termination failed");
                return;
            }
        };

        let mut conn = Buffered::new(tls);
        loop {
            let raw = match http1::read_head(&mut conn).await {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(error) => {
                    tracing::debug!(conn_id = %context.id(), %error, "intercepted connection ended");
                    return;
                }
            };
            let head = match http1::parse_request_head(&raw) {
                Ok(head) => head,
                Err(error) => {
                    tracing::debug!(conn_id = %context.id(), %error, "unparseable intercepted request");
                    let _ = http1::write_simple_response(
                        &mut conn.stream,
                        StatusCode::BAD_REQUEST,
                        "malformed request",
                    )
                    .await;
                    return;
                }
            };

            if http1::is_websocket_upgrade(&head) {
                websocket::relay_tls(conn, head.raw, &connect_authority, self.opts.ssl_insecure)
                    .await;
                return;
            }

            let end = match server::serve_exchange(
                &mut conn,
                head,
                ExchangeOrigin::Https {
                    authority: &connect_authority,
                },
                &context,
                &self.addons,
                &self.opts,
            )
            .await
            {
                Ok(end) => end,
                Err(error) => {
                    tracing::debug!(conn_id = %context.id(), %error, "intercepted exchange failed");
                    return;
                }
            };
            if end == ExchangeEnd::Close {
                return;
            }
        }
    }
}
