use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, StatusCode, Uri};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tapwire_tls::CertificateAuthority;

use crate::addon::{Addon, AddonChain};
use crate::body::{self, BodyResume, BufferedBody};
use crate::connection::{self, ConnContext, UpstreamScheme};
use crate::errors::ProxyError;
use crate::flow::{Flow, Request, Response};
use crate::http1::{self, BodyMode, Buffered, RequestHead};
use crate::interceptor::Interceptor;
use crate::options::Options;

const BAD_PROXY_REQUEST_BODY: &str =
    "tapwire is an HTTP proxy; requests must use an absolute URI or CONNECT";

/// The proxy server: plaintext listener, addon pipeline, certificate
/// authority, and the embedded interceptor for CONNECT tunnels.
pub struct Proxy {
    opts: Arc<Options>,
    addons: Vec<Arc<dyn Addon>>,
    authority: Arc<CertificateAuthority>,
}

impl Proxy {
    pub fn new(opts: Options) -> Result<Self, ProxyError> {
        opts.validate()?;
        let authority = Arc::new(CertificateAuthority::open_or_create(&opts.ca_root_path)?);
        Ok(Self {
            opts: Arc::new(opts),
            addons: Vec::new(),
            authority,
        })
    }

    /// Appends an addon. Registration order is hook order; the list is
    /// fixed once the proxy starts.
    pub fn add_addon(&mut self, addon: Arc<dyn Addon>) {
        self.addons.push(addon);
    }

    /// The root certificate in PEM form, for installation into a client's
    /// trust store.
    pub fn ca_certificate_pem(&self) -> Result<String, ProxyError> {
        Ok(self.authority.ca_certificate_pem()?)
    }

    pub async fn bind_listener(&self) -> Result<TcpListener, ProxyError> {
        Ok(TcpListener::bind(&self.opts.listen_addr).await?)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ProxyError> {
        let addons = Arc::new(AddonChain::new(self.addons));
        let (interceptor, pipe_listener) = Interceptor::new(
            Arc::clone(&self.authority),
            Arc::clone(&addons),
            Arc::clone(&self.opts),
        );
        tokio::spawn(Arc::clone(&interceptor).serve(pipe_listener));

        tracing::info!(addr = %self.opts.listen_addr, "proxy listening");
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let addons = Arc::clone(&addons);
            let interceptor = Arc::clone(&interceptor);
            let opts = Arc::clone(&self.opts);
            tokio::spawn(async move {
                handle_client(stream, client_addr, addons, interceptor, opts).await;
            });
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    client_addr: SocketAddr,
    addons: Arc<AddonChain>,
    interceptor: Arc<Interceptor>,
    opts: Arc<Options>,
) {
    let context = Arc::new(ConnContext::new(client_addr));
    tracing::debug!(conn_id = %context.id(), %client_addr, "client connected");
    addons.client_connected(context.client());

    if let Err(error) = drive_client(stream, &context, &addons, &interceptor, &opts).await {
        tracing::debug!(conn_id = %context.id(), %error, "client connection ended with error");
    }

    connection::close_server_leg(&context, &addons).await;
    addons.client_disconnected(context.client());
    tracing::debug!(conn_id = %context.id(), "client disconnected");
}

async fn drive_client(
    stream: TcpStream,
    context: &Arc<ConnContext>,
    addons: &AddonChain,
    interceptor: &Arc<Interceptor>,
    opts: &Options,
) -> io::Result<()> {
    let mut conn = Buffered::new(stream);
    loop {
        let Some(raw) = http1::read_head(&mut conn).await? else {
            return Ok(());
        };
        let head = match http1::parse_request_head(&raw) {
            Ok(head) => head,
            Err(error) => {
                tracing::debug!(conn_id = %context.id(), %error, "unparseable request head");
                http1::write_simple_response(
                    &mut conn.stream,
                    StatusCode::BAD_REQUEST,
                    BAD_PROXY_REQUEST_BODY,
                )
                .await?;
                return Ok(());
            }
        };

        if head.method == Method::CONNECT {
            return handle_connect(conn, head, context, interceptor).await;
        }

        let end = serve_exchange(
            &mut conn,
            head,
            ExchangeOrigin::AbsoluteForm,
            context,
            addons,
            opts,
        )
        .await?;
        if end == ExchangeEnd::Close {
            return Ok(());
        }
    }
}

/// Hijacks the client socket for a CONNECT tunnel: the interceptor mints
/// an in-memory pipe, the client gets `200 Connection Established`, and
/// the raw bytes are copied between socket and pipe until either side
/// closes. Disconnect hooks fire only after the interceptor side is done.
async fn handle_connect(
    mut conn: Buffered<TcpStream>,
    head: RequestHead,
    context: &Arc<ConnContext>,
    interceptor: &Arc<Interceptor>,
) -> io::Result<()> {
    let mut authority = head.target.clone();
    if !authority.contains(':') {
        authority.push_str(":443");
    }

    let tunnel = interceptor.dial(
        authority.clone(),
        context.client().remote_addr(),
        Arc::clone(context),
    );
    let crate::pipe::PipeHandle {
        mut client_io,
        session_closed,
    } = tunnel;

    conn.stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    // Bytes the client sent after the CONNECT head (usually an eager
    // ClientHello) belong to the tunnel.
    if !conn.read_buf.is_empty() {
        client_io.write_all(&conn.read_buf).await?;
        conn.read_buf.clear();
    }

    match copy_bidirectional(&mut conn.stream, &mut client_io).await {
        Ok((from_client, from_server)) => {
            tracing::debug!(conn_id = %context.id(), host = %authority, from_client, from_server, "tunnel closed");
        }
        Err(error) => {
            tracing::debug!(conn_id = %context.id(), host = %authority, %error, "tunnel ended with error");
        }
    }

    // Unblock the interceptor side, then wait for it to finish so the
    // disconnect hooks fire strictly after every inner exchange.
    drop(client_io);
    let _ = session_closed.await;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeEnd {
    KeepAlive,
    Close,
}

pub(crate) enum ExchangeOrigin<'a> {
    /// Outer plaintext path: the request line carries an absolute URI.
    AbsoluteForm,
    /// Terminated-TLS path: origin-form targets against the CONNECT
    /// authority, scheme forced to https.
    Https { authority: &'a str },
}

/// Runs one request/response exchange through the addon pipeline, the
/// body buffering policy, and the per-connection upstream leg.
pub(crate) async fn serve_exchange<S>(
    conn: &mut Buffered<S>,
    head: RequestHead,
    origin: ExchangeOrigin<'_>,
    context: &Arc<ConnContext>,
    addons: &AddonChain,
    opts: &Options,
) -> io::Result<ExchangeEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some((url, upstream_authority, scheme)) = resolve_target(&head, &origin) else {
        http1::write_simple_response(
            &mut conn.stream,
            StatusCode::BAD_REQUEST,
            BAD_PROXY_REQUEST_BODY,
        )
        .await?;
        return Ok(ExchangeEnd::Close);
    };

    match scheme {
        UpstreamScheme::Http => context.init_http_server(opts.ssl_insecure).await,
        UpstreamScheme::Https => context.init_https_server(opts.ssl_insecure).await,
    }

    let request_body_mode = head.body_mode;
    let client_wants_close = head.connection_close;

    let request = Request {
        method: head.method,
        url,
        version: head.version,
        headers: head.headers,
        body: None,
    };
    let mut flow = Flow::new(request, Arc::clone(context));
    tracing::debug!(flow_id = %flow.id, method = %flow.request.method, url = %flow.request.url, "request received");

    if addons.request_headers(&mut flow) {
        body::drain(conn, request_body_mode).await?;
        return write_synthesized_response(conn, flow, client_wants_close).await;
    }

    let mut request_stream: Option<(Bytes, BodyResume)> = None;
    if flow.stream {
        request_stream = BodyResume::from_start(request_body_mode).map(|rest| (Bytes::new(), rest));
    } else {
        match body::read_body(conn, request_body_mode, opts.body_buffer_limit()).await? {
            BufferedBody::Complete(bytes) => {
                flow.request.body = Some(bytes);
                if addons.request(&mut flow) {
                    return write_synthesized_response(conn, flow, client_wants_close).await;
                }
            }
            BufferedBody::Streaming { prefix, rest } => {
                tracing::warn!(flow_id = %flow.id, limit = opts.body_buffer_limit(), "request body promoted to streaming");
                flow.stream = true;
                request_stream = Some((prefix, rest));
            }
        }
    }

    let sni_host = http1::authority_host(&upstream_authority).to_string();
    let mut leg = context.server_leg().await;
    let server = match connection::ensure_connected(
        &mut leg,
        context,
        addons,
        &upstream_authority,
        &sni_host,
    )
    .await
    {
        Ok(server) => server,
        Err(error) => {
            tracing::warn!(flow_id = %flow.id, %error, "upstream unavailable");
            drop(leg);
            http1::write_simple_response(&mut conn.stream, StatusCode::BAD_GATEWAY, "").await?;
            flow.finish();
            return Ok(ExchangeEnd::Close);
        }
    };

    let origin_form = origin_form_target(&flow.request.url);
    let mut outbound = flow.request.headers.clone();
    http1::strip_hop_by_hop(&mut outbound);
    http1::ensure_host_header(&mut outbound, &upstream_authority);
    if let Some(body_bytes) = &flow.request.body {
        http1::apply_request_framing(&mut outbound, body_bytes.len());
    }
    let request_head_bytes =
        http1::serialize_request_head(&flow.request.method, &origin_form, &outbound);

    let exchange_result = async {
        server.conn.stream.write_all(&request_head_bytes).await?;
        if let Some(body_bytes) = &flow.request.body {
            if !body_bytes.is_empty() {
                server.conn.stream.write_all(body_bytes).await?;
            }
        } else if let Some((prefix, rest)) = request_stream.take() {
            body::stream_remainder(&mut *conn, &mut server.conn.stream, &prefix, rest).await?;
        }
        server.conn.stream.flush().await?;

        let raw = http1::read_head(&mut server.conn).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before response headers",
            )
        })?;
        http1::parse_response_head(&raw, &flow.request.method)
    }
    .await;

    let response_head = match exchange_result {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(flow_id = %flow.id, %error, "upstream exchange failed");
            let had_connection = connection::close_connected_leg(&mut leg);
            drop(leg);
            if had_connection {
                addons.server_disconnected(context);
            }
            http1::write_simple_response(&mut conn.stream, StatusCode::BAD_GATEWAY, "").await?;
            flow.finish();
            return Ok(ExchangeEnd::Close);
        }
    };

    let upstream_close = response_head.connection_close;
    let response_body_mode = response_head.body_mode;
    flow.response = Some(Response {
        status: response_head.status,
        headers: response_head.headers,
        body: None,
    });

    if addons.response_headers(&mut flow) {
        // An addon supplied the body directly: the upstream body is never
        // surfaced, but it still gets drained so the leg stays aligned.
        let drained = body::drain(&mut server.conn, response_body_mode).await;
        let end = write_synthesized_response(conn, flow, client_wants_close).await?;
        if drained.is_err() || upstream_close {
            let had_connection = connection::close_connected_leg(&mut leg);
            drop(leg);
            if had_connection {
                addons.server_disconnected(context);
            }
            return Ok(ExchangeEnd::Close);
        }
        return Ok(end);
    }

    let mut response_stream: Option<(Bytes, BodyResume)> = None;
    if flow.stream {
        response_stream =
            BodyResume::from_start(response_body_mode).map(|rest| (Bytes::new(), rest));
    } else {
        match body::read_body(&mut server.conn, response_body_mode, opts.body_buffer_limit()).await
        {
            Ok(BufferedBody::Complete(bytes)) => {
                if let Some(response) = flow.response.as_mut() {
                    response.body = Some(bytes);
                }
                addons.response(&mut flow);
            }
            Ok(BufferedBody::Streaming { prefix, rest }) => {
                tracing::warn!(flow_id = %flow.id, limit = opts.body_buffer_limit(), "response body promoted to streaming");
                flow.stream = true;
                response_stream = Some((prefix, rest));
            }
            Err(error) => {
                tracing::warn!(flow_id = %flow.id, %error, "upstream body read failed");
                let had_connection = connection::close_connected_leg(&mut leg);
                drop(leg);
                if had_connection {
                    addons.server_disconnected(context);
                }
                http1::write_simple_response(&mut conn.stream, StatusCode::BAD_GATEWAY, "").await?;
                flow.finish();
                return Ok(ExchangeEnd::Close);
            }
        }
    }

    let close_after =
        client_wants_close || upstream_close || response_body_mode == BodyMode::CloseDelimited;

    let (status, mut outbound, body_bytes) = match flow.response.as_ref() {
        Some(response) => (
            response.status,
            response.headers.clone(),
            response.body.clone(),
        ),
        None => {
            // an addon dropped the response record; nothing left to relay
            http1::write_simple_response(&mut conn.stream, StatusCode::BAD_GATEWAY, "").await?;
            flow.finish();
            return Ok(ExchangeEnd::Close);
        }
    };
    http1::strip_hop_by_hop(&mut outbound);
    if close_after {
        outbound.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    if let Some((prefix, rest)) = response_stream.take() {
        // streaming: the head keeps the framing the upstream promised
        let head_bytes = http1::serialize_response_head(status, &outbound);
        conn.stream.write_all(&head_bytes).await?;
        body::stream_remainder(&mut server.conn, &mut conn.stream, &prefix, rest).await?;
    } else {
        let body_bytes = body_bytes.unwrap_or_default();
        http1::apply_response_framing(&mut outbound, body_bytes.len(), response_body_mode);
        let head_bytes = http1::serialize_response_head(status, &outbound);
        conn.stream.write_all(&head_bytes).await?;
        if !body_bytes.is_empty() {
            conn.stream.write_all(&body_bytes).await?;
        }
        conn.stream.flush().await?;
    }

    flow.finish();
    tracing::debug!(flow_id = %flow.id, status = status.as_u16(), stream = flow.stream, "exchange completed");

    if upstream_close {
        let had_connection = connection::close_connected_leg(&mut leg);
        drop(leg);
        if had_connection {
            addons.server_disconnected(context);
        }
    } else {
        drop(leg);
    }

    Ok(if close_after {
        ExchangeEnd::Close
    } else {
        ExchangeEnd::KeepAlive
    })
}

async fn write_synthesized_response<S>(
    conn: &mut Buffered<S>,
    mut flow: Flow,
    client_wants_close: bool,
) -> io::Result<ExchangeEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(response) = flow.response.take() else {
        return Err(io::Error::other("short-circuit without a synthesized response"));
    };
    let status = response.status;
    let body_bytes = response.body.unwrap_or_default();
    let mut outbound = response.headers;
    http1::strip_hop_by_hop(&mut outbound);
    outbound.remove(TRANSFER_ENCODING);
    outbound.insert(CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));
    if client_wants_close {
        outbound.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let head_bytes = http1::serialize_response_head(status, &outbound);
    conn.stream.write_all(&head_bytes).await?;
    if !body_bytes.is_empty() {
        conn.stream.write_all(&body_bytes).await?;
    }
    conn.stream.flush().await?;

    flow.finish();
    tracing::debug!(flow_id = %flow.id, status = status.as_u16(), "short-circuited by addon");
    Ok(if client_wants_close {
        ExchangeEnd::Close
    } else {
        ExchangeEnd::KeepAlive
    })
}

fn resolve_target(
    head: &RequestHead,
    origin: &ExchangeOrigin<'_>,
) -> Option<(Uri, String, UpstreamScheme)> {
    match origin {
        ExchangeOrigin::AbsoluteForm => {
            let url: Uri = head.target.parse().ok()?;
            let scheme = match url.scheme_str() {
                Some("http") => UpstreamScheme::Http,
                Some("https") => UpstreamScheme::Https,
                _ => return None,
            };
            let host = url.host()?;
            let port = url.port_u16().unwrap_or(match scheme {
                UpstreamScheme::Http => 80,
                UpstreamScheme::Https => 443,
            });
            let authority = format_dial_authority(host, port);
            Some((url, authority, scheme))
        }
        ExchangeOrigin::Https { authority } => {
            let target = if head.target.starts_with('/') {
                head.target.as_str()
            } else {
                "/"
            };
            let url = Uri::builder()
                .scheme("https")
                .authority(*authority)
                .path_and_query(target)
                .build()
                .ok()?;
            Some((url, (*authority).to_string(), UpstreamScheme::Https))
        }
    }
}

fn format_dial_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn origin_form_target(url: &Uri) -> String {
    url.path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use http::Uri;

    use super::{format_dial_authority, origin_form_target, resolve_target, ExchangeOrigin};
    use crate::connection::UpstreamScheme;
    use crate::http1::parse_request_head;

    #[test]
    fn absolute_form_targets_resolve_with_default_ports() {
        let head =
            parse_request_head(b"GET http://origin/hello HTTP/1.1\r\nHost: origin\r\n\r\n")
                .expect("parse");
        let (url, authority, scheme) =
            resolve_target(&head, &ExchangeOrigin::AbsoluteForm).expect("resolve");
        assert_eq!(url.to_string(), "http://origin/hello");
        assert_eq!(authority, "origin:80");
        assert_eq!(scheme, UpstreamScheme::Http);
    }

    #[test]
    fn origin_form_targets_are_rejected_on_the_plaintext_path() {
        let head = parse_request_head(b"GET /hello HTTP/1.1\r\nHost: origin\r\n\r\n")
            .expect("parse");
        assert!(resolve_target(&head, &ExchangeOrigin::AbsoluteForm).is_none());
    }

    #[test]
    fn terminated_tls_targets_force_https_against_the_connect_authority() {
        let head = parse_request_head(b"GET /a?b=1 HTTP/1.1\r\nHost: origin\r\n\r\n")
            .expect("parse");
        let (url, authority, scheme) = resolve_target(
            &head,
            &ExchangeOrigin::Https {
                authority: "origin:443",
            },
        )
        .expect("resolve");
        assert_eq!(url.to_string(), "https://origin:443/a?b=1");
        assert_eq!(authority, "origin:443");
        assert_eq!(scheme, UpstreamScheme::Https);
    }

    #[test]
    fn dial_authorities_bracket_ipv6_hosts() {
        assert_eq!(format_dial_authority("origin", 80), "origin:80");
        assert_eq!(format_dial_authority("2001:db8::1", 443), "[2001:db8::1]:443");
    }

    #[test]
    fn origin_form_target_defaults_to_root() {
        let url: Uri = "http://origin".parse().expect("uri");
        assert_eq!(origin_form_target(&url), "/");
        let url: Uri = "http://origin/x?q=1".parse().expect("uri");
        assert_eq!(origin_form_target(&url), "/x?q=1");
    }
}
