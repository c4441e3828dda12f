use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::http1::{authority_host, Buffered};
use crate::pipe::PipeConn;

/// Passthrough for tunnels whose first bytes are not TLS: the payload is
/// relayed verbatim to the CONNECT target. Frame-level WebSocket handling
/// lives behind this dispatch point and is intentionally not done here.
pub(crate) async fn relay_plain(mut pipe: PipeConn) {
    let authority = pipe.connect_authority().to_string();
    let mut upstream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(host = %authority, %error, "passthrough dial failed");
            return;
        }
    };

    match copy_bidirectional(&mut pipe, &mut upstream).await {
        Ok((from_client, from_server)) => {
            tracing::debug!(host = %authority, from_client, from_server, "passthrough closed");
        }
        Err(error) => {
            tracing::debug!(host = %authority, %error, "passthrough ended with error");
        }
    }
}

/// WebSocket upgrade seen on a terminated-TLS connection: dial the origin
/// over TLS, replay the upgrade request verbatim, and relay bytes both
/// ways from then on.
pub(crate) async fn relay_tls<S>(
    mut conn: Buffered<S>,
    upgrade_head: Vec<u8>,
    authority: &str,
    insecure: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tcp = match TcpStream::connect(authority).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(host = %authority, %error, "websocket upstream dial failed");
            return;
        }
    };

    let server_name = match ServerName::try_from(authority_host(authority).to_string()) {
        Ok(name) => name,
        Err(_) => {
            tracing::debug!(host = %authority, "invalid server name for websocket upstream");
            return;
        }
    };
    let connector = TlsConnector::from(tapwire_tls::upstream_client_config(insecure));
    let mut upstream = match connector.connect(server_name, tcp).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(host = %authority, %error, "websocket upstream handshake failed");
            return;
        }
    };

    if let Err(error) = upstream.write_all(&upgrade_head).await {
        tracing::debug!(host = %authority, %error, "websocket upgrade replay failed");
        return;
    }
    if !conn.read_buf.is_empty() {
        if let Err(error) = upstream.write_all(&conn.read_buf).await {
            tracing::debug!(host = %authority, %error, "websocket upgrade replay failed");
            return;
        }
        conn.read_buf.clear();
    }

    if let Err(error) = copy_bidirectional(&mut conn.stream, &mut upstream).await {
        tracing::debug!(host = %authority, %error, "websocket relay ended with error");
    }
}
