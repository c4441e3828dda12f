use std::io;

use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;
pub(crate) const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A stream plus the bytes read past the last consumed message boundary.
pub(crate) struct Buffered<S> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
}

impl<S> Buffered<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) raw: Vec<u8>,
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
    pub(crate) connection_close: bool,
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
    pub(crate) connection_close: bool,
}

/// Reads one HTTP/1 head through the terminating blank line. `None` means
/// the peer closed cleanly before sending anything.
pub(crate) async fn read_head<S: AsyncRead + Unpin>(
    conn: &mut Buffered<S>,
) -> io::Result<Option<Vec<u8>>> {
    read_until_pattern(conn, b"\r\n\r\n", MAX_HEAD_BYTES).await
}

pub(crate) async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut Buffered<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP head exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("request head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| invalid_data("request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method_text = parts
        .next()
        .ok_or_else(|| invalid_data("request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(invalid_data("request line had too many fields"));
    }

    let method = Method::from_bytes(method_text.as_bytes())
        .map_err(|_| invalid_data("invalid request method"))?;
    let version = parse_version(version_text)?;
    let headers = parse_headers(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        raw: raw.to_vec(),
        method,
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub(crate) fn parse_response_head(raw: &[u8], request_method: &Method) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("response head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| invalid_data("response status line is missing"))?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| invalid_data("response status is missing"))?;

    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid_data("invalid response status code"))?;

    let headers = parse_headers(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut connection_close = is_connection_close(version, &headers);
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        status,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_version(text: &str) -> io::Result<Version> {
    match text {
        "HTTP/1.0" => Ok(Version::HTTP_10),
        "HTTP/1.1" => Ok(Version::HTTP_11),
        _ => Err(invalid_data(
            "only HTTP/1.0 and HTTP/1.1 are supported on this leg",
        )),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data("malformed header line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid_data("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderMap) -> io::Result<BodyMode> {
    if has_header_token(headers, &TRANSFER_ENCODING, "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }
    Ok(BodyMode::None)
}

fn response_body_mode(
    headers: &HeaderMap,
    request_method: &Method,
    status: StatusCode,
) -> io::Result<BodyMode> {
    if request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyMode::None);
    }

    if has_header_token(headers, &TRANSFER_ENCODING, "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }

    Ok(BodyMode::CloseDelimited)
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut value = None;
    for header in headers.get_all(CONTENT_LENGTH) {
        let parsed = header
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| invalid_data("invalid Content-Length value"))?;
        value = Some(parsed);
    }
    Ok(value)
}

pub(crate) fn has_header_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn is_connection_close(version: Version, headers: &HeaderMap) -> bool {
    if has_header_token(headers, &CONNECTION, "close") {
        return true;
    }
    version == Version::HTTP_10 && !has_header_token(headers, &CONNECTION, "keep-alive")
}

pub(crate) fn is_websocket_upgrade(head: &RequestHead) -> bool {
    head.method == Method::GET
        && has_header_token(&head.headers, &CONNECTION, "upgrade")
        && headers_contain_value(&head.headers, &UPGRADE, "websocket")
}

fn headers_contain_value(headers: &HeaderMap, name: &HeaderName, expected: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.trim().eq_ignore_ascii_case(expected))
}

/// Removes the hop-by-hop headers that must not travel past this hop.
/// Message framing headers are re-derived separately.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(HeaderName::from_static("proxy-connection"));
    headers.remove(HeaderName::from_static("keep-alive"));
    headers.remove(HeaderName::from_static("te"));
    headers.remove(HeaderName::from_static("trailer"));
}

pub(crate) fn apply_request_framing(headers: &mut HeaderMap, body_len: usize) {
    headers.remove(TRANSFER_ENCODING);
    if body_len > 0 {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    } else {
        headers.remove(CONTENT_LENGTH);
    }
}

pub(crate) fn apply_response_framing(headers: &mut HeaderMap, body_len: usize, original_mode: BodyMode) {
    headers.remove(TRANSFER_ENCODING);
    if body_len == 0 && original_mode == BodyMode::None {
        headers.remove(CONTENT_LENGTH);
        return;
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
}

pub(crate) fn ensure_host_header(headers: &mut HeaderMap, authority: &str) {
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(authority) {
            headers.insert(HOST, value);
        }
    }
}

/// The hostname part of an `authority` in `host:port` form, brackets
/// stripped for IPv6 literals.
pub(crate) fn authority_host(authority: &str) -> &str {
    if let Some(bracketed) = authority.strip_prefix('[') {
        if let Some(end) = bracketed.find(']') {
            return &bracketed[..end];
        }
    }
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
}

pub(crate) fn serialize_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    serialize_headers(&mut head, headers);
    head.extend_from_slice(b"\r\n");
    head
}

pub(crate) fn serialize_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(status.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    head.extend_from_slice(b"\r\n");
    serialize_headers(&mut head, headers);
    head.extend_from_slice(b"\r\n");
    head
}

fn serialize_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

pub(crate) async fn write_simple_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: StatusCode,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
    use http::{Method, StatusCode, Version};

    use super::{
        apply_response_framing, authority_host, is_websocket_upgrade, parse_request_head,
        parse_response_head, serialize_response_head, strip_hop_by_hop, BodyMode, Buffered,
    };

    #[tokio::test]
    async fn reads_one_head_and_keeps_the_leftover() {
        let wire: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nleftover";
        let mut conn = Buffered::new(wire);
        let head = super::read_head(&mut conn)
            .await
            .expect("read")
            .expect("head present");
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.read_buf, b"leftover");
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_is_none() {
        let wire: &[u8] = b"";
        let mut conn = Buffered::new(wire);
        assert!(super::read_head(&mut conn).await.expect("read").is_none());
    }

    #[test]
    fn parses_absolute_form_request() {
        let head = parse_request_head(
            b"GET http://origin:8080/hello?x=1 HTTP/1.1\r\nHost: origin:8080\r\nAccept: */*\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://origin:8080/hello?x=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.body_mode, BodyMode::None);
        assert!(!head.connection_close);
    }

    #[test]
    fn derives_request_body_mode_from_framing_headers() {
        let chunked = parse_request_head(
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(chunked.body_mode, BodyMode::Chunked);

        let sized =
            parse_request_head(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\n")
                .expect("parse");
        assert_eq!(sized.body_mode, BodyMode::ContentLength(12));
    }

    #[test]
    fn http10_without_keep_alive_closes() {
        let head =
            parse_request_head(b"GET /a HTTP/1.0\r\nHost: x\r\n\r\n").expect("parse");
        assert!(head.connection_close);

        let keep_alive = parse_request_head(
            b"GET /a HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        )
        .expect("parse");
        assert!(!keep_alive.connection_close);
    }

    #[test]
    fn rejects_http2_request_lines() {
        assert!(parse_request_head(b"GET /a HTTP/2\r\n\r\n").is_err());
    }

    #[test]
    fn head_responses_and_204_have_no_body() {
        let to_head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
            &Method::HEAD,
        )
        .expect("parse");
        assert_eq!(to_head.body_mode, BodyMode::None);

        let no_content =
            parse_response_head(b"HTTP/1.1 204 No Content\r\n\r\n", &Method::GET).expect("parse");
        assert_eq!(no_content.body_mode, BodyMode::None);
    }

    #[test]
    fn unframed_response_is_close_delimited_and_closes() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", &Method::GET).expect("parse");
        assert_eq!(head.body_mode, BodyMode::CloseDelimited);
        assert!(head.connection_close);
    }

    #[test]
    fn detects_websocket_upgrade_requests() {
        let upgrade = parse_request_head(
            b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .expect("parse");
        assert!(is_websocket_upgrade(&upgrade));

        let plain = parse_request_head(b"GET /chat HTTP/1.1\r\nHost: x\r\n\r\n").expect("parse");
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn strips_hop_by_hop_and_reframes() {
        let mut head = parse_request_head(
            b"POST /u HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\nProxy-Connection: keep-alive\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .expect("parse")
        .headers;
        strip_hop_by_hop(&mut head);
        assert!(!head.contains_key(CONNECTION));
        assert!(!head.contains_key("proxy-connection"));

        apply_response_framing(&mut head, 5, BodyMode::Chunked);
        assert!(!head.contains_key(TRANSFER_ENCODING));
        assert_eq!(head.get(CONTENT_LENGTH).map(|v| v.as_bytes()), Some(&b"5"[..]));
    }

    #[test]
    fn serializes_a_response_head_with_reason_phrase() {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONTENT_LENGTH, http::HeaderValue::from_static("6"));
        let head = serialize_response_head(StatusCode::IM_A_TEAPOT, &headers);
        let text = String::from_utf8(head).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 418 I'm a teapot\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn extracts_host_from_authorities() {
        assert_eq!(authority_host("origin:443"), "origin");
        assert_eq!(authority_host("origin"), "origin");
        assert_eq!(authority_host("[2001:db8::1]:8443"), "2001:db8::1");
    }
}
