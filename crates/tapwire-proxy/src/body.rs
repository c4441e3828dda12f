use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http1::{read_until_pattern, BodyMode, Buffered, IO_CHUNK_SIZE, MAX_HEAD_BYTES};

const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// Outcome of reading a body against the buffer limit: either the whole
/// body fit, or the decoded prefix plus enough state to relay the rest.
pub(crate) enum BufferedBody {
    Complete(Bytes),
    Streaming { prefix: Bytes, rest: BodyResume },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyResume {
    Exact { remaining: u64 },
    /// `remaining_in_chunk == 0` means the source sits at a chunk-size
    /// line; otherwise that many data bytes of the current chunk (plus its
    /// terminator) are still unread.
    Chunked { remaining_in_chunk: u64 },
    UntilEof,
}

impl BodyResume {
    pub(crate) fn from_start(mode: BodyMode) -> Option<BodyResume> {
        match mode {
            BodyMode::None => None,
            BodyMode::ContentLength(length) => Some(BodyResume::Exact { remaining: length }),
            BodyMode::Chunked => Some(BodyResume::Chunked {
                remaining_in_chunk: 0,
            }),
            BodyMode::CloseDelimited => Some(BodyResume::UntilEof),
        }
    }
}

/// Decodes up to `limit` body bytes. Bodies that reach the limit before
/// completing are returned as a prefix plus resume state; the caller then
/// switches the exchange to streaming mode.
pub(crate) async fn read_body<S: AsyncRead + Unpin>(
    conn: &mut Buffered<S>,
    mode: BodyMode,
    limit: usize,
) -> io::Result<BufferedBody> {
    match mode {
        BodyMode::None => Ok(BufferedBody::Complete(Bytes::new())),
        BodyMode::ContentLength(length) => {
            if length >= limit as u64 {
                let prefix = read_exact_len(conn, limit).await?;
                Ok(BufferedBody::Streaming {
                    prefix: Bytes::from(prefix),
                    rest: BodyResume::Exact {
                        remaining: length - limit as u64,
                    },
                })
            } else {
                let body = read_exact_len(conn, length as usize).await?;
                Ok(BufferedBody::Complete(Bytes::from(body)))
            }
        }
        BodyMode::Chunked => read_chunked_body(conn, limit).await,
        BodyMode::CloseDelimited => read_close_delimited_body(conn, limit).await,
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    conn: &mut Buffered<S>,
    limit: usize,
) -> io::Result<BufferedBody> {
    let mut buffered = Vec::new();
    loop {
        let line = read_chunk_line(conn).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            discard_trailers(conn).await?;
            return Ok(BufferedBody::Complete(buffered.into()));
        }

        if buffered.len() as u64 + chunk_len >= limit as u64 {
            let take = limit - buffered.len();
            let taken = read_exact_len(conn, take).await?;
            buffered.extend_from_slice(&taken);
            let remaining_in_chunk = chunk_len - take as u64;
            if remaining_in_chunk == 0 {
                consume_chunk_terminator(conn).await?;
            }
            return Ok(BufferedBody::Streaming {
                prefix: buffered.into(),
                rest: BodyResume::Chunked { remaining_in_chunk },
            });
        }

        let data = read_exact_len(conn, chunk_len as usize).await?;
        buffered.extend_from_slice(&data);
        consume_chunk_terminator(conn).await?;
    }
}

async fn read_close_delimited_body<S: AsyncRead + Unpin>(
    conn: &mut Buffered<S>,
    limit: usize,
) -> io::Result<BufferedBody> {
    let mut buffered = Vec::new();
    if !conn.read_buf.is_empty() {
        let take = conn.read_buf.len().min(limit);
        buffered.extend(conn.read_buf.drain(..take));
    }
    while buffered.len() < limit {
        let want = (limit - buffered.len()).min(IO_CHUNK_SIZE);
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Ok(BufferedBody::Complete(buffered.into()));
        }
        buffered.extend_from_slice(&chunk[..read]);
    }
    Ok(BufferedBody::Streaming {
        prefix: buffered.into(),
        rest: BodyResume::UntilEof,
    })
}

/// Writes `prefix` plus everything `rest` still covers, preserving the
/// framing the receiver was promised in the already-sent head.
pub(crate) async fn stream_remainder<R, W>(
    source: &mut Buffered<R>,
    sink: &mut W,
    prefix: &[u8],
    rest: BodyResume,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match rest {
        BodyResume::Exact { remaining } => {
            if !prefix.is_empty() {
                sink.write_all(prefix).await?;
            }
            relay_exact(source, sink, remaining).await?;
        }
        BodyResume::Chunked { remaining_in_chunk } => {
            if !prefix.is_empty() {
                let size_line = format!("{:x}\r\n", prefix.len());
                sink.write_all(size_line.as_bytes()).await?;
                sink.write_all(prefix).await?;
                sink.write_all(b"\r\n").await?;
            }
            if remaining_in_chunk > 0 {
                let size_line = format!("{remaining_in_chunk:x}\r\n");
                sink.write_all(size_line.as_bytes()).await?;
                relay_exact(source, sink, remaining_in_chunk).await?;
                sink.write_all(b"\r\n").await?;
                consume_chunk_terminator(source).await?;
            }
            relay_chunked_raw(source, sink).await?;
        }
        BodyResume::UntilEof => {
            if !prefix.is_empty() {
                sink.write_all(prefix).await?;
            }
            relay_until_eof(source, sink).await?;
        }
    }
    sink.flush().await
}

/// Consumes an unread body without forwarding it, so the connection stays
/// aligned at the next message boundary.
pub(crate) async fn drain<S: AsyncRead + Unpin>(
    conn: &mut Buffered<S>,
    mode: BodyMode,
) -> io::Result<()> {
    let mut sink = tokio::io::sink();
    match mode {
        BodyMode::None => Ok(()),
        BodyMode::ContentLength(length) => relay_exact(conn, &mut sink, length).await,
        BodyMode::Chunked => relay_chunked_raw(conn, &mut sink).await,
        BodyMode::CloseDelimited => relay_until_eof(conn, &mut sink).await,
    }
}

pub(crate) async fn relay_exact<R, W>(
    source: &mut Buffered<R>,
    sink: &mut W,
    mut length: u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !source.read_buf.is_empty() && length > 0 {
        let take = (length as usize).min(source.read_buf.len());
        sink.write_all(&source.read_buf[..take]).await?;
        source.read_buf.drain(..take);
        length -= take as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    while length > 0 {
        let want = IO_CHUNK_SIZE.min(length as usize);
        let read = source.stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        sink.write_all(&chunk[..read]).await?;
        length -= read as u64;
    }
    Ok(())
}

pub(crate) async fn relay_until_eof<R, W>(source: &mut Buffered<R>, sink: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !source.read_buf.is_empty() {
        sink.write_all(&source.read_buf).await?;
        source.read_buf.clear();
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        sink.write_all(&chunk[..read]).await?;
    }
}

/// Forwards a chunked body verbatim from a chunk boundary, including the
/// terminal chunk and any trailers.
pub(crate) async fn relay_chunked_raw<R, W>(source: &mut Buffered<R>, sink: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_chunk_line(source).await?;
        sink.write_all(&line).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            loop {
                let trailer = read_until_pattern(source, b"\r\n", MAX_HEAD_BYTES)
                    .await?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before chunked trailers completed",
                        )
                    })?;
                sink.write_all(&trailer).await?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        relay_exact(source, sink, chunk_len).await?;

        let terminator = read_exact_len(source, 2).await?;
        if terminator.as_slice() != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk terminator",
            ));
        }
        sink.write_all(&terminator).await?;
    }
}

async fn read_chunk_line<S: AsyncRead + Unpin>(source: &mut Buffered<S>) -> io::Result<Vec<u8>> {
    read_until_pattern(source, b"\r\n", CHUNK_LINE_LIMIT)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunk size line was read",
            )
        })
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

async fn consume_chunk_terminator<S: AsyncRead + Unpin>(
    source: &mut Buffered<S>,
) -> io::Result<()> {
    let terminator = read_exact_len(source, 2).await?;
    if terminator.as_slice() != b"\r\n" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid chunk terminator",
        ));
    }
    Ok(())
}

async fn discard_trailers<S: AsyncRead + Unpin>(conn: &mut Buffered<S>) -> io::Result<()> {
    loop {
        let line = read_until_pattern(conn, b"\r\n", MAX_HEAD_BYTES)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunked trailers completed",
                )
            })?;
        if line == b"\r\n" {
            return Ok(());
        }
    }
}

pub(crate) async fn read_exact_len<S: AsyncRead + Unpin>(
    source: &mut Buffered<S>,
    exact_len: usize,
) -> io::Result<Vec<u8>> {
    while source.read_buf.len() < exact_len {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before fixed-length read completed",
            ));
        }
        source.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(source.read_buf.drain(..exact_len).collect::<Vec<_>>())
}
