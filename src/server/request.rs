// ────────────────────────────────
// src/server/request.rs
// Reads exactly one HTTP/1.x request off a client socket.
// ────────────────────────────────
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("connection closed before a complete request was read")]
    UnexpectedEof,

    #[error("request head exceeds 64 KiB")]
    HeadTooLarge,

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("unsupported Transfer-Encoding: {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid chunk: {0}")]
    InvalidChunk(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully buffered inbound request, ready to be replayed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub method: String,
    /// Request target as sent by the client, query string included.
    pub target: String,
    /// Minor HTTP version (`0` or `1`).
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl ForwardRequest {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    pub fn proto(&self) -> &'static str {
        if self.version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }
}

enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

/// Reads one request. Bodies larger than `max_body` bytes are rejected
/// before they are buffered.
pub async fn read_request<R>(
    reader: &mut R,
    max_body: usize,
) -> Result<ForwardRequest, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    match parsed.parse(&head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(FramingError::UnexpectedEof),
    }

    let method = parsed.method.unwrap_or_default().to_string();
    let target = parsed.path.unwrap_or_default().to_string();
    let version = parsed.version.unwrap_or(1);
    let mut headers: Vec<(String, Vec<u8>)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    let body = match body_framing(&headers)? {
        BodyFraming::None => Vec::new(),
        BodyFraming::Length(len) => {
            if len > max_body {
                return Err(FramingError::BodyTooLarge { limit: max_body });
            }
            let mut body = Vec::new();
            read_exactly(reader, len, &mut body).await?;
            body
        }
        BodyFraming::Chunked => {
            let body = read_chunked(reader, max_body).await?;
            headers.retain(|(key, _)| {
                !key.eq_ignore_ascii_case("transfer-encoding")
                    && !key.eq_ignore_ascii_case("content-length")
            });
            headers.push(("Content-Length".to_string(), body.len().to_string().into_bytes()));
            body
        }
    };

    Ok(ForwardRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

/// Collects bytes up to and including the blank line ending the head.
async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let start = head.len();
        // One byte past the cap is enough to tell an oversized head apart.
        let allowance = (MAX_HEAD_BYTES + 1 - start) as u64;
        let n = (&mut *reader)
            .take(allowance)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            return Err(FramingError::UnexpectedEof);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(FramingError::HeadTooLarge);
        }
        let line = &head[start..];
        // Leading empty lines before the request line are tolerated.
        if (line == b"\r\n" || line == b"\n") && start > 0 {
            return Ok(head);
        }
        if line == b"\r\n" || line == b"\n" {
            head.clear();
        }
    }
}

fn body_framing(headers: &[(String, Vec<u8>)]) -> Result<BodyFraming, FramingError> {
    let mut chunked = false;
    for (_, value) in headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case("transfer-encoding"))
    {
        let value = String::from_utf8_lossy(value).trim().to_ascii_lowercase();
        match value.as_str() {
            "chunked" => chunked = true,
            "identity" | "" => {}
            _ => return Err(FramingError::UnsupportedTransferEncoding(value)),
        }
    }
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut length: Option<usize> = None;
    for (_, value) in headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case("content-length"))
    {
        let text = String::from_utf8_lossy(value).trim().to_string();
        let parsed: usize = text
            .parse()
            .map_err(|_| FramingError::InvalidContentLength(text.clone()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(FramingError::InvalidContentLength(text));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        Some(0) | None => BodyFraming::None,
        Some(len) => BodyFraming::Length(len),
    })
}

async fn read_chunked<R>(reader: &mut R, max_body: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader).await?;
        let size_text = line.split(|b| *b == b';').next().unwrap_or_default();
        let size_text = std::str::from_utf8(size_text)
            .map_err(|_| FramingError::InvalidChunk("size is not ASCII"))?
            .trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| FramingError::InvalidChunk("size is not hexadecimal"))?;

        if size == 0 {
            // Trailers are read and dropped.
            loop {
                let trailer = read_line(reader).await?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        match body.len().checked_add(size) {
            Some(total) if total <= max_body => {}
            _ => return Err(FramingError::BodyTooLarge { limit: max_body }),
        }
        read_exactly(reader, size, &mut body).await?;

        if !read_line(reader).await?.is_empty() {
            return Err(FramingError::InvalidChunk("missing CRLF after chunk data"));
        }
    }
}

/// Reads one line and strips the trailing CRLF (or bare LF).
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if line.len() > MAX_CHUNK_LINE {
        return Err(FramingError::InvalidChunk("line too long"));
    }
    if n == 0 || line.last() != Some(&b'\n') {
        return Err(FramingError::UnexpectedEof);
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// Appends exactly `len` bytes to `buf`. The buffer grows with the data
/// actually received, never ahead of it.
async fn read_exactly<R>(
    reader: &mut R,
    len: usize,
    buf: &mut Vec<u8>,
) -> Result<(), FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader).take(len as u64).read_to_end(buf).await?;
    if n < len {
        return Err(FramingError::UnexpectedEof);
    }
    Ok(())
}
