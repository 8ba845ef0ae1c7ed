// ────────────────────────────────
// src/server/response.rs
// Raw-socket response writer with a single-fire completion signal.
// ────────────────────────────────
use hyper::StatusCode;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

/// Write side of a client connection.
pub type ClientSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Status and headers may still change.
    Open,
    /// The head block is on the wire; no body byte written yet.
    HeadersStaged,
    BodyStreaming,
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("headers already sent")]
    HeadersSent,

    #[error("response channel already released")]
    Released,

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("write to client failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Response headers in insertion order. Each key keeps its own ordered list
/// of values so repeated headers are emitted once per value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StagedHeaders {
    entries: Vec<(String, Vec<String>)>,
}

impl StagedHeaders {
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        let key = canonical_header_key(key);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.remove(key);
        self.add(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        let key = canonical_header_key(key);
        self.entries.retain(|(k, _)| *k != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.as_str(), v.as_str())))
    }
}

/// `content-type` → `Content-Type`. Keys containing bytes outside the token
/// alphabet are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    if !key.bytes().all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)) {
        return key.to_string();
    }
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Serializes the status line, every header line and the terminating blank
/// line into one buffer.
pub fn encode_head(status: StatusCode, headers: &StagedHeaders) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );
    for (key, value) in headers.iter() {
        head.extend_from_slice(key.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Fires once the response is finished, handing the socket's write half back
/// to the connection task so it can close the connection.
pub struct Completion {
    rx: oneshot::Receiver<ClientSink>,
}

impl Completion {
    /// Resolves when the channel is released or dropped. `None` means the
    /// sink was lost together with the channel.
    pub async fn wait(self) -> Option<ClientSink> {
        self.rx.await.ok()
    }
}

pub struct ResponseChannel {
    sink: Option<ClientSink>,
    status: StatusCode,
    headers: StagedHeaders,
    state: ChannelState,
    done: Option<oneshot::Sender<ClientSink>>,
}

impl fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseChannel")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("state", &self.state)
            .finish()
    }
}

impl ResponseChannel {
    pub fn new(sink: ClientSink) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let channel = Self {
            sink: Some(sink),
            status: StatusCode::OK,
            headers: StagedHeaders::default(),
            state: ChannelState::Open,
            done: Some(tx),
        };
        (channel, Completion { rx })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &StagedHeaders {
        &self.headers
    }

    fn ensure_open(&self) -> Result<(), ResponseError> {
        match self.state {
            ChannelState::Open => Ok(()),
            ChannelState::Released => Err(ResponseError::Released),
            _ => Err(ResponseError::HeadersSent),
        }
    }

    pub fn set_status(&mut self, code: u16) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.status = StatusCode::from_u16(code).map_err(|_| ResponseError::InvalidStatus(code))?;
        Ok(())
    }

    pub fn add_header(&mut self, key: &str, value: impl Into<String>) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.headers.add(key, value);
        Ok(())
    }

    pub fn set_header(&mut self, key: &str, value: impl Into<String>) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.headers.set(key, value);
        Ok(())
    }

    pub fn remove_header(&mut self, key: &str) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.headers.remove(key);
        Ok(())
    }

    /// Writes the head block in a single write. No-op once already written.
    pub async fn finalize_headers(&mut self) -> Result<(), ResponseError> {
        match self.state {
            ChannelState::Open => {}
            ChannelState::Released => return Err(ResponseError::Released),
            _ => return Ok(()),
        }
        let head = encode_head(self.status, &self.headers);
        let sink = self.sink.as_mut().ok_or(ResponseError::Released)?;
        // The state moves even on failure so nothing is written twice.
        self.state = ChannelState::HeadersStaged;
        sink.write_all(&head).await?;
        Ok(())
    }

    pub async fn write_body(&mut self, chunk: &[u8]) -> Result<(), ResponseError> {
        self.finalize_headers().await?;
        self.state = ChannelState::BodyStreaming;
        if chunk.is_empty() {
            return Ok(());
        }
        let sink = self.sink.as_mut().ok_or(ResponseError::Released)?;
        sink.write_all(chunk).await?;
        Ok(())
    }

    /// Finishes the response and fires the completion signal. Only the first
    /// call does anything; the signal fires even when the final write fails.
    pub async fn release(&mut self) -> Result<(), ResponseError> {
        if self.state == ChannelState::Released {
            return Ok(());
        }
        let result = match self.finalize_headers().await {
            Ok(()) => match self.sink.as_mut() {
                Some(sink) => sink.flush().await.map_err(ResponseError::from),
                None => Ok(()),
            },
            Err(err) => Err(err),
        };
        self.signal();
        result
    }

    fn signal(&mut self) {
        self.state = ChannelState::Released;
        if let (Some(done), Some(sink)) = (self.done.take(), self.sink.take()) {
            // The connection task may already be gone.
            let _ = done.send(sink);
        }
    }

    /// Stages a plain-text response body produced by the proxy itself.
    pub async fn send_text(&mut self, status: StatusCode, message: &str) -> Result<(), ResponseError> {
        self.set_status(status.as_u16())?;
        self.set_header("Content-Type", "text/plain; charset=utf-8")?;
        self.set_header("X-Content-Type-Options", "nosniff")?;
        self.set_header("Content-Length", message.len().to_string())?;
        self.write_body(message.as_bytes()).await
    }
}

impl Drop for ResponseChannel {
    fn drop(&mut self) {
        if self.state != ChannelState::Released {
            self.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn channel() -> (ResponseChannel, Completion, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (channel, completion) = ResponseChannel::new(Box::new(server));
        (channel, completion, client)
    }

    async fn read_all(mut client: tokio::io::DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn canonicalizes_keys() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-TEST"), "X-Test");
        assert_eq!(canonical_header_key("etag"), "Etag");
        assert_eq!(canonical_header_key("bad key"), "bad key");
    }

    #[test]
    fn repeated_headers_keep_order() {
        let mut headers = StagedHeaders::default();
        headers.add("x-test", "a");
        headers.add("Content-Type", "text/plain");
        headers.add("X-Test", "b");
        let lines: Vec<_> = headers.iter().collect();
        assert_eq!(
            lines,
            vec![("X-Test", "a"), ("X-Test", "b"), ("Content-Type", "text/plain")]
        );

        headers.remove("x-TEST");
        let lines: Vec<_> = headers.iter().collect();
        assert_eq!(lines, vec![("Content-Type", "text/plain")]);
    }

    #[test]
    fn encodes_head_exactly() {
        let mut headers = StagedHeaders::default();
        headers.add("X-Test", "a");
        headers.add("X-Test", "b");
        assert_eq!(
            encode_head(StatusCode::CREATED, &headers),
            b"HTTP/1.1 201 Created\r\nX-Test: a\r\nX-Test: b\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn head_precedes_body_on_the_wire() {
        let (mut channel, completion, client) = channel();
        channel.set_status(201).unwrap();
        channel.add_header("X-Test", "a").unwrap();
        channel.add_header("X-Test", "b").unwrap();
        assert_eq!(channel.state(), ChannelState::Open);

        channel.write_body(b"hello ").await.unwrap();
        assert_eq!(channel.state(), ChannelState::BodyStreaming);
        channel.write_body(b"world").await.unwrap();
        channel.release().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Released);

        let sink = completion.wait().await.expect("sink handed back");
        drop(sink);
        drop(channel);
        assert_eq!(
            read_all(client).await,
            b"HTTP/1.1 201 Created\r\nX-Test: a\r\nX-Test: b\r\n\r\nhello world".to_vec()
        );
    }

    #[tokio::test]
    async fn headers_are_frozen_after_finalize() {
        let (mut channel, _completion, _client) = channel();
        channel.finalize_headers().await.unwrap();
        assert_eq!(channel.state(), ChannelState::HeadersStaged);
        assert!(matches!(channel.add_header("X-Late", "1"), Err(ResponseError::HeadersSent)));
        assert!(matches!(channel.set_status(500), Err(ResponseError::HeadersSent)));
        // A second finalize writes nothing new.
        channel.finalize_headers().await.unwrap();
    }

    #[tokio::test]
    async fn release_without_body_still_sends_head() {
        let (mut channel, completion, client) = channel();
        channel.set_status(204).unwrap();
        channel.release().await.unwrap();
        drop(completion.wait().await);
        drop(channel);
        assert_eq!(read_all(client).await, b"HTTP/1.1 204 No Content\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (mut channel, completion, _client) = channel();
        channel.release().await.unwrap();
        channel.release().await.unwrap();
        assert!(matches!(channel.write_body(b"x").await, Err(ResponseError::Released)));
        assert!(completion.wait().await.is_some());
    }

    #[tokio::test]
    async fn dropping_unreleased_channel_fires_signal() {
        let (channel, completion, _client) = channel();
        drop(channel);
        assert!(completion.wait().await.is_some());
    }

    #[tokio::test]
    async fn release_fires_even_when_client_is_gone() {
        let (client, server) = tokio::io::duplex(16);
        let (mut channel, completion) = ResponseChannel::new(Box::new(server));
        drop(client);
        assert!(channel.write_body(b"0123456789abcdefghij").await.is_err());
        let _ = channel.release().await;
        assert_eq!(channel.state(), ChannelState::Released);
        assert!(completion.wait().await.is_some());
    }

    #[tokio::test]
    async fn send_text_sets_plain_text_headers() {
        let (mut channel, completion, client) = channel();
        channel
            .send_text(StatusCode::SERVICE_UNAVAILABLE, "No healthy backends available\n")
            .await
            .unwrap();
        channel.release().await.unwrap();
        drop(completion.wait().await);
        drop(channel);
        let text = String::from_utf8(read_all(client).await).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 30\r\n"));
        assert!(text.ends_with("\r\n\r\nNo healthy backends available\n"));
    }

    #[test]
    fn rejects_invalid_status() {
        let (client, server) = tokio::io::duplex(16);
        let (mut channel, _completion) = ResponseChannel::new(Box::new(server));
        assert!(matches!(channel.set_status(42), Err(ResponseError::InvalidStatus(42))));
        drop(client);
    }
}
