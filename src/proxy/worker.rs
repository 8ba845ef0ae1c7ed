// ────────────────────────────────
// src/proxy/worker.rs
// Drains the dispatch queue and forwards each request to a backend.
// ────────────────────────────────
use crate::load_balancer::LoadBalancer;
use crate::metrics::{MetricsCollector, Timer};
use crate::proxy::{Backend, BackendPool, ProxyError};
use crate::server::{ForwardRequest, ResponseChannel};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{HOST, TRANSFER_ENCODING};
use hyper::{Body, Client, Method, Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// One accepted request and the channel its response goes out on.
#[derive(Debug)]
pub struct WorkItem {
    pub peer: SocketAddr,
    pub request: ForwardRequest,
    pub response: ResponseChannel,
}

/// Receiving end of the dispatch queue, shared when more than one worker runs.
pub type DispatchQueue = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

pub struct ForwardingWorker {
    id: usize,
    pool: BackendPool,
    balancer: Arc<dyn LoadBalancer>,
    client: Client<HttpConnector>,
    timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ForwardingWorker {
    pub fn new(
        id: usize,
        pool: BackendPool,
        balancer: Arc<dyn LoadBalancer>,
        timeout: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            id,
            pool,
            balancer,
            client: Client::builder().build_http(),
            timeout,
            metrics,
        }
    }

    /// Processes items in arrival order until every sender is gone.
    pub async fn run(self, queue: DispatchQueue) {
        debug!(worker = self.id, "Forwarding worker started");
        loop {
            let item = {
                let mut rx = queue.lock().await;
                rx.recv().await
            };
            match item {
                Some(item) => self.dispatch(item).await,
                None => break,
            }
        }
        info!(worker = self.id, "Dispatch queue closed, forwarding worker exiting");
    }

    /// Handles one item start to finish. The response channel is always
    /// released before this returns.
    pub async fn dispatch(&self, item: WorkItem) {
        let WorkItem {
            peer,
            request,
            mut response,
        } = item;
        let timer = Timer::new();

        let (status, backend_name) = match self.balancer.select_backend(&self.pool) {
            Some((backend, index)) => {
                debug!(worker = self.id, backend = %backend.name, "Selected {}", backend.address);
                let status = self.forward(&backend, index, request, &mut response).await;
                (status, backend.name.clone())
            }
            None => {
                warn!("No healthy backend servers available");
                let status = respond_with_error(&mut response, &ProxyError::NoHealthyBackends).await;
                (status, "none".to_string())
            }
        };

        if let Err(err) = response.release().await {
            warn!(%peer, %err, "Error finishing response");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_request(status, &backend_name, timer.elapsed());
        }
    }

    async fn forward(
        &self,
        backend: &Backend,
        index: usize,
        request: ForwardRequest,
        response: &mut ResponseChannel,
    ) -> u16 {
        // Covers the whole backend exchange, body included.
        let deadline = Instant::now() + self.timeout;
        let outbound = match build_outbound(&backend.address, request) {
            Ok(outbound) => outbound,
            Err(err) => {
                error!("Error creating new request: {}", err);
                return respond_with_error(response, &err).await;
            }
        };

        match self.send(outbound, deadline).await {
            Ok(upstream) => {
                let status = upstream.status().as_u16();
                match relay(upstream, response, deadline).await {
                    Ok(()) => self.record_backend(backend, true),
                    Err(ProxyError::Response(err)) => {
                        warn!(backend = %backend.name, %err, "Error copying response to client");
                        self.record_backend(backend, true);
                    }
                    Err(err) => {
                        error!(
                            "Error reading response body from backend server {}: {}",
                            backend.address, err
                        );
                        self.pool.mark_unhealthy(index);
                        self.record_backend(backend, false);
                    }
                }
                status
            }
            Err(err) => {
                error!(
                    "Error forwarding request to backend server {}: {}",
                    backend.address, err
                );
                // Out of rotation until the next successful probe.
                self.pool.mark_unhealthy(index);
                self.record_backend(backend, false);
                respond_with_error(response, &err).await
            }
        }
    }

    async fn send(
        &self,
        request: Request<Body>,
        deadline: Instant,
    ) -> Result<Response<Body>, ProxyError> {
        match timeout_at(deadline, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(ProxyError::BackendError(err.to_string())),
            Err(_) => Err(ProxyError::Timeout),
        }
    }

    fn record_backend(&self, backend: &Backend, success: bool) {
        backend.record_request(success);
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_request(&backend.name, success);
            if !success {
                metrics.update_backend_health(&backend.name, false);
            }
        }
    }
}

/// Rebuilds the client request for `address`: same method, target and
/// headers, `Host` replaced, buffered body replayed.
pub fn build_outbound(address: &str, request: ForwardRequest) -> Result<Request<Body>, ProxyError> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;
    let uri = format!("http://{}{}", address, path_and_query(&request.target));

    let mut builder = Request::builder().method(method).uri(uri);
    for (key, value) in &request.headers {
        if key.eq_ignore_ascii_case(HOST.as_str()) {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_slice());
    }

    builder
        .header(HOST, address)
        .body(Body::from(request.body))
        .map_err(|e| ProxyError::RequestBuild(e.to_string()))
}

/// Origin-form targets pass through untouched; absolute-form targets are
/// reduced to their path and query.
fn path_and_query(target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    target
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str().to_string()))
        .unwrap_or_else(|| "/".to_string())
}

/// Copies status, headers and the streamed body onto the client channel.
/// `Transfer-Encoding` is dropped because the body arrives already decoded
/// and the connection close delimits it. A backend that stops sending body
/// bytes is cut off at `deadline`.
async fn relay(
    upstream: Response<Body>,
    response: &mut ResponseChannel,
    deadline: Instant,
) -> Result<(), ProxyError> {
    let (parts, mut body) = upstream.into_parts();

    response.set_status(parts.status.as_u16())?;
    for (name, value) in parts.headers.iter() {
        response.add_header(name.as_str(), String::from_utf8_lossy(value.as_bytes()))?;
    }
    response.remove_header(TRANSFER_ENCODING.as_str())?;
    response.finalize_headers().await?;

    loop {
        let chunk = match timeout_at(deadline, body.data()).await {
            Ok(Some(chunk)) => chunk.map_err(|e| ProxyError::BackendError(e.to_string()))?,
            Ok(None) => return Ok(()),
            Err(_) => return Err(ProxyError::Timeout),
        };
        response.write_body(&chunk).await?;
    }
}

async fn respond_with_error(response: &mut ResponseChannel, err: &ProxyError) -> u16 {
    let (status, message) = err.status_and_message();
    if let Err(write_err) = response.send_text(status, message).await {
        warn!(%write_err, "Error writing error response");
    }
    status.as_u16()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ChannelState;

    fn request(target: &str, headers: &[(&str, &str)], body: &[u8]) -> ForwardRequest {
        ForwardRequest {
            method: "POST".to_string(),
            target: target.to_string(),
            version: 1,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn rewrites_host_and_keeps_everything_else() {
        let req = request(
            "/api/items?page=2",
            &[("Host", "lb.example"), ("X-Trace", "abc"), ("X-Trace", "def")],
            b"payload",
        );
        let outbound = build_outbound("127.0.0.1:8081", req).unwrap();

        assert_eq!(outbound.method(), Method::POST);
        assert_eq!(outbound.uri(), "http://127.0.0.1:8081/api/items?page=2");
        let hosts: Vec<_> = outbound.headers().get_all(HOST).iter().collect();
        assert_eq!(hosts, vec!["127.0.0.1:8081"]);
        let traces: Vec<_> = outbound.headers().get_all("x-trace").iter().collect();
        assert_eq!(traces, vec!["abc", "def"]);
    }

    #[test]
    fn absolute_form_target_is_reduced() {
        assert_eq!(path_and_query("http://other.host/a/b?c=d"), "/a/b?c=d");
        assert_eq!(path_and_query("/plain"), "/plain");
        assert_eq!(path_and_query("http://other.host"), "/");
    }

    #[test]
    fn invalid_method_is_a_build_error() {
        let mut req = request("/", &[], b"");
        req.method = "BAD METHOD".to_string();
        assert!(matches!(
            build_outbound("127.0.0.1:1", req),
            Err(ProxyError::RequestBuild(_))
        ));
    }

    #[tokio::test]
    async fn relay_drops_transfer_encoding_and_streams_body() {
        let upstream = Response::builder()
            .status(201)
            .header("x-test", "a")
            .header("x-test", "b")
            .header("transfer-encoding", "chunked")
            .body(Body::from("created"))
            .unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let (mut channel, completion) = ResponseChannel::new(Box::new(server));
        relay(upstream, &mut channel, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        channel.release().await.unwrap();
        drop(completion.wait().await);
        drop(channel);

        let mut out = Vec::new();
        let mut client = client;
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut out).await.unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 201 Created\r\nX-Test: a\r\nX-Test: b\r\n\r\ncreated".to_vec()
        );
    }

    #[tokio::test]
    async fn relay_gives_up_on_a_stalled_body() {
        let (mut sender, body) = Body::channel();
        sender.send_data("part".into()).await.unwrap();
        let upstream = Response::builder()
            .header("content-length", "100")
            .body(body)
            .unwrap();

        let (_client, server) = tokio::io::duplex(4096);
        let (mut channel, _completion) = ResponseChannel::new(Box::new(server));
        let deadline = Instant::now() + Duration::from_millis(200);
        let result = relay(upstream, &mut channel, deadline).await;
        assert!(matches!(result, Err(ProxyError::Timeout)));
        assert_eq!(channel.state(), ChannelState::BodyStreaming);
        drop(sender);
    }
}
