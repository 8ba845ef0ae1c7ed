// ────────────────────────────────
// src/server/acceptor.rs
// One task per accepted connection: frame a request, hand it to the
// forwarding workers, hold the socket open until the response is released.
// ────────────────────────────────
use crate::metrics::MetricsCollector;
use crate::proxy::WorkItem;
use crate::server::request::read_request;
use crate::server::response::ResponseChannel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub struct Acceptor {
    dispatch: mpsc::Sender<WorkItem>,
    read_timeout: Duration,
    max_body: usize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Acceptor {
    pub fn new(
        dispatch: mpsc::Sender<WorkItem>,
        read_timeout: Duration,
        max_body: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            dispatch,
            read_timeout,
            max_body,
            metrics,
        }
    }

    /// Accepts forever. Accept errors are logged and never end the loop.
    pub async fn run(self, listener: TcpListener) {
        let acceptor = Arc::new(self);
        if let Ok(addr) = listener.local_addr() {
            info!("Load balancer listening on {}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let span = info_span!("conn", %peer, request_id = %Uuid::new_v4());
                    tokio::spawn(
                        async move { acceptor.handle_connection(stream, peer).await }.instrument(span),
                    );
                }
                Err(err) => {
                    error!(%err, "Error accepting connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _guard = self.metrics.as_ref().map(|m| ConnectionGuard::new(m.clone()));
        debug!("Received connection from {}", peer);

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let read = read_request(&mut reader, self.max_body);
        let request = match timeout(self.read_timeout, read).await {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                warn!(%err, "Error reading request, dropping connection");
                return;
            }
            Err(_) => {
                warn!(timeout = ?self.read_timeout, "Timed out reading request, dropping connection");
                return;
            }
        };

        info!("{} {} {}", request.method, request.target, request.proto());

        let (response, completion) = ResponseChannel::new(Box::new(write_half));
        let item = WorkItem {
            peer,
            request,
            response,
        };

        if self.dispatch.send(item).await.is_err() {
            error!("Dispatch queue closed, dropping request");
            return;
        }

        match completion.wait().await {
            Some(mut sink) => {
                if let Err(err) = sink.shutdown().await {
                    debug!(%err, "Error shutting down client socket");
                }
            }
            None => warn!("Response channel dropped without handing back the socket"),
        }
    }
}

struct ConnectionGuard {
    metrics: Arc<MetricsCollector>,
}

impl ConnectionGuard {
    fn new(metrics: Arc<MetricsCollector>) -> Self {
        metrics.increment_active_connections();
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.decrement_active_connections();
    }
}
