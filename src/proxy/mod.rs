//
// src/proxy/mod.rs
//
mod backend;
mod pool;
mod proxy;
mod worker;

pub use backend::{Backend, BackendMetrics};
pub use pool::BackendPool;
pub use proxy::{Proxy, ProxyError};
pub use worker::{build_outbound, DispatchQueue, ForwardingWorker, WorkItem};
