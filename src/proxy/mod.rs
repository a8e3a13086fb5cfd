//! Data-plane proxying
//!
//! The [`ProxyServer`] accepts client HTTP requests and hands them to
//! the dispatcher; each backend's [`Forwarder`] does the actual
//! reverse-proxy hop over a connection pool shared by all backends.

mod forward;
mod server;

pub use forward::{proxy_client, BoxBody, ForwardError, Forwarder, ProxyClient};
pub use server::{ProxyServer, SHUTDOWN_GRACE};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

use crate::lb::LoadBalancer;

/// Run the data-plane listener until `shutdown` fires
pub async fn run_server(
    balancer: Arc<LoadBalancer>,
    listen: String,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    ProxyServer::new(balancer, listen).run(shutdown).await
}
