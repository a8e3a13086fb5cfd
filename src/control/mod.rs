//! Control-plane API
//!
//! JSON over HTTP on a separate port: `POST /register` and
//! `POST /deregister` mutate pool membership, `POST /config` mutates
//! the runtime configuration.

mod server;

pub use server::{BackendRequest, ConfigRequest, ControlServer};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

use crate::lb::LoadBalancer;

/// Run the control-plane listener until `shutdown` fires
pub async fn run_server(
    balancer: Arc<LoadBalancer>,
    listen: String,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    ControlServer::new(balancer, listen).run(shutdown).await
}
