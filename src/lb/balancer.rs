use bytes::Bytes;
use hyper::http::request;
use hyper::Response;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use url::Url;

use super::backend::Backend;
use super::dispatch::Dispatcher;
use super::health::HealthChecker;
use super::pool::ServerPool;
use crate::config::{BalancerConfig, RuntimeConfig};
use crate::proxy::{proxy_client, BoxBody, Forwarder, ProxyClient};

/// Errors from a control-plane register call
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("backend url has no host: {0}")]
    MissingHost(String),
}

/// Facade tying the pool, the dispatcher, the health checker, and the
/// runtime configuration together. One instance serves both listeners.
pub struct LoadBalancer {
    pool: Arc<ServerPool>,
    config: Arc<RuntimeConfig>,
    dispatcher: Dispatcher,
    client: ProxyClient,
}

impl LoadBalancer {
    /// Create an empty balancer and spawn its health-check task
    pub fn start(defaults: &BalancerConfig) -> Arc<Self> {
        let pool = Arc::new(ServerPool::new());
        let config = Arc::new(RuntimeConfig::new(defaults));
        let client = proxy_client();
        let dispatcher = Dispatcher::new(Arc::clone(&pool), Arc::clone(&config));

        HealthChecker::new(Arc::clone(&pool), config.watch_hc_period()).start();

        Arc::new(Self {
            pool,
            config,
            dispatcher,
            client,
        })
    }

    /// Parse `url`, wire a forwarder for it, and add the backend to the
    /// pool, alive and ready for selection.
    pub fn register_backend(&self, url: &str) -> Result<(), RegisterError> {
        let url = Url::parse(url)?;
        if url.host_str().is_none() {
            return Err(RegisterError::MissingHost(url.into()));
        }

        let forwarder = Forwarder::new(self.client.clone(), url.clone());
        self.pool.register(Arc::new(Backend::new(url.clone(), forwarder)));
        info!(backend = %url, "backend registered");
        Ok(())
    }

    /// Remove every backend registered under `url`. Unknown and
    /// unparsable URLs are silently ignored.
    pub fn deregister_backend(&self, url: &str) {
        let Ok(url) = Url::parse(url) else {
            return;
        };
        let removed = self.pool.deregister(&url);
        info!(backend = %url, removed, "backend deregistered");
    }

    /// Serve one data-plane request
    pub async fn dispatch(&self, parts: request::Parts, body: Bytes) -> Response<BoxBody> {
        self.dispatcher.dispatch(parts, body).await
    }

    /// Runtime configuration, shared with the control handlers
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The backend pool, shared with the health checker
    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }
}
