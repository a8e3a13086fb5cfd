use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::http::request;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::pool::ServerPool;
use crate::config::RuntimeConfig;
use crate::proxy::BoxBody;

/// Body of every data-plane 503
pub const SERVICE_NOT_AVAILABLE: &str = "Service not available";

/// The request path: selects a backend, attaches the request, forwards,
/// and on transport failure walks the retry/attempt escalation.
///
/// Per client request, `retry` counts re-invocations of the same
/// backend within one attempt and resets when a new backend is
/// selected; `attempts` counts backend selections. Both are bounded by
/// the configured `retries`, giving at most `retries + 1` selections
/// and `(retries + 1)²` forwarder invocations. Upstream responses of
/// any status count as success; only transport errors escalate.
pub struct Dispatcher {
    pool: Arc<ServerPool>,
    config: Arc<RuntimeConfig>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ServerPool>, config: Arc<RuntimeConfig>) -> Self {
        Self { pool, config }
    }

    /// Serve one client request. The body arrives buffered so it can be
    /// replayed across retries; the response is the selected upstream's
    /// response, or 503 when no backend could take the request.
    ///
    /// Dropping the returned future (client disconnect) aborts any
    /// pending retry sleep and releases every attached token through
    /// the completion watchers.
    pub async fn dispatch(&self, parts: request::Parts, body: Bytes) -> Response<BoxBody> {
        let mut attempts: u32 = 0;

        // One sender per attach; all live until this future completes
        // or is dropped, at which point the watchers detach.
        let mut in_flight: Vec<oneshot::Sender<()>> = Vec::new();

        loop {
            if attempts > self.config.retries() {
                warn!(path = %parts.uri.path(), "max attempts reached, terminating");
                return service_unavailable();
            }

            let Some(backend) = self.pool.select_next() else {
                warn!(path = %parts.uri.path(), "no live backend available");
                return service_unavailable();
            };

            let (done_tx, done_rx) = oneshot::channel();
            self.pool.attach(&backend, done_rx);
            in_flight.push(done_tx);

            debug!(
                backend = %backend.url,
                method = %parts.method,
                path = %parts.uri.path(),
                attempt = attempts,
                "forwarding",
            );

            let mut retry: u32 = 0;
            loop {
                match backend.forwarder.forward(&parts, body.clone()).await {
                    Ok(response) => return response,
                    Err(err) => {
                        warn!(backend = %backend.url, error = %err, "forward failed");

                        if retry < self.config.retries() {
                            sleep(self.config.retry_delay()).await;
                            retry += 1;
                            debug!(backend = %backend.url, retry, path = %parts.uri.path(), "retrying");
                            continue;
                        }

                        if attempts >= self.config.retries() {
                            warn!(path = %parts.uri.path(), "max attempts reached, terminating");
                            return service_unavailable();
                        }

                        attempts += 1;
                        debug!(path = %parts.uri.path(), attempt = attempts, "starting new attempt");
                        break;
                    }
                }
            }
        }
    }
}

/// 503 with the fixed `Service not available` body
pub fn service_unavailable() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("content-type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(SERVICE_NOT_AVAILABLE.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}
