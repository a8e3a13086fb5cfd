use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::forward::BoxBody;
use crate::lb::LoadBalancer;

/// How long in-flight connections may finish after a shutdown signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Data-plane HTTP listener: accepts every method and path and hands
/// each request to the dispatcher.
pub struct ProxyServer {
    balancer: Arc<LoadBalancer>,
    listen: String,
}

impl ProxyServer {
    pub fn new(balancer: Arc<LoadBalancer>, listen: String) -> Self {
        Self { balancer, listen }
    }

    /// Accept connections until `shutdown` fires, then drain in-flight
    /// connections within the grace window.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("load balancer listening on {}", addr);

        let server = Arc::new(self);
        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let server = Arc::clone(&server);
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let server = Arc::clone(&server);
                        async move { server.handle_request(req).await }
                    });

                    let conn = http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(io, service);
                    let conn = graceful.watch(conn);

                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            // Filter out benign connection reset errors
                            let err_str = format!("{}", e);
                            if !err_str.contains("connection reset")
                                && !err_str.contains("broken pipe")
                            {
                                error!("Error serving connection from {}: {}", remote_addr, e);
                            }
                        }
                    });
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => debug!("data-plane connections drained"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("grace period expired, dropping remaining data-plane connections");
            }
        }

        Ok(())
    }

    /// Buffer the request body, then dispatch. Buffering is what makes
    /// the body replayable across retries and reattempts.
    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
            }
        };

        Ok(self.balancer.dispatch(parts, body).await)
    }
}

fn text_response(status: StatusCode, message: &'static str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(message.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}
