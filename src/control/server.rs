use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::request;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::lb::LoadBalancer;
use crate::proxy::{BoxBody, SHUTDOWN_GRACE};

/// Request body for `/register` and `/deregister`
#[derive(Debug, Deserialize)]
pub struct BackendRequest {
    pub url: String,
}

/// Request body for `/config`; any subset of fields may be present
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    /// Health-check period, in seconds
    pub hc_frequency: Option<u64>,
    pub retries: Option<u32>,
    /// Same-backend retry delay, in milliseconds
    pub retry_delay: Option<u64>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

/// Control-plane HTTP listener: backend registration and runtime
/// reconfiguration.
pub struct ControlServer {
    balancer: Arc<LoadBalancer>,
    listen: String,
}

impl ControlServer {
    pub fn new(balancer: Arc<LoadBalancer>, listen: String) -> Self {
        Self { balancer, listen }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid control listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("control server listening on {}", addr);

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

                    let conn = http1::Builder::new().serve_connection(io, service);
                    let conn = graceful.watch(conn);

                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!("Error serving control connection from {}: {}", remote_addr, e);
                        }
                    });
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => debug!("control connections drained"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("grace period expired, dropping remaining control connections");
            }
        }

        Ok(())
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read control request body: {}", e);
                return Ok(bad_request());
            }
        };

        Ok(route(&self.balancer, &parts, &body))
    }
}

fn route(balancer: &Arc<LoadBalancer>, parts: &request::Parts, body: &Bytes) -> Response<BoxBody> {
    match (&parts.method, parts.uri.path()) {
        (&Method::POST, "/register") => register(balancer, body),
        (&Method::POST, "/deregister") => deregister(balancer, body),
        (&Method::POST, "/config") => reconfigure(balancer, body),
        _ => not_found(),
    }
}

fn register(balancer: &Arc<LoadBalancer>, body: &Bytes) -> Response<BoxBody> {
    let req: BackendRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed register body: {}", e);
            return bad_request();
        }
    };

    match balancer.register_backend(&req.url) {
        Ok(()) => json_message(format!("Successfully Registered: {}", req.url)),
        Err(e) => {
            warn!(backend = %req.url, error = %e, "register rejected");
            bad_request()
        }
    }
}

fn deregister(balancer: &Arc<LoadBalancer>, body: &Bytes) -> Response<BoxBody> {
    let req: BackendRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed deregister body: {}", e);
            return bad_request();
        }
    };

    // Heap mutation happens off the control response path
    let balancer = Arc::clone(balancer);
    let url = req.url.clone();
    tokio::spawn(async move {
        balancer.deregister_backend(&url);
    });

    json_message(format!("Deregistering: {}", req.url))
}

fn reconfigure(balancer: &Arc<LoadBalancer>, body: &Bytes) -> Response<BoxBody> {
    let req: ConfigRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed config body: {}", e);
            return bad_request();
        }
    };

    let config = balancer.config();
    if let Some(retries) = req.retries {
        config.set_retries(retries);
    }
    if let Some(secs) = req.hc_frequency {
        config.set_hc_period(Duration::from_secs(secs));
    }
    if let Some(millis) = req.retry_delay {
        config.set_retry_delay(Duration::from_millis(millis));
    }
    info!(
        retries = config.retries(),
        retry_delay_ms = config.retry_delay().as_millis() as u64,
        hc_period_secs = config.hc_period().as_secs(),
        "configuration updated",
    );

    json_message("Configuration Updated.".to_string())
}

fn json_message(message: String) -> Response<BoxBody> {
    let body = serde_json::to_vec(&MessageResponse { message }).unwrap();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

fn bad_request() -> Response<BoxBody> {
    text_response(StatusCode::BAD_REQUEST, "Bad Request")
}

fn not_found() -> Response<BoxBody> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerConfig;
    use std::time::Instant;

    fn post(path: &str) -> request::Parts {
        let (parts, ()) = Request::builder()
            .method("POST")
            .uri(path)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn get(path: &str) -> request::Parts {
        let (parts, ()) = Request::builder()
            .method("GET")
            .uri(path)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    async fn body_string(response: Response<BoxBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_register_adds_backend() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());
        let body = Bytes::from(r#"{"url": "http://10.0.0.1:9000"}"#);

        let response = route(&balancer, &post("/register"), &body);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(balancer.pool().len(), 1);

        let body = body_string(response).await;
        assert_eq!(
            body,
            r#"{"message":"Successfully Registered: http://10.0.0.1:9000"}"#
        );
    }

    #[tokio::test]
    async fn test_register_malformed_json_is_400() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());

        let response = route(&balancer, &post("/register"), &Bytes::from("{not json"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(balancer.pool().is_empty());
    }

    #[tokio::test]
    async fn test_register_invalid_url_is_400() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());
        let body = Bytes::from(r#"{"url": "not a url"}"#);

        let response = route(&balancer, &post("/register"), &body);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(balancer.pool().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_is_asynchronous() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());
        balancer.register_backend("http://10.0.0.1:9000").unwrap();

        let body = Bytes::from(r#"{"url": "http://10.0.0.1:9000"}"#);
        let response = route(&balancer, &post("/deregister"), &body);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            r#"{"message":"Deregistering: http://10.0.0.1:9000"}"#
        );

        // Removal happens off the response path; wait for it
        let deadline = Instant::now() + Duration::from_secs(2);
        while !balancer.pool().is_empty() {
            assert!(Instant::now() < deadline, "deregister never completed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_deregister_unknown_url_is_ok() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());
        let body = Bytes::from(r#"{"url": "http://10.9.9.9:9000"}"#);

        let response = route(&balancer, &post("/deregister"), &body);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_config_applies_partial_update() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());
        let body = Bytes::from(r#"{"retries": 5, "hcFrequency": 10}"#);

        let response = route(&balancer, &post("/config"), &body);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            r#"{"message":"Configuration Updated."}"#
        );

        assert_eq!(balancer.config().retries(), 5);
        assert_eq!(balancer.config().hc_period(), Duration::from_secs(10));
        // Untouched field keeps its default
        assert_eq!(
            balancer.config().retry_delay(),
            Duration::from_millis(1000)
        );
    }

    #[tokio::test]
    async fn test_config_malformed_json_is_400() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());

        let response = route(&balancer, &post("/config"), &Bytes::from("[1, 2"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(balancer.config().retries(), 3);
    }

    #[tokio::test]
    async fn test_unknown_routes_are_404() {
        let balancer = LoadBalancer::start(&BalancerConfig::default());
        let body = Bytes::from(r#"{"url": "http://10.0.0.1:9000"}"#);

        let response = route(&balancer, &post("/unknown"), &body);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Registration endpoints are POST-only
        let response = route(&balancer, &get("/register"), &body);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(balancer.pool().is_empty());
    }
}
