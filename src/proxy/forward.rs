use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::http::request;
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// HTTP body type for proxied responses
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared upstream HTTP client. Clone is cheap; clones share one
/// connection pool across all backends.
pub type ProxyClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Errors from a single forwarding attempt. These never reach the
/// client verbatim; they feed the dispatcher's retry state machine.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("request build error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream body error: {0}")]
    Body(#[from] hyper::Error),
}

/// Headers consumed by the proxy hop, never forwarded in either
/// direction (RFC 9110 §7.6.1)
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Build the upstream HTTP client
///
/// Connector settings: TCP_NODELAY, 10s connect timeout, 90s TCP
/// keepalive, TLS via native-tls so https backends work out of the box.
pub fn proxy_client() -> ProxyClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.enforce_http(false);
    http.set_connect_timeout(Some(Duration::from_secs(10)));
    http.set_keepalive(Some(Duration::from_secs(90)));

    let tls = TlsConnector::new().expect("Failed to build TLS connector");
    let https = HttpsConnector::from((http, tls.into()));

    HyperClient::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .retry_canceled_requests(true)
        .set_host(true)
        .build(https)
}

/// Single-host reverse proxy for one backend: rewrites the request
/// target onto the backend origin, forwards, and streams the upstream
/// response back.
#[derive(Clone)]
pub struct Forwarder {
    client: ProxyClient,
    origin: Url,
}

impl Forwarder {
    pub fn new(client: ProxyClient, origin: Url) -> Self {
        Self { client, origin }
    }

    /// Forward one request to the backend. Both bodies are buffered:
    /// the request body by the caller so it can be replayed on retry,
    /// the response body here so a mid-stream upstream failure is still
    /// retryable before anything reaches the client.
    pub async fn forward(
        &self,
        parts: &request::Parts,
        body: Bytes,
    ) -> Result<Response<BoxBody>, ForwardError> {
        let target = rewrite_target(&self.origin, &parts.uri);

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(target);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        let request = builder.body(Full::new(body))?;
        let response = self.client.request(request).await?;

        let (mut head, body) = response.into_parts();
        let bytes = body.collect().await?.to_bytes();
        for name in HOP_BY_HOP {
            head.headers.remove(*name);
        }

        Ok(Response::from_parts(
            head,
            Full::new(bytes).map_err(|never| match never {}).boxed(),
        ))
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("origin", &self.origin.as_str())
            .finish_non_exhaustive()
    }
}

/// Rewrite an incoming request target onto the backend origin,
/// joining the origin's path prefix with the request path.
fn rewrite_target(origin: &Url, uri: &Uri) -> String {
    let mut target = origin.clone();
    target.set_path(&join_slash(origin.path(), uri.path()));
    target.set_query(uri.query());
    target.to_string()
}

fn join_slash(prefix: &str, path: &str) -> String {
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &path[1..]),
        (false, false) => format!("{}/{}", prefix, path),
        _ => format!("{}{}", prefix, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(origin: &str, uri: &str) -> String {
        let origin = Url::parse(origin).unwrap();
        let uri: Uri = uri.parse().unwrap();
        rewrite_target(&origin, &uri)
    }

    #[test]
    fn test_rewrite_plain_path() {
        assert_eq!(
            rewrite("http://10.0.0.1:9000", "/objects/a"),
            "http://10.0.0.1:9000/objects/a"
        );
    }

    #[test]
    fn test_rewrite_keeps_query() {
        assert_eq!(
            rewrite("http://10.0.0.1:9000", "/search?q=1&page=2"),
            "http://10.0.0.1:9000/search?q=1&page=2"
        );
    }

    #[test]
    fn test_rewrite_joins_prefix() {
        assert_eq!(
            rewrite("http://10.0.0.1:9000/api", "/v1/items"),
            "http://10.0.0.1:9000/api/v1/items"
        );
        assert_eq!(
            rewrite("http://10.0.0.1:9000/api/", "/v1/items"),
            "http://10.0.0.1:9000/api/v1/items"
        );
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }
}
