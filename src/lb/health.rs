use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use super::pool::ServerPool;

/// How long a TCP connect may take before a backend counts as down
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Periodic liveness prober for every backend in the pool.
///
/// Each tick snapshots the pool membership under the pool lock, releases
/// it, then probes the backends one by one. The tick period follows the
/// runtime configuration through a watch channel: a reconfiguration
/// resets the timer, while a sweep already in progress completes on the
/// old schedule.
pub struct HealthChecker {
    pool: Arc<ServerPool>,
    period: watch::Receiver<Duration>,
}

impl HealthChecker {
    pub fn new(pool: Arc<ServerPool>, period: watch::Receiver<Duration>) -> Self {
        Self { pool, period }
    }

    /// Spawn the background sweep loop
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut period_rx = self.period.clone();
        let mut period = *period_rx.borrow_and_update();

        info!(period_secs = period.as_secs(), "health checker started");

        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                changed = period_rx.changed() => {
                    // The sender lives in RuntimeConfig; it dropping
                    // means the balancer is gone.
                    if changed.is_err() {
                        return;
                    }
                    period = *period_rx.borrow_and_update();
                    info!(period_secs = period.as_secs(), "health check period updated");
                    interval = time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
        }
    }

    /// Probe every backend currently in the pool and update its
    /// liveness flag. No lock is held during probing.
    pub async fn sweep(&self) {
        debug!("running health checks");
        for backend in self.pool.snapshot() {
            let alive = probe(&backend.url).await;
            backend.set_alive(alive);
            let status = if alive { "up" } else { "down" };
            debug!(
                backend = %backend.url,
                status,
                active = backend.active_count(),
                "health check",
            );
        }
        debug!("health checks completed");
    }
}

/// Check reachability of a backend with a bounded TCP connect
pub(crate) async fn probe(url: &Url) -> bool {
    let host = match url.host_str() {
        Some(host) => host,
        None => return false,
    };
    let port = match url.port_or_known_default() {
        Some(port) => port,
        None => return false,
    };
    let addr = format!("{}:{}", host, port);

    match time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!(backend = %url, error = %e, "backend unreachable");
            false
        }
        Err(_) => {
            warn!(backend = %url, "health probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::backend::Backend;
    use crate::proxy::{proxy_client, Forwarder};
    use tokio::net::TcpListener;

    async fn listening_backend() -> (Arc<Backend>, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = Url::parse(&format!("http://{}", addr)).unwrap();
        let forwarder = Forwarder::new(proxy_client(), url.clone());
        (Arc::new(Backend::new(url, forwarder)), listener)
    }

    /// An address nothing is listening on
    async fn vacant_backend() -> Arc<Backend> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{}", addr)).unwrap();
        let forwarder = Forwarder::new(proxy_client(), url.clone());
        Arc::new(Backend::new(url, forwarder))
    }

    #[tokio::test]
    async fn test_probe_reachable() {
        let (backend, _listener) = listening_backend().await;
        assert!(probe(&backend.url).await);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let backend = vacant_backend().await;
        assert!(!probe(&backend.url).await);
    }

    #[tokio::test]
    async fn test_sweep_updates_liveness() {
        let pool = Arc::new(ServerPool::new());
        let (up, _listener) = listening_backend().await;
        let down = vacant_backend().await;
        pool.register(Arc::clone(&up));
        pool.register(Arc::clone(&down));

        // Start from the wrong flags so the sweep has to flip both
        up.set_alive(false);
        assert!(down.is_alive());

        let (_tx, rx) = watch::channel(Duration::from_secs(60));
        let checker = HealthChecker::new(pool, rx);
        checker.sweep().await;

        assert!(up.is_alive());
        assert!(!down.is_alive());
    }

    #[tokio::test]
    async fn test_revival_after_restart() {
        let pool = Arc::new(ServerPool::new());
        let down = vacant_backend().await;
        pool.register(Arc::clone(&down));

        let (_tx, rx) = watch::channel(Duration::from_secs(60));
        let checker = HealthChecker::new(Arc::clone(&pool), rx);

        checker.sweep().await;
        assert!(!down.is_alive());
        assert!(pool.select_next().is_none());

        // Bring a listener up on the backend's address
        let addr = format!(
            "{}:{}",
            down.url.host_str().unwrap(),
            down.url.port().unwrap()
        );
        let _listener = TcpListener::bind(&addr).await.unwrap();

        checker.sweep().await;
        assert!(down.is_alive());
        assert!(pool.select_next().is_some());
    }

    #[tokio::test]
    async fn test_reconfigured_period_takes_effect() {
        let pool = Arc::new(ServerPool::new());
        let down = vacant_backend().await;
        pool.register(Arc::clone(&down));

        // Start with a period far beyond the test's lifetime, then
        // shrink it and expect a sweep soon after.
        let (tx, rx) = watch::channel(Duration::from_secs(3600));
        let handle = HealthChecker::new(pool, rx).start();

        tx.send_replace(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!down.is_alive());
        handle.abort();
    }
}
