//! Load balancing core
//!
//! # Components
//!
//! - [`Backend`]: a single upstream target with liveness and in-flight
//!   request tracking
//! - [`ServerPool`]: concurrency-safe min-heap of backends keyed by
//!   in-flight request count
//! - [`HealthChecker`]: periodic TCP-connect liveness probing with a
//!   runtime-reconfigurable period
//! - [`Dispatcher`]: backend selection plus the retry/attempt
//!   escalation for each client request
//! - [`LoadBalancer`]: facade wiring the above to the two listeners
//!
//! # Request flow
//!
//! A client request selects the live backend with the fewest in-flight
//! requests, attaches a tracking token, and forwards. A transport
//! failure retries the same backend up to `retries` times with a
//! configurable delay, then re-enters selection with an incremented
//! attempt count, up to `retries` reattempts; past that the client
//! receives 503. Tokens detach when the request finishes or the client
//! disconnects, keeping the heap ordering truthful.
//!
//! # Thread safety
//!
//! A single mutex guards the heap and all token/index updates; lock
//! hold times are bounded to in-memory work. Liveness flags are atomics
//! and runtime configuration is read lock-free, so the health checker
//! and control handlers never contend with forwarding I/O.

pub mod backend;
pub mod balancer;
pub mod dispatch;
pub mod health;
pub mod pool;

pub use backend::Backend;
pub use balancer::{LoadBalancer, RegisterError};
pub use dispatch::{Dispatcher, SERVICE_NOT_AVAILABLE};
pub use health::{HealthChecker, PROBE_TIMEOUT};
pub use pool::ServerPool;
