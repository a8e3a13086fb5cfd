use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Mutex;
use url::Url;
use uuid::Uuid;

use crate::proxy::Forwarder;

/// A single upstream target: destination URL, liveness flag, the set of
/// in-flight request tokens, and the forwarder wired to it at
/// registration.
///
/// The token set and the heap index are mutated only through
/// [`ServerPool`](super::ServerPool) operations, under the pool lock.
/// The liveness flag is flipped by the health checker at any time.
#[derive(Debug)]
pub struct Backend {
    /// Absolute upstream URL
    pub url: Url,

    /// Probed reachability; governs selection eligibility
    alive: AtomicBool,

    /// Tokens of requests currently in flight on this backend
    active: Mutex<HashSet<Uuid>>,

    /// Position in the pool's heap array; -1 when not pooled
    index: AtomicIsize,

    /// Reverse-proxy handle configured for `url`
    pub(crate) forwarder: Forwarder,
}

impl Backend {
    /// Create a new backend, alive and unpooled
    pub fn new(url: Url, forwarder: Forwarder) -> Self {
        Self {
            url,
            alive: AtomicBool::new(true),
            active: Mutex::new(HashSet::new()),
            index: AtomicIsize::new(-1),
            forwarder,
        }
    }

    /// Record an in-flight request token. Idempotent for a token
    /// already present.
    pub fn attach(&self, token: Uuid) {
        self.active.lock().unwrap().insert(token);
    }

    /// Remove a request token if present
    pub fn detach(&self, token: Uuid) {
        self.active.lock().unwrap().remove(&token);
    }

    /// Current number of in-flight requests
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Heap position, or -1 when the backend is not in a pool
    pub(crate) fn index(&self) -> isize {
        self.index.load(Ordering::Relaxed)
    }

    // Written only while the pool lock is held.
    pub(crate) fn set_index(&self, index: isize) {
        self.index.store(index, Ordering::Relaxed);
    }
}
