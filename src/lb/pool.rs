use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::backend::Backend;

/// Concurrency-safe collection of backends, kept as a binary min-heap
/// ordered by in-flight request count.
///
/// A single mutex guards the heap array together with every token-set
/// and heap-index update performed through the pool. Lock hold times are
/// bounded to in-memory work; forwarding, probing, and retry sleeps all
/// happen outside the lock. Each operation finishes with the heap
/// property restored and `nodes[i].index() == i` for all `i`.
#[derive(Debug, Default)]
pub struct ServerPool {
    nodes: Mutex<Vec<Arc<Backend>>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Add a backend to the pool. The backend must not already be in a
    /// pool.
    pub fn register(&self, backend: Arc<Backend>) {
        let mut nodes = self.nodes.lock().unwrap();
        debug_assert_eq!(backend.index(), -1);
        push(&mut nodes, backend);
    }

    /// Remove every backend whose URL equals `url`. Returns the number
    /// removed; unknown URLs remove nothing.
    ///
    /// Requests still in flight on a removed backend run to completion;
    /// the backend is simply no longer selectable or health-checked.
    pub fn deregister(&self, url: &Url) -> usize {
        let mut nodes = self.nodes.lock().unwrap();
        let mut removed = 0;
        while let Some(i) = nodes.iter().position(|b| b.url == *url) {
            remove(&mut nodes, i);
            removed += 1;
        }
        removed
    }

    /// Return the live backend with the fewest in-flight requests, or
    /// `None` when the pool holds no live backend.
    ///
    /// Dead backends popped along the way are re-inserted before
    /// returning, in every path, so the next health sweep can revive
    /// them.
    pub fn select_next(&self) -> Option<Arc<Backend>> {
        let mut nodes = self.nodes.lock().unwrap();
        let mut parked = Vec::new();
        let mut selected = None;

        while let Some(backend) = pop(&mut nodes) {
            if backend.is_alive() {
                selected = Some(backend);
                break;
            }
            parked.push(backend);
        }

        if selected.is_none() && !parked.is_empty() {
            debug!("no live backend in pool");
        }

        if let Some(ref backend) = selected {
            push(&mut nodes, Arc::clone(backend));
        }
        for dead in parked {
            push(&mut nodes, dead);
        }

        selected
    }

    /// Record the start of a request on `backend` and restore heap
    /// order. Returns the minted token.
    ///
    /// A completion watcher is spawned that awaits `done` (resolved by
    /// response completion or client disconnect), then detaches the
    /// token under the pool lock. When the backend was deregistered in
    /// the meantime its index is -1 and the heap fix is skipped.
    pub fn attach(self: &Arc<Self>, backend: &Arc<Backend>, done: oneshot::Receiver<()>) -> Uuid {
        let token = Uuid::new_v4();

        {
            let mut nodes = self.nodes.lock().unwrap();
            backend.attach(token);
            let idx = backend.index();
            if idx >= 0 {
                fix(&mut nodes, idx as usize);
            }
        }

        let pool = Arc::clone(self);
        let backend = Arc::clone(backend);
        tokio::spawn(async move {
            // Resolves on explicit completion or when the sender drops
            // with the request future.
            let _ = done.await;

            let mut nodes = pool.nodes.lock().unwrap();
            backend.detach(token);
            let idx = backend.index();
            if idx >= 0 {
                fix(&mut nodes, idx as usize);
            }
        });

        token
    }

    /// Copy of the current membership, for the health sweep. The lock is
    /// released before any probing happens.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.nodes.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }
}

fn swap_nodes(nodes: &mut [Arc<Backend>], i: usize, j: usize) {
    nodes.swap(i, j);
    nodes[i].set_index(i as isize);
    nodes[j].set_index(j as isize);
}

fn sift_up(nodes: &mut [Arc<Backend>], mut i: usize) {
    while i > 0 {
        let parent = (i - 1) / 2;
        if nodes[i].active_count() >= nodes[parent].active_count() {
            break;
        }
        swap_nodes(nodes, i, parent);
        i = parent;
    }
}

/// Returns true when the node moved.
fn sift_down(nodes: &mut [Arc<Backend>], mut i: usize) -> bool {
    let start = i;
    let len = nodes.len();
    loop {
        let left = 2 * i + 1;
        if left >= len {
            break;
        }
        let right = left + 1;
        let mut child = left;
        if right < len && nodes[right].active_count() < nodes[left].active_count() {
            child = right;
        }
        if nodes[child].active_count() >= nodes[i].active_count() {
            break;
        }
        swap_nodes(nodes, i, child);
        i = child;
    }
    i != start
}

/// Restore heap order at position `i` after its key changed
fn fix(nodes: &mut [Arc<Backend>], i: usize) {
    if !sift_down(nodes, i) {
        sift_up(nodes, i);
    }
}

fn push(nodes: &mut Vec<Arc<Backend>>, backend: Arc<Backend>) {
    let i = nodes.len();
    backend.set_index(i as isize);
    nodes.push(backend);
    sift_up(nodes, i);
}

fn pop(nodes: &mut Vec<Arc<Backend>>) -> Option<Arc<Backend>> {
    if nodes.is_empty() {
        return None;
    }
    let last = nodes.len() - 1;
    swap_nodes(nodes, 0, last);
    let node = nodes.pop().unwrap();
    node.set_index(-1);
    if !nodes.is_empty() {
        sift_down(nodes, 0);
    }
    Some(node)
}

fn remove(nodes: &mut Vec<Arc<Backend>>, i: usize) -> Arc<Backend> {
    let last = nodes.len() - 1;
    swap_nodes(nodes, i, last);
    let node = nodes.pop().unwrap();
    node.set_index(-1);
    if i < nodes.len() {
        fix(nodes, i);
    }
    node
}
