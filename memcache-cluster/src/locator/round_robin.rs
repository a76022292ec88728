use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::locator::{NodeIter, NodeLocator, RoutableNode};
use crate::request::MemcacheRequest;

/// Ignores the key and starts each lookup one node further than the last.
pub struct RoundRobinLocator<N> {
    nodes: RwLock<Arc<Vec<Arc<N>>>>,
    cursor: AtomicUsize,
}

impl<N> RoundRobinLocator<N> {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl<N> Default for RoundRobinLocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: RoutableNode> NodeLocator<N> for RoundRobinLocator<N> {
    fn initialize(&self, nodes: Vec<Arc<N>>) {
        *self.nodes.write().unwrap() = Arc::new(nodes);
    }

    fn locate(&self, _request: &dyn MemcacheRequest) -> NodeIter<N> {
        let nodes = Arc::clone(&self.nodes.read().unwrap());
        let len = nodes.len();
        if len == 0 {
            return Box::new(std::iter::empty());
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        Box::new((0..len).filter_map(move |offset| {
            let node = &nodes[(start + offset) % len];
            node.is_alive().then(|| Arc::clone(node))
        }))
    }
}
