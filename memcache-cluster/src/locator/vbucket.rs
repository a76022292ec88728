use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::locator::{NodeIter, NodeLocator, RoutableNode};
use crate::request::MemcacheRequest;

/// vBucket id of `key` in a table of `len` entries (a power of two).
pub fn vbucket_of(key: &[u8], len: usize) -> u16 {
    let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
    (hash as usize & (len - 1)) as u16
}

struct VBucketMap<N> {
    /// Servers the table indices refer to.
    endpoints: Vec<SocketAddr>,
    /// `endpoints` resolved against the registered nodes; `None` once a
    /// server is no longer registered.
    nodes: Vec<Option<Arc<N>>>,
    /// Per vBucket: node indices, primary first. Negative means unassigned.
    table: Vec<Vec<i32>>,
}

impl<N: RoutableNode> VBucketMap<N> {
    fn resolve(endpoints: Vec<SocketAddr>, registered: &[Arc<N>], table: Vec<Vec<i32>>) -> Self {
        let nodes = endpoints
            .iter()
            .map(|endpoint| {
                registered
                    .iter()
                    .find(|node| node.endpoint() == *endpoint)
                    .cloned()
            })
            .collect();
        Self {
            endpoints,
            nodes,
            table,
        }
    }
}

/// Routes keys through a Couchbase vBucket table and stamps the vBucket id
/// into the request.
pub struct VBucketLocator<N> {
    map: RwLock<Arc<VBucketMap<N>>>,
}

impl<N: RoutableNode> VBucketLocator<N> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(Arc::new(VBucketMap {
                endpoints: Vec::new(),
                nodes: Vec::new(),
                table: Vec::new(),
            })),
        }
    }

    /// Replaces nodes and table together. `table` indices refer to `nodes`.
    pub fn update_map(&self, nodes: Vec<Arc<N>>, table: Vec<Vec<i32>>) -> Result<()> {
        if !table.len().is_power_of_two() || table.len() > usize::from(u16::MAX) + 1 {
            return Err(Error::Argument(format!(
                "vbucket table length {} is not a power of two up to 65536",
                table.len()
            )));
        }
        let endpoints = nodes.iter().map(|node| node.endpoint()).collect();
        *self.map.write().unwrap() = Arc::new(VBucketMap::resolve(endpoints, &nodes, table));
        Ok(())
    }
}

impl<N: RoutableNode> Default for VBucketLocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: RoutableNode> NodeLocator<N> for VBucketLocator<N> {
    /// Keeps the current table and re-resolves its servers against `nodes`.
    /// Entries whose server is gone route nowhere until the next map update.
    fn initialize(&self, nodes: Vec<Arc<N>>) {
        let mut map = self.map.write().unwrap();
        let resolved = VBucketMap::resolve(map.endpoints.clone(), &nodes, map.table.clone());
        *map = Arc::new(resolved);
    }

    fn locate(&self, request: &dyn MemcacheRequest) -> NodeIter<N> {
        let map = Arc::clone(&self.map.read().unwrap());
        if map.table.is_empty() {
            return Box::new(std::iter::empty());
        }

        let vbucket = vbucket_of(request.key(), map.table.len());
        request.set_vbucket(vbucket);

        let entries = map.table[usize::from(vbucket)].clone();
        let mut seen = Vec::with_capacity(entries.len());
        Box::new(entries.into_iter().filter_map(move |entry| {
            let index = usize::try_from(entry).ok().filter(|index| *index < map.nodes.len())?;
            if seen.contains(&index) {
                return None;
            }
            seen.push(index);
            let node = map.nodes[index].as_ref()?;
            node.is_alive().then(|| Arc::clone(node))
        }))
    }
}
