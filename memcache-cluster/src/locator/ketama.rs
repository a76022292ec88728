//! Ketama consistent hashing.
//!
//! Every node owns 160 points on a 32-bit ring: 40 MD5 digests of
//! `"{endpoint}-{i}"`, each split into four little-endian words. A key
//! belongs to the node of the first point at or after its own hash.
//!
//! When that node is dead the key is rehashed with a numeric prefix
//! (`"{i}{key}"`, once per node) to spread the orphaned keys over the
//! survivors instead of piling them onto the clockwise neighbour. After
//! the first node the ring is walked clockwise, so a full iteration still
//! reaches every live node.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use md5::{Digest, Md5};

use crate::locator::{NodeIter, NodeLocator, RoutableNode};
use crate::request::MemcacheRequest;

const DIGESTS_PER_NODE: usize = 40;

/// 32-bit ring position of `data`: the first four digest bytes, little-endian.
pub fn ketama_hash(data: &[u8]) -> u32 {
    let digest = Md5::digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

struct Ring<N> {
    nodes: Vec<Arc<N>>,
    /// Sorted by position; the value is an index into `nodes`.
    points: Vec<(u32, usize)>,
}

impl<N: RoutableNode> Ring<N> {
    fn build(nodes: Vec<Arc<N>>) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * DIGESTS_PER_NODE * 4);
        for (index, node) in nodes.iter().enumerate() {
            let endpoint = node.endpoint();
            for i in 0..DIGESTS_PER_NODE {
                let digest = Md5::digest(format!("{endpoint}-{i}").as_bytes());
                for word in digest.chunks_exact(4) {
                    let point = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    points.push((point, index));
                }
            }
        }
        points.sort_unstable();
        Self { nodes, points }
    }

    /// Position of the first point at or after `hash`, wrapping to the start.
    fn position(&self, hash: u32) -> usize {
        let position = self.points.partition_point(|(point, _)| *point < hash);
        if position == self.points.len() {
            0
        } else {
            position
        }
    }

    fn owner(&self, position: usize) -> usize {
        self.points[position].1
    }
}

pub struct KetamaLocator<N> {
    ring: RwLock<Arc<Ring<N>>>,
}

impl<N> KetamaLocator<N> {
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(Arc::new(Ring {
                nodes: Vec::new(),
                points: Vec::new(),
            })),
        }
    }
}

impl<N> Default for KetamaLocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: RoutableNode> NodeLocator<N> for KetamaLocator<N> {
    fn initialize(&self, nodes: Vec<Arc<N>>) {
        let ring = Arc::new(Ring::build(nodes));
        *self.ring.write().unwrap() = ring;
    }

    fn locate(&self, request: &dyn MemcacheRequest) -> NodeIter<N> {
        let ring = Arc::clone(&self.ring.read().unwrap());
        if ring.points.is_empty() {
            return Box::new(std::iter::empty());
        }
        let yielded = vec![false; ring.nodes.len()];
        Box::new(RingWalk {
            ring,
            key: Bytes::copy_from_slice(request.key()),
            started: false,
            position: 0,
            steps: 0,
            yielded,
        })
    }
}

struct RingWalk<N> {
    ring: Arc<Ring<N>>,
    key: Bytes,
    started: bool,
    position: usize,
    steps: usize,
    yielded: Vec<bool>,
}

impl<N: RoutableNode> RingWalk<N> {
    /// Ring position of the first live owner of the key, if any.
    fn primary(&self) -> (usize, Option<usize>) {
        let home = self.ring.position(ketama_hash(&self.key));
        let owner = self.ring.owner(home);
        if self.ring.nodes[owner].is_alive() {
            return (home, Some(owner));
        }

        for i in 0..self.ring.nodes.len() {
            let mut salted = i.to_string().into_bytes();
            salted.extend_from_slice(&self.key);
            let position = self.ring.position(ketama_hash(&salted));
            let owner = self.ring.owner(position);
            if self.ring.nodes[owner].is_alive() {
                return (position, Some(owner));
            }
        }
        (home, None)
    }

    fn take(&mut self, index: usize) -> Arc<N> {
        self.yielded[index] = true;
        Arc::clone(&self.ring.nodes[index])
    }
}

impl<N: RoutableNode> Iterator for RingWalk<N> {
    type Item = Arc<N>;

    fn next(&mut self) -> Option<Arc<N>> {
        if !self.started {
            self.started = true;
            let (position, owner) = self.primary();
            self.position = position;
            if let Some(owner) = owner {
                return Some(self.take(owner));
            }
        }

        while self.steps < self.ring.points.len() {
            let owner = self.ring.owner(self.position);
            self.position = (self.position + 1) % self.ring.points.len();
            self.steps += 1;
            if !self.yielded[owner] && self.ring.nodes[owner].is_alive() {
                return Some(self.take(owner));
            }
        }
        None
    }
}
