//! Key to node routing.
//!
//! - [`round_robin`]: keyless spreading over live nodes
//! - [`ketama`]: consistent hashing on an MD5 ring
//! - [`vbucket`]: Couchbase vBucket table lookup
//!
//! Locators keep an immutable snapshot of the node list behind a lock and
//! swap it wholesale on `initialize`. `locate` returns a lazy iterator over
//! the snapshot that checks liveness while it is walked, so a node that
//! comes back is used again without re-initializing.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::LocatorKind;
use crate::error::{Error, Result};
use crate::request::MemcacheRequest;

pub mod ketama;
pub mod round_robin;
pub mod vbucket;

pub use ketama::KetamaLocator;
pub use round_robin::RoundRobinLocator;
pub use vbucket::VBucketLocator;

/// What a locator needs to know about a node.
pub trait RoutableNode: Send + Sync + 'static {
    fn endpoint(&self) -> SocketAddr;
    fn is_alive(&self) -> bool;
}

pub type NodeIter<N> = Box<dyn Iterator<Item = Arc<N>> + Send>;

pub trait NodeLocator<N: RoutableNode>: Send + Sync {
    /// Replaces the node set.
    fn initialize(&self, nodes: Vec<Arc<N>>);

    /// Live nodes for `request`, primary first, each at most once.
    fn locate(&self, request: &dyn MemcacheRequest) -> NodeIter<N>;
}

pub enum Locator<N> {
    RoundRobin(RoundRobinLocator<N>),
    Ketama(KetamaLocator<N>),
    VBucket(VBucketLocator<N>),
}

impl<N: RoutableNode> Locator<N> {
    pub fn new(kind: LocatorKind) -> Self {
        match kind {
            LocatorKind::RoundRobin => Locator::RoundRobin(RoundRobinLocator::new()),
            LocatorKind::Ketama => Locator::Ketama(KetamaLocator::new()),
            LocatorKind::VBucket => Locator::VBucket(VBucketLocator::new()),
        }
    }

    pub fn kind(&self) -> LocatorKind {
        match self {
            Locator::RoundRobin(_) => LocatorKind::RoundRobin,
            Locator::Ketama(_) => LocatorKind::Ketama,
            Locator::VBucket(_) => LocatorKind::VBucket,
        }
    }

    /// Installs a new vBucket table. Only valid for the vBucket locator.
    pub fn update_vbucket_map(&self, nodes: Vec<Arc<N>>, table: Vec<Vec<i32>>) -> Result<()> {
        match self {
            Locator::VBucket(locator) => locator.update_map(nodes, table),
            other => Err(Error::Argument(format!(
                "{:?} locator has no vbucket map",
                other.kind()
            ))),
        }
    }
}

impl<N: RoutableNode> NodeLocator<N> for Locator<N> {
    fn initialize(&self, nodes: Vec<Arc<N>>) {
        match self {
            Locator::RoundRobin(locator) => locator.initialize(nodes),
            Locator::Ketama(locator) => locator.initialize(nodes),
            Locator::VBucket(locator) => locator.initialize(nodes),
        }
    }

    fn locate(&self, request: &dyn MemcacheRequest) -> NodeIter<N> {
        match self {
            Locator::RoundRobin(locator) => locator.locate(request),
            Locator::Ketama(locator) => locator.locate(request),
            Locator::VBucket(locator) => locator.locate(request),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::RoutableNode;

    pub(crate) struct FakeNode {
        endpoint: SocketAddr,
        alive: AtomicBool,
    }

    impl FakeNode {
        pub(crate) fn set_alive(&self, alive: bool) {
            self.alive.store(alive, Ordering::SeqCst);
        }
    }

    impl RoutableNode for FakeNode {
        fn endpoint(&self) -> SocketAddr {
            self.endpoint
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn nodes(count: usize) -> Vec<Arc<FakeNode>> {
        (0..count)
            .map(|i| {
                Arc::new(FakeNode {
                    endpoint: SocketAddr::from(([10, 0, 0, i as u8 + 1], 11211)),
                    alive: AtomicBool::new(true),
                })
            })
            .collect()
    }

    pub(crate) fn endpoints(nodes: impl Iterator<Item = Arc<FakeNode>>) -> Vec<SocketAddr> {
        nodes.map(|node| node.endpoint()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::nodes;
    use super::*;
    use crate::request::GetRequest;

    #[test]
    fn vbucket_map_is_rejected_by_other_locators() {
        let locator = Locator::new(LocatorKind::Ketama);
        let err = locator.update_vbucket_map(nodes(1), vec![vec![0]]).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn dispatches_to_the_configured_locator() {
        let locator = Locator::new(LocatorKind::RoundRobin);
        assert_eq!(locator.kind(), LocatorKind::RoundRobin);
        locator.initialize(nodes(3));
        let request = GetRequest::new("key", |_, _| {});
        assert_eq!(locator.locate(&request).count(), 3);
    }
}
