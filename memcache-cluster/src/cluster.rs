//! Request dispatch over the registered nodes.
//!
//! The cluster asks its locator for candidate nodes and sends a request to
//! as many of them as it has copies (`replicas() + 1`). Copies that find no
//! live node are resolved through `fail()`, so the redundancy aggregator of
//! the request still sees one answer per copy.
//!
//! Membership changes come from whoever owns the topology (static
//! configuration, a Couchbase config stream) through [`Cluster::node_added`],
//! [`Cluster::node_removed`] and [`Cluster::update_vbucket_map`].

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, SaslPlainAuthenticator};
use crate::config::{ClusterConfig, LocatorKind, NodeConfig};
use crate::error::{Error, Result};
use crate::locator::{Locator, NodeLocator};
use crate::node::Node;
use crate::request::MemcacheRequest;

pub type NodeFactory =
    Box<dyn Fn(SocketAddr, &NodeConfig, Option<Arc<dyn Authenticator>>) -> Arc<Node> + Send + Sync>;

pub struct Cluster {
    config: ClusterConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    nodes: RwLock<Vec<Arc<Node>>>,
    locator: Locator<Node>,
    factory: NodeFactory,
}

impl Cluster {
    /// Builds an empty cluster. No connection is opened until nodes are added.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let authenticator = config.credentials.clone().map(|credentials| {
            Arc::new(SaslPlainAuthenticator::new(credentials)) as Arc<dyn Authenticator>
        });

        Ok(Self {
            locator: Locator::new(config.locator),
            config,
            authenticator,
            nodes: RwLock::new(Vec::new()),
            factory: Box::new(Node::new),
        })
    }

    /// Builds a cluster and registers every configured server.
    pub fn connect(config: ClusterConfig) -> Result<Self> {
        let cluster = Self::new(config)?;
        for endpoint in cluster.config.servers.clone() {
            cluster.add_server(endpoint);
        }
        Ok(cluster)
    }

    pub fn with_node_factory(mut self, factory: NodeFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().unwrap().clone()
    }

    pub fn node(&self, endpoint: SocketAddr) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .find(|node| node.endpoint() == endpoint)
            .cloned()
    }

    /// Creates a node for `endpoint` through the node factory and registers it.
    pub fn add_server(&self, endpoint: SocketAddr) -> Arc<Node> {
        if let Some(existing) = self.node(endpoint) {
            return existing;
        }
        let node = (self.factory)(endpoint, &self.config.node, self.authenticator.clone());
        self.node_added(Arc::clone(&node));
        node
    }

    /// Registers `node`, starts connecting it and rebuilds the locator.
    pub fn node_added(&self, node: Arc<Node>) {
        let snapshot = {
            let mut nodes = self.nodes.write().unwrap();
            if nodes.iter().any(|known| known.endpoint() == node.endpoint()) {
                warn!(endpoint = %node.endpoint(), "node already registered");
                return;
            }
            node.plan_to_connect();
            nodes.push(Arc::clone(&node));
            nodes.clone()
        };
        self.locator.initialize(snapshot);
        info!(endpoint = %node.endpoint(), "node added");
    }

    /// Unregisters the node at `endpoint` and shuts it down.
    pub async fn node_removed(&self, endpoint: SocketAddr) -> bool {
        let (removed, snapshot) = {
            let mut nodes = self.nodes.write().unwrap();
            let Some(position) = nodes.iter().position(|node| node.endpoint() == endpoint) else {
                return false;
            };
            (nodes.remove(position), nodes.clone())
        };
        self.locator.initialize(snapshot);
        info!(%endpoint, "node removed");
        removed.shutdown().await;
        true
    }

    /// Installs a vBucket table whose indices refer to `endpoints`.
    ///
    /// Unknown endpoints are registered first. Table entries follow their
    /// server, not its position in the node list, across later membership
    /// changes.
    pub fn update_vbucket_map(&self, endpoints: &[SocketAddr], table: Vec<Vec<i32>>) -> Result<()> {
        if self.locator.kind() != LocatorKind::VBucket {
            return Err(Error::Argument(format!(
                "{:?} locator has no vbucket map",
                self.locator.kind()
            )));
        }
        let ordered: Vec<_> = endpoints.iter().map(|endpoint| self.add_server(*endpoint)).collect();
        self.locator.update_vbucket_map(ordered, table)?;
        info!(nodes = endpoints.len(), "vbucket map updated");
        Ok(())
    }

    /// Sends `request` to its located nodes and returns how many accepted it.
    ///
    /// Every copy that could not be sent is resolved through `fail()`. A
    /// request that cannot be serialized is rejected with
    /// [`Error::Argument`] before any node sees it, and its callback is not
    /// called.
    pub async fn send(&self, request: Arc<dyn MemcacheRequest>) -> Result<usize> {
        request.query_buffer()?;

        let copies = request.replicas() + 1;
        let timeout = self.config.send_timeout();
        let mut sent = 0;

        let candidates = self.locator.locate(request.as_ref());
        for node in candidates {
            if sent == copies {
                break;
            }
            match node.try_send(Arc::clone(&request), timeout).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    debug!(endpoint = %node.endpoint(), error = %err, "node refused request");
                }
            }
        }

        if sent < copies {
            warn!(
                opcode = ?request.opcode(),
                sent,
                copies,
                "not enough live nodes for request"
            );
            for _ in sent..copies {
                request.fail();
            }
        }
        Ok(sent)
    }

    /// Waits until every registered node has a working transport.
    pub async fn wait_until_alive(&self, timeout: Duration) -> bool {
        let nodes = self.nodes();
        join_all(nodes.iter().map(|node| node.wait_until_alive(timeout)))
            .await
            .into_iter()
            .all(|alive| alive)
    }

    pub async fn shutdown(&self) {
        let nodes = std::mem::take(&mut *self.nodes.write().unwrap());
        self.locator.initialize(Vec::new());
        join_all(nodes.iter().map(|node| node.shutdown())).await;
    }
}
