//! A cache server reached through a pool of transports.
//!
//! Transports that can take a request wait in a ready queue. A sender takes
//! one out, hands it the request and puts it back, so concurrent senders
//! spread over the pool. A transport is put back only while it is alive;
//! after a reconnect it re-enters the queue on its own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::locator::RoutableNode;
use crate::request::MemcacheRequest;
use crate::transport::{Transport, TransportObserver};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The first transport of the node came up.
    Alive(SocketAddr),
    /// The last working transport of the node went down.
    Dead(SocketAddr),
    TransportError {
        endpoint: SocketAddr,
        transport: usize,
        error: String,
    },
}

pub struct Node {
    endpoint: SocketAddr,
    transports: Vec<Arc<Transport>>,
    ready_tx: flume::Sender<usize>,
    ready_rx: flume::Receiver<usize>,
    queued: Vec<AtomicBool>,
    working: watch::Sender<usize>,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(
        endpoint: SocketAddr,
        config: &NodeConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = flume::unbounded();
        let (working, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|weak: &Weak<Node>| {
            let observer: Weak<dyn TransportObserver> = weak.clone();
            let transports = (0..config.pool_size)
                .map(|index| {
                    Transport::new(
                        index,
                        endpoint,
                        config.transport.clone(),
                        authenticator.clone(),
                        observer.clone(),
                    )
                })
                .collect();

            Node {
                endpoint,
                transports,
                ready_tx,
                ready_rx,
                queued: (0..config.pool_size).map(|_| AtomicBool::new(false)).collect(),
                working,
                events,
                cancel: CancellationToken::new(),
            }
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn transports(&self) -> &[Arc<Transport>] {
        &self.transports
    }

    /// Starts connecting every transport of the pool.
    pub fn plan_to_connect(&self) {
        for transport in &self.transports {
            transport.plan_to_connect();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.working_transports() > 0
    }

    pub fn working_transports(&self) -> usize {
        *self.working.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Waits for the first working transport. Returns `false` on timeout.
    pub async fn wait_until_alive(&self, timeout: Duration) -> bool {
        let mut working = self.working.subscribe();
        let alive = matches!(
            time::timeout(timeout, working.wait_for(|count| *count > 0)).await,
            Ok(Ok(_))
        );
        alive
    }

    /// Sends `request` through one transport of the pool.
    ///
    /// Waits at most `timeout` for a ready transport and tries each
    /// transport at most once. Fails with the error of the last transport
    /// tried, [`Error::Timeout`] if none became ready, or
    /// [`Error::ShuttingDown`] once the node is shut down.
    pub async fn try_send(&self, request: Arc<dyn MemcacheRequest>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut tried = vec![false; self.transports.len()];
        let mut attempts = 0;
        let mut last_error = None;

        let outcome = loop {
            if attempts == self.transports.len() {
                break Err(last_error.unwrap_or(Error::Timeout));
            }

            let index = tokio::select! {
                _ = self.cancel.cancelled() => break Err(Error::ShuttingDown),
                taken = time::timeout_at(deadline, self.ready_rx.recv_async()) => match taken {
                    Ok(Ok(index)) => index,
                    Ok(Err(_)) => break Err(Error::ShuttingDown),
                    Err(_) => break Err(last_error.unwrap_or(Error::Timeout)),
                },
            };
            self.queued[index].store(false, Ordering::Release);

            let transport = &self.transports[index];
            // Dead transports leave the queue here and come back on reconnect.
            if tried[index] || !transport.is_alive() {
                continue;
            }
            tried[index] = true;
            attempts += 1;

            match transport.try_send(Arc::clone(&request)).await {
                Ok(()) => break Ok(()),
                Err(err @ Error::Argument(_)) => break Err(err),
                Err(err) => {
                    debug!(endpoint = %self.endpoint, transport = index, error = %err, "transport refused request");
                    last_error = Some(err);
                }
            }
        };

        for (index, _) in tried.iter().enumerate().filter(|(_, tried)| **tried) {
            self.release(index);
        }
        outcome
    }

    /// Closes every transport. Senders blocked in `try_send` are released
    /// with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        join_all(self.transports.iter().map(|transport| transport.shutdown())).await;
        info!(endpoint = %self.endpoint, "node shut down");
    }

    /// Puts a live transport back into the ready queue.
    fn release(&self, index: usize) {
        if self.transports[index].is_alive() {
            self.enqueue(index);
        }
    }

    /// Queues `index` unless it is already there.
    fn enqueue(&self, index: usize) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !self.queued[index].swap(true, Ordering::AcqRel) {
            let _ = self.ready_tx.send(index);
        }
    }
}

impl TransportObserver for Node {
    fn transport_alive(&self, index: usize) {
        let mut first = false;
        self.working.send_modify(|count| {
            *count += 1;
            first = *count == 1;
        });
        // Called under the transport's state lock, which `release` would take.
        self.enqueue(index);

        if first {
            info!(endpoint = %self.endpoint, "node alive");
            let _ = self.events.send(NodeEvent::Alive(self.endpoint));
        }
    }

    fn transport_dead(&self, index: usize, error: &Error) {
        let _ = self.events.send(NodeEvent::TransportError {
            endpoint: self.endpoint,
            transport: index,
            error: error.to_string(),
        });

        let mut last = false;
        self.working.send_modify(|count| {
            last = *count == 1;
            *count = count.saturating_sub(1);
        });

        if last {
            warn!(endpoint = %self.endpoint, error = %error, "node dead");
            let _ = self.events.send(NodeEvent::Dead(self.endpoint));
        }
    }
}

impl RoutableNode for Node {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn is_alive(&self) -> bool {
        Node::is_alive(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::NoOpRequest;

    fn node(pool_size: usize) -> Arc<Node> {
        let config = NodeConfig {
            pool_size,
            ..NodeConfig::default()
        };
        Node::new("127.0.0.1:1".parse().unwrap(), &config, None)
    }

    #[test]
    fn liveness_follows_the_working_counter() {
        let node = node(2);
        let mut events = node.subscribe();

        node.transport_alive(0);
        node.transport_alive(1);
        assert_eq!(node.working_transports(), 2);
        assert_eq!(events.try_recv().unwrap(), NodeEvent::Alive(node.endpoint()));
        assert!(events.try_recv().is_err());

        node.transport_dead(0, &Error::ConnectionClosed);
        assert!(node.is_alive());
        node.transport_dead(1, &Error::ConnectionClosed);
        assert!(!node.is_alive());

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], NodeEvent::TransportError { transport: 0, .. }));
        assert_eq!(received[2], NodeEvent::Dead(node.endpoint()));
    }

    #[tokio::test]
    async fn send_times_out_without_ready_transports() {
        let node = node(1);
        let request = Arc::new(NoOpRequest::new(|_| {}));
        let err = node.try_send(request, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_senders() {
        let node = node(1);
        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let request = Arc::new(NoOpRequest::new(|_| {}));
                node.try_send(request, Duration::from_secs(10)).await
            })
        };
        time::sleep(Duration::from_millis(20)).await;
        node.shutdown().await;

        let outcome = time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(Error::ShuttingDown)));
    }
}
