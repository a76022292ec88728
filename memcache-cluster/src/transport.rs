//! One TCP connection to a cache node.
//!
//! A transport owns its socket and a FIFO of in-flight requests. Two flows
//! share it:
//!
//! - **Send path** (`try_send`, driven by callers): reserves a pending slot,
//!   enqueues the request and writes its buffer while holding the write
//!   lock, so queue order always equals wire order.
//! - **Receive path** (one tokio task per connection): decodes response
//!   frames and matches each against the oldest pending request by opaque.
//!   Matching is positional, so any mismatch means the stream is out of
//!   sync and the connection is torn down.
//!
//! Any fatal error resolves every pending request through `fail()`, drops
//! the socket, tells the owning node, and schedules a reconnect after
//! `dead_retry_interval`. Connection attempts, authentication and
//! reconnects all run in background tasks.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::{select, time};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthenticationToken, Authenticator};
use crate::codec::{Response, ResponseCodec, Status};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::request::MemcacheRequest;

type Frames = FramedRead<OwnedReadHalf, ResponseCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Authenticating,
    Alive,
    ShuttingDown,
}

/// Receives liveness changes of the transports in a pool.
///
/// `transport_dead` is only reported for connections that were reported
/// alive before, so the two calls always pair up. Both are made while the
/// transport holds its state lock: observers must not call back into the
/// transport that reports.
pub trait TransportObserver: Send + Sync {
    fn transport_alive(&self, index: usize);
    fn transport_dead(&self, index: usize, error: &Error);
}

struct Link {
    state: TransportState,
    generation: u64,
    reported_alive: bool,
    /// Cancels the receive loop of the current socket.
    connection: Option<CancellationToken>,
}

pub struct Transport {
    index: usize,
    endpoint: SocketAddr,
    config: TransportConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    observer: Weak<dyn TransportObserver>,
    link: Mutex<Link>,
    pending: Mutex<VecDeque<Arc<dyn MemcacheRequest>>>,
    slots: Semaphore,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl Transport {
    /// Creates a disconnected transport. Nothing happens on the network
    /// until [`Transport::plan_to_connect`].
    pub fn new(
        index: usize,
        endpoint: SocketAddr,
        config: TransportConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
        observer: Weak<dyn TransportObserver>,
    ) -> Arc<Self> {
        let slots = Semaphore::new(config.queue_length);
        Arc::new(Self {
            index,
            endpoint,
            config,
            authenticator,
            observer,
            link: Mutex::new(Link {
                state: TransportState::Disconnected,
                generation: 0,
                reported_alive: false,
                connection: None,
            }),
            pending: Mutex::new(VecDeque::new()),
            slots,
            writer: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> TransportState {
        self.link.lock().unwrap().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() == TransportState::Alive
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Starts connecting in the background.
    pub fn plan_to_connect(self: &Arc<Self>) {
        self.spawn_connect(false);
    }

    /// Enqueues `request` and writes it to the socket.
    ///
    /// Fails fast with [`Error::NotConnected`] unless the transport is alive
    /// and with [`Error::QueueFull`] when no pending slot frees up within the
    /// queue timeout. Once this returns `Ok`, the request is guaranteed to be
    /// resolved by either its response or `fail()`.
    pub async fn try_send(self: &Arc<Self>, request: Arc<dyn MemcacheRequest>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::NotConnected);
        }
        let buffer = request.query_buffer()?;

        let permit = if self.config.queue_timeout_ms == 0 {
            self.slots.try_acquire().map_err(|_| Error::QueueFull)?
        } else {
            time::timeout(self.config.queue_timeout(), self.slots.acquire())
                .await
                .map_err(|_| Error::QueueFull)?
                .map_err(|_| Error::NotConnected)?
        };

        let mut writer = self.writer.lock().await;
        let generation = self.link.lock().unwrap().generation;
        let Some(stream) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };

        permit.forget();
        self.pending.lock().unwrap().push_back(Arc::clone(&request));
        debug!(endpoint = %self.endpoint, opcode = ?request.opcode(), opaque = request.opaque(), "request sent");

        if let Err(err) = stream.write_all(&buffer).await {
            drop(writer);
            self.fail_connection(generation, Error::Io(err)).await;
        }
        Ok(())
    }

    /// Stops accepting requests, lets pending ones drain for a bounded time,
    /// then closes the connection and stops reconnecting.
    pub async fn shutdown(self: &Arc<Self>) {
        self.link.lock().unwrap().state = TransportState::ShuttingDown;

        for _ in 0..self.config.shutdown_poll_attempts {
            if self.pending_count() == 0 {
                break;
            }
            time::sleep(self.config.shutdown_poll_interval()).await;
        }

        self.cancel.cancel();
        let generation = self.link.lock().unwrap().generation;
        self.fail_connection(generation, Error::ShuttingDown).await;
        self.slots.close();
        // Requests that raced with the shutdown and never had a connection.
        self.fail_pending();
        info!(endpoint = %self.endpoint, transport = self.index, "transport shut down");
    }

    fn spawn_connect(self: &Arc<Self>, delayed: bool) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.connect_loop(delayed).await;
        });
    }

    async fn connect_loop(self: Arc<Self>, mut delayed: bool) {
        loop {
            if delayed {
                select! {
                    _ = self.cancel.cancelled() => return,
                    _ = time::sleep(self.config.dead_retry_interval()) => {}
                }
            }

            let generation = {
                let mut link = self.link.lock().unwrap();
                if link.state == TransportState::ShuttingDown || link.connection.is_some() {
                    return;
                }
                link.state = TransportState::Connecting;
                link.generation += 1;
                link.generation
            };

            match self.establish(generation).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(endpoint = %self.endpoint, transport = self.index, error = %err, "connection attempt failed");
                    let mut link = self.link.lock().unwrap();
                    if link.generation == generation && link.state != TransportState::ShuttingDown {
                        link.state = TransportState::Disconnected;
                    }
                    delayed = true;
                }
            }
        }
    }

    async fn establish(self: &Arc<Self>, generation: u64) -> Result<()> {
        let stream = time::timeout(self.config.connect_timeout(), TcpStream::connect(self.endpoint))
            .await
            .map_err(|_| Error::Connect(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(Error::Connect)?;
        stream.set_nodelay(true)?;

        let (reader, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, ResponseCodec);

        if let Some(authenticator) = &self.authenticator {
            self.set_state(generation, TransportState::Authenticating)?;
            let token = authenticator.create_token();
            time::timeout(
                self.config.connect_timeout(),
                authenticate(token, &mut frames, &mut writer),
            )
            .await
            .map_err(|_| Error::Connect(io::Error::new(io::ErrorKind::TimedOut, "authentication timed out")))??;
        }

        *self.writer.lock().await = Some(writer);

        // Liveness reports go out under the link lock so that the observer
        // never sees the teardown of a connection before its alive report.
        let connection = {
            let mut link = self.link.lock().unwrap();
            if link.generation == generation && link.state != TransportState::ShuttingDown {
                let connection = self.cancel.child_token();
                link.state = TransportState::Alive;
                link.reported_alive = true;
                link.connection = Some(connection.clone());
                if let Some(observer) = self.observer.upgrade() {
                    observer.transport_alive(self.index);
                }
                Some(connection)
            } else {
                None
            }
        };
        let Some(connection) = connection else {
            self.writer.lock().await.take();
            return Err(Error::ShuttingDown);
        };

        info!(endpoint = %self.endpoint, transport = self.index, "transport connected");
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.receive_loop(frames, connection, generation).await;
        });
        Ok(())
    }

    fn set_state(&self, generation: u64, state: TransportState) -> Result<()> {
        let mut link = self.link.lock().unwrap();
        if link.generation != generation || link.state == TransportState::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        link.state = state;
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, mut frames: Frames, connection: CancellationToken, generation: u64) {
        let err = loop {
            select! {
                _ = connection.cancelled() => return,
                frame = frames.next() => match frame {
                    Some(Ok(response)) => {
                        if let Err(err) = self.dispatch(response) {
                            break err;
                        }
                    }
                    Some(Err(err)) => break err,
                    None => break Error::ConnectionClosed,
                }
            }
        };
        self.fail_connection(generation, err).await;
    }

    /// Routes one response to the oldest pending request.
    fn dispatch(&self, response: Response) -> Result<()> {
        let (request, finished) = {
            let mut pending = self.pending.lock().unwrap();
            let Some(front) = pending.front() else {
                return Err(Error::Correlation {
                    expected: None,
                    actual: response.opaque(),
                });
            };
            if front.opaque() != response.opaque() {
                return Err(Error::Correlation {
                    expected: Some(front.opaque()),
                    actual: response.opaque(),
                });
            }

            if front.expects_more(&response) {
                (Arc::clone(front), false)
            } else {
                let Some(request) = pending.pop_front() else {
                    unreachable!("front was checked under the same lock");
                };
                self.slots.add_permits(1);
                (request, true)
            }
        };

        if let Err(err) = request.handle_response(&response) {
            if finished {
                request.fail();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Tears down the connection of `generation`, if it is still the current one.
    async fn fail_connection(self: &Arc<Self>, generation: u64, err: Error) {
        let reconnect = {
            let mut link = self.link.lock().unwrap();
            if link.generation != generation {
                return;
            }
            let Some(connection) = link.connection.take() else {
                return;
            };
            connection.cancel();
            let reconnect = link.state != TransportState::ShuttingDown;
            if reconnect {
                link.state = TransportState::Disconnected;
            }
            let was_alive = std::mem::take(&mut link.reported_alive);
            if was_alive {
                if let Some(observer) = self.observer.upgrade() {
                    observer.transport_dead(self.index, &err);
                }
            }
            reconnect
        };

        if matches!(err, Error::ShuttingDown) {
            debug!(endpoint = %self.endpoint, transport = self.index, "closing connection");
        } else {
            warn!(endpoint = %self.endpoint, transport = self.index, error = %err, "transport failed");
        }

        self.writer.lock().await.take();
        self.fail_pending();

        if reconnect {
            self.spawn_connect(true);
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        self.slots.add_permits(drained.len());
        debug!(endpoint = %self.endpoint, count = drained.len(), "failing pending requests");
        for request in drained {
            request.fail();
        }
    }
}

async fn authenticate(
    mut token: Box<dyn AuthenticationToken>,
    frames: &mut Frames,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    let mut answer: Option<Response> = None;
    loop {
        let (status, step) = token.step_authenticate(answer.as_ref());
        let request = match (status, step) {
            (Status::NoError, _) => return Ok(()),
            (Status::StepRequired, Some(request)) => request,
            (status, _) => return Err(Error::Authentication(status)),
        };

        writer.write_all(&request.query_buffer()?).await?;
        let response = frames.next().await.ok_or(Error::ConnectionClosed)??;
        if response.opaque() != request.opaque() {
            return Err(Error::Correlation {
                expected: Some(request.opaque()),
                actual: response.opaque(),
            });
        }
        request.handle_response(&response)?;
        answer = Some(response);
    }
}
