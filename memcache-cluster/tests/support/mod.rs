//! In-process memcached stand-in for integration tests.
//!
//! Speaks enough of the binary protocol for the client: get/gat, the three
//! store modes, delete, counters, noop, stat and SASL PLAIN, optionally
//! followed by one challenge step. Tests can hold responses back, corrupt
//! response opaques, or stop the server to simulate a crash.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use memcache_cluster::{
    codec::{HEADER_LEN, Opcode, RequestHeader, Response, ResponseHeader, Status, read_u32, read_u64},
    config::{NodeConfig, TransportConfig},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Required SASL PLAIN user and password.
    pub credentials: Option<(String, String)>,
    /// Answers a valid PLAIN start with `StepRequired` and this challenge.
    /// The client must then send a step carrying `challenge\0password`.
    pub challenge: Option<String>,
    /// Responses are only written after [`FakeServer::release`].
    pub hold_responses: bool,
}

#[derive(Debug, Clone)]
struct Item {
    flags: u32,
    data: Bytes,
    cas: u64,
}

struct State {
    options: ServerOptions,
    items: Mutex<HashMap<Bytes, Item>>,
    next_cas: AtomicU64,
    gate: Option<Semaphore>,
    mangle_opaque: AtomicBool,
    received: Mutex<Vec<RequestHeader>>,
    connections: AtomicUsize,
}

pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
}

impl FakeServer {
    pub async fn start() -> Result<Self> {
        Self::with_options(ServerOptions::default()).await
    }

    pub async fn with_options(options: ServerOptions) -> Result<Self> {
        Self::start_on("127.0.0.1:0".parse()?, options).await
    }

    /// Binds `addr`, which lets a test bring a stopped server back.
    pub async fn start_on(addr: SocketAddr, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding fake server on {addr}"))?;
        let addr = listener.local_addr()?;

        let state = Arc::new(State {
            gate: options.hold_responses.then(|| Semaphore::new(0)),
            options,
            items: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
            mangle_opaque: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, Arc::clone(&state), cancel.clone()));

        Ok(Self { addr, state, cancel })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Lets `count` held responses through.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.state.gate {
            gate.add_permits(count);
        }
    }

    pub fn set_mangle_opaque(&self, mangle: bool) {
        self.state.mangle_opaque.store(mangle, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<RequestHeader> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn item(&self, key: &str) -> Option<Bytes> {
        let items = self.state.items.lock().unwrap();
        items.get(key.as_bytes()).map(|item| item.data.clone())
    }

    pub fn item_count(&self) -> usize {
        self.state.items.lock().unwrap().len()
    }

    /// Closes the listener and every open connection.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((socket, _)) = accepted else { break };
                state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&state);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = serve(socket, state) => {}
                    }
                });
            }
        }
    }
}

async fn serve(socket: TcpStream, state: Arc<State>) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();
    let mut session = Session {
        authenticated: state.options.credentials.is_none(),
        challenged: false,
    };

    loop {
        let mut head = [0u8; HEADER_LEN];
        if reader.read_exact(&mut head).await.is_err() {
            return Ok(());
        }
        let header = RequestHeader::decode(&head)?;
        let mut body = vec![0u8; header.total_body_length as usize];
        reader.read_exact(&mut body).await?;

        let body = Bytes::from(body);
        let extra_end = usize::from(header.extra_length);
        let key_end = extra_end + usize::from(header.key_length);
        let request = Request {
            header,
            extra: body.slice(..extra_end),
            key: body.slice(extra_end..key_end),
            value: body.slice(key_end..),
        };
        state.received.lock().unwrap().push(header);

        for mut response in state.process(&request, &mut session) {
            if let Some(gate) = &state.gate {
                gate.acquire().await?.forget();
            }
            if state.mangle_opaque.load(Ordering::SeqCst) {
                response.header.opaque = response.header.opaque.wrapping_add(0x1000);
            }
            let mut buf = BytesMut::new();
            response.encode(&mut buf);
            writer.write_all(&buf).await?;
        }
    }
}

struct Session {
    authenticated: bool,
    challenged: bool,
}

struct Request {
    header: RequestHeader,
    extra: Bytes,
    key: Bytes,
    value: Bytes,
}

impl Request {
    fn reply(&self, status: Status) -> Response {
        Response {
            header: ResponseHeader {
                opcode: self.header.opcode,
                status: status.code(),
                opaque: self.header.opaque,
                ..Default::default()
            },
            extra: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    fn reply_with_cas(&self, cas: u64) -> Response {
        let mut response = self.reply(Status::NoError);
        response.header.cas = cas;
        response
    }
}

impl State {
    fn process(&self, request: &Request, session: &mut Session) -> Vec<Response> {
        let Some(opcode) = Opcode::from_u8(request.header.opcode) else {
            return vec![request.reply(Status::UnknownCommand)];
        };

        if matches!(opcode, Opcode::SaslAuthStart | Opcode::SaslAuthStep) {
            return vec![self.authenticate(opcode, request, session)];
        }
        if !session.authenticated {
            return vec![request.reply(Status::AuthenticationError)];
        }

        match opcode {
            Opcode::Get | Opcode::GetAndTouch => vec![self.get(request)],
            Opcode::Set | Opcode::Add | Opcode::Replace => vec![self.store(opcode, request)],
            Opcode::Delete => {
                let removed = self.items.lock().unwrap().remove(&request.key);
                let status = if removed.is_some() { Status::NoError } else { Status::KeyNotFound };
                vec![request.reply(status)]
            }
            Opcode::Increment | Opcode::Decrement => vec![self.arithmetic(opcode, request)],
            Opcode::NoOp => vec![request.reply(Status::NoError)],
            Opcode::Stat => self.stats(request),
            _ => vec![request.reply(Status::UnknownCommand)],
        }
    }

    fn authenticate(&self, opcode: Opcode, request: &Request, session: &mut Session) -> Response {
        let Some((user, password)) = &self.options.credentials else {
            return request.reply(Status::UnknownCommand);
        };
        if request.key.as_ref() != b"PLAIN" {
            return request.reply(Status::AuthenticationError);
        }

        let accepted = match (opcode, &self.options.challenge) {
            (Opcode::SaslAuthStart, challenge) => {
                let expected = format!("\0{user}\0{password}");
                if request.value.as_ref() != expected.as_bytes() {
                    return request.reply(Status::AuthenticationError);
                }
                if let Some(challenge) = challenge {
                    session.challenged = true;
                    let mut response = request.reply(Status::StepRequired);
                    response.value = Bytes::from(challenge.clone());
                    return response;
                }
                true
            }
            (_, Some(challenge)) => {
                let expected = format!("{challenge}\0{password}");
                session.challenged && request.value.as_ref() == expected.as_bytes()
            }
            (_, None) => false,
        };

        if accepted {
            session.authenticated = true;
            let mut response = request.reply(Status::NoError);
            response.value = Bytes::from_static(b"Authenticated");
            response
        } else {
            request.reply(Status::AuthenticationError)
        }
    }

    fn get(&self, request: &Request) -> Response {
        let items = self.items.lock().unwrap();
        match items.get(&request.key) {
            Some(item) => {
                let mut response = request.reply_with_cas(item.cas);
                response.extra = Bytes::copy_from_slice(&item.flags.to_be_bytes());
                response.value = item.data.clone();
                response
            }
            None => {
                let mut response = request.reply(Status::KeyNotFound);
                response.value = Bytes::from_static(b"Not found");
                response
            }
        }
    }

    fn store(&self, opcode: Opcode, request: &Request) -> Response {
        let mut items = self.items.lock().unwrap();
        let existing = items.get(&request.key);
        let cas = request.header.cas;

        let status = match (opcode, existing) {
            (Opcode::Add, Some(_)) => Some(Status::KeyExists),
            (Opcode::Replace, None) => Some(Status::KeyNotFound),
            (_, Some(item)) if cas != 0 && item.cas != cas => Some(Status::KeyExists),
            (_, None) if cas != 0 => Some(Status::KeyNotFound),
            _ => None,
        };
        if let Some(status) = status {
            return request.reply(status);
        }

        let cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
        items.insert(
            request.key.clone(),
            Item {
                flags: read_u32(&request.extra, 0),
                data: request.value.clone(),
                cas,
            },
        );
        request.reply_with_cas(cas)
    }

    fn arithmetic(&self, opcode: Opcode, request: &Request) -> Response {
        let delta = read_u64(&request.extra, 0);
        let initial = read_u64(&request.extra, 8);
        let expiration = read_u32(&request.extra, 16);

        let mut items = self.items.lock().unwrap();
        let value = match items.get(&request.key) {
            None if expiration == u32::MAX => return request.reply(Status::KeyNotFound),
            None => initial,
            Some(item) => {
                let Some(current) = std::str::from_utf8(&item.data)
                    .ok()
                    .and_then(|text| text.parse::<u64>().ok())
                else {
                    return request.reply(Status::NonNumericValue);
                };
                if opcode == Opcode::Increment {
                    current.wrapping_add(delta)
                } else {
                    current.saturating_sub(delta)
                }
            }
        };

        let cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
        items.insert(
            request.key.clone(),
            Item {
                flags: 0,
                data: Bytes::from(value.to_string()),
                cas,
            },
        );
        let mut response = request.reply_with_cas(cas);
        let mut encoded = BytesMut::with_capacity(8);
        encoded.put_u64(value);
        response.value = encoded.freeze();
        response
    }

    fn stats(&self, request: &Request) -> Vec<Response> {
        let count = self.items.lock().unwrap().len().to_string();
        let stats = [
            ("pid".to_string(), std::process::id().to_string()),
            ("curr_items".to_string(), count),
        ];

        let mut responses: Vec<_> = stats
            .into_iter()
            .map(|(name, value)| {
                let mut response = request.reply(Status::NoError);
                response.key = Bytes::from(name);
                response.value = Bytes::from(value);
                response
            })
            .collect();
        responses.push(request.reply(Status::NoError));
        responses
    }
}

/// Short intervals so reconnect and shutdown paths finish quickly.
pub fn transport_config() -> TransportConfig {
    TransportConfig {
        queue_length: 64,
        queue_timeout_ms: 0,
        dead_retry_interval_ms: 50,
        connect_timeout_ms: 500,
        shutdown_poll_interval_ms: 20,
        shutdown_poll_attempts: 5,
    }
}

pub fn node_config(pool_size: usize) -> NodeConfig {
    NodeConfig {
        pool_size,
        transport: transport_config(),
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}
