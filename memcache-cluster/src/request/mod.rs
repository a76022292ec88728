//! Units of work sent to cache nodes.
//!
//! A request knows how to serialize itself and how to consume the response
//! (or the failure) that resolves it. Requests are shared as
//! `Arc<dyn MemcacheRequest>` because a replicated request is handed to
//! several transports at once, so every method takes `&self` and the
//! mutable bits (callback, vBucket id, aggregation state) live behind
//! interior mutability.
//!
//! - [`get`]: Get and Get-and-touch
//! - [`store`]: Set, Add and Replace
//! - [`delete`]: Delete
//! - [`arithmetic`]: Increment and Decrement
//! - [`noop`]: NoOp
//! - [`stat`]: Stat, answered by a sequence of chunks
//! - [`sasl`]: SASL authentication start/step
//! - [`redundancy`]: exactly-once aggregation of replica answers

use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{HEADER_LEN, Opcode, RequestHeader, Response};
use crate::error::{Error, Result};

pub mod arithmetic;
pub mod delete;
pub mod get;
pub mod noop;
pub mod redundancy;
pub mod sasl;
pub mod stat;
pub mod store;

pub use arithmetic::ArithmeticRequest;
pub use delete::DeleteRequest;
pub use get::{CacheItem, GetRequest};
pub use noop::NoOpRequest;
pub use redundancy::{CallbackPolicy, RedundantState};
pub use sasl::SaslRequest;
pub use stat::StatRequest;
pub use store::{StoreMode, StoreRequest};

/// The contract every request variant fulfils.
///
/// Exactly one of [`handle_response`](MemcacheRequest::handle_response) for
/// the terminal response or [`fail`](MemcacheRequest::fail) reaches the user
/// callback of a non-replicated request. Replicated requests see one call
/// per replica and let [`RedundantState`] decide which one is reported.
pub trait MemcacheRequest: Send + Sync {
    fn opcode(&self) -> Opcode;

    /// Correlation id echoed back by the server.
    fn opaque(&self) -> u32;

    /// Key used for routing. Empty for keyless commands.
    fn key(&self) -> &[u8];

    /// Number of additional nodes the request is sent to.
    fn replicas(&self) -> usize {
        0
    }

    fn set_vbucket(&self, _vbucket: u16) {}

    /// Wire representation: header, extras, key and value.
    fn query_buffer(&self) -> Result<Bytes>;

    fn handle_response(&self, response: &Response) -> Result<()>;

    /// Resolves the request as if the server had answered `InternalError`.
    fn fail(&self);

    /// Whether the request keeps its pending slot after `response`.
    fn expects_more(&self, _response: &Response) -> bool {
        false
    }
}

static NEXT_OPAQUE: AtomicU32 = AtomicU32::new(1);

/// Hands out process-unique correlation ids.
pub fn next_opaque() -> u32 {
    NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

/// Holds a one-shot callback until the request is resolved.
pub(crate) struct CallbackCell<F> {
    inner: Mutex<Option<F>>,
}

impl<F> CallbackCell<F> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            inner: Mutex::new(Some(callback)),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Returns the callback the first time only.
    pub(crate) fn take(&self) -> Option<F> {
        self.inner.lock().unwrap().take()
    }
}

/// Fields shared by keyed requests.
pub(crate) struct Envelope {
    pub(crate) opaque: u32,
    pub(crate) key: Bytes,
    vbucket: AtomicU16,
}

impl Envelope {
    pub(crate) fn new(key: Bytes) -> Self {
        Self {
            opaque: next_opaque(),
            key,
            vbucket: AtomicU16::new(0),
        }
    }

    pub(crate) fn set_vbucket(&self, vbucket: u16) {
        self.vbucket.store(vbucket, Ordering::Relaxed);
    }

    pub(crate) fn query(&self, opcode: Opcode, extra: &[u8], value: &[u8], cas: u64) -> Result<Bytes> {
        build_query(
            QueryParts {
                opcode,
                opaque: self.opaque,
                vbucket: self.vbucket.load(Ordering::Relaxed),
                cas,
            },
            extra,
            &self.key,
            value,
        )
    }
}

pub(crate) struct QueryParts {
    pub(crate) opcode: Opcode,
    pub(crate) opaque: u32,
    pub(crate) vbucket: u16,
    pub(crate) cas: u64,
}

pub(crate) fn build_query(parts: QueryParts, extra: &[u8], key: &[u8], value: &[u8]) -> Result<Bytes> {
    let key_length = u16::try_from(key.len()).map_err(|_| {
        Error::Argument(format!("key is {} bytes, the limit is {}", key.len(), u16::MAX))
    })?;
    let body_length = extra.len() + key.len() + value.len();
    let total_body_length = u32::try_from(body_length)
        .map_err(|_| Error::Argument(format!("body of {body_length} bytes does not fit a frame")))?;

    let header = RequestHeader {
        opcode: parts.opcode as u8,
        key_length,
        extra_length: extra.len() as u8,
        data_type: 0,
        vbucket: parts.vbucket,
        total_body_length,
        opaque: parts.opaque,
        cas: parts.cas,
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_length);
    header.encode(&mut buf);
    buf.put_slice(extra);
    buf.put_slice(key);
    buf.put_slice(value);
    Ok(buf.freeze())
}

/// Item lifetime as understood by memcached.
///
/// Durations shorter than 30 days are sent as a relative number of seconds,
/// longer ones as an absolute Unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    #[default]
    Never,
    After(Duration),
}

const RELATIVE_LIMIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

impl Expiration {
    /// Builds an expiration from a signed second count; negative counts are invalid.
    pub fn from_secs(secs: i64) -> Result<Self> {
        match secs {
            0 => Ok(Expiration::Never),
            secs if secs < 0 => Err(Error::Argument(format!("negative expiration: {secs}s"))),
            secs => Ok(Expiration::After(Duration::from_secs(secs as u64))),
        }
    }

    pub fn encode(&self) -> u32 {
        self.encode_at(SystemTime::now())
    }

    pub fn encode_at(&self, now: SystemTime) -> u32 {
        match *self {
            Expiration::Never => 0,
            // 0 means "never", so a sub-second lifetime becomes one second.
            Expiration::After(ttl) if ttl.is_zero() => 0,
            Expiration::After(ttl) if ttl < RELATIVE_LIMIT => ttl.as_secs().max(1) as u32,
            Expiration::After(ttl) => {
                let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
                (since_epoch + ttl).as_secs().min(u64::from(u32::MAX)) as u32
            }
        }
    }
}
