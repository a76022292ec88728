use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Opcode, Response, Status};
use crate::error::Result;
use crate::request::{
    CallbackCell, CallbackPolicy, Envelope, Expiration, MemcacheRequest, RedundantState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
}

impl StoreMode {
    fn opcode(self) -> Opcode {
        match self {
            StoreMode::Set => Opcode::Set,
            StoreMode::Add => Opcode::Add,
            StoreMode::Replace => Opcode::Replace,
        }
    }
}

pub type StatusCallback = Box<dyn FnOnce(Status) + Send + 'static>;

/// Set, Add or Replace. Extras are `flags(4) + expiration(4)`.
pub struct StoreRequest {
    envelope: Envelope,
    mode: StoreMode,
    value: Bytes,
    flags: u32,
    expiration: Expiration,
    cas: u64,
    redundancy: RedundantState,
    callback: CallbackCell<StatusCallback>,
}

impl StoreRequest {
    pub fn new<F>(mode: StoreMode, key: impl Into<Bytes>, value: impl Into<Bytes>, callback: F) -> Self
    where
        F: FnOnce(Status) + Send + 'static,
    {
        Self {
            envelope: Envelope::new(key.into()),
            mode,
            value: value.into(),
            flags: 0,
            expiration: Expiration::Never,
            cas: 0,
            redundancy: RedundantState::new(0, CallbackPolicy::AnyOk),
            callback: CallbackCell::new(Box::new(callback)),
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Only store if the item still has this CAS value.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.envelope.opaque = opaque;
        self
    }

    pub fn replicate(mut self, replicas: usize, policy: CallbackPolicy) -> Self {
        self.redundancy = RedundantState::new(replicas, policy);
        self
    }

    fn deliver(&self, status: Status) {
        if self.redundancy.record_answer(status) {
            if let Some(callback) = self.callback.take() {
                callback(status);
            }
        }
    }
}

impl MemcacheRequest for StoreRequest {
    fn opcode(&self) -> Opcode {
        self.mode.opcode()
    }

    fn opaque(&self) -> u32 {
        self.envelope.opaque
    }

    fn key(&self) -> &[u8] {
        &self.envelope.key
    }

    fn replicas(&self) -> usize {
        self.redundancy.replicas()
    }

    fn set_vbucket(&self, vbucket: u16) {
        self.envelope.set_vbucket(vbucket);
    }

    fn query_buffer(&self) -> Result<Bytes> {
        let mut extra = BytesMut::with_capacity(8);
        extra.put_u32(self.flags);
        extra.put_u32(self.expiration.encode());
        self.envelope.query(self.opcode(), &extra, &self.value, self.cas)
    }

    fn handle_response(&self, response: &Response) -> Result<()> {
        self.deliver(response.status());
        Ok(())
    }

    fn fail(&self) {
        self.deliver(Status::InternalError);
    }
}
