use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Opcode, Response, Status, read_u32};
use crate::error::{Error, Result};
use crate::request::{
    CallbackCell, CallbackPolicy, Envelope, Expiration, MemcacheRequest, RedundantState,
};

/// A value as stored on the server: opaque bytes plus the client flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub flags: u32,
    pub data: Bytes,
    pub cas: u64,
}

pub type GetCallback = Box<dyn FnOnce(Status, Option<CacheItem>) + Send + 'static>;

/// Get, or Get-and-touch when built with [`GetRequest::get_and_touch`].
pub struct GetRequest {
    envelope: Envelope,
    touch: Option<Expiration>,
    redundancy: RedundantState,
    callback: CallbackCell<GetCallback>,
}

impl GetRequest {
    pub fn new<F>(key: impl Into<Bytes>, callback: F) -> Self
    where
        F: FnOnce(Status, Option<CacheItem>) + Send + 'static,
    {
        Self {
            envelope: Envelope::new(key.into()),
            touch: None,
            redundancy: RedundantState::new(0, CallbackPolicy::AnyOk),
            callback: CallbackCell::new(Box::new(callback)),
        }
    }

    /// Reads the item and resets its expiration in the same round trip.
    pub fn get_and_touch<F>(key: impl Into<Bytes>, expiration: Expiration, callback: F) -> Self
    where
        F: FnOnce(Status, Option<CacheItem>) + Send + 'static,
    {
        Self {
            touch: Some(expiration),
            ..Self::new(key, callback)
        }
    }

    pub fn replicate(mut self, replicas: usize, policy: CallbackPolicy) -> Self {
        self.redundancy = RedundantState::new(replicas, policy);
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.envelope.opaque = opaque;
        self
    }

    fn deliver(&self, status: Status, item: Option<CacheItem>) {
        if self.redundancy.record_answer(status) {
            if let Some(callback) = self.callback.take() {
                callback(status, item);
            }
        }
    }
}

impl MemcacheRequest for GetRequest {
    fn opcode(&self) -> Opcode {
        if self.touch.is_some() {
            Opcode::GetAndTouch
        } else {
            Opcode::Get
        }
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
        let mut extra = BytesMut::new();
        if let Some(expiration) = self.touch {
            extra.put_u32(expiration.encode());
        }
        self.envelope.query(self.opcode(), &extra, &[], 0)
    }

    fn handle_response(&self, response: &Response) -> Result<()> {
        let status = response.status();
        if status != Status::NoError {
            self.deliver(status, None);
            return Ok(());
        }

        if response.extra.len() < 4 {
            return Err(Error::Protocol(format!(
                "get response carries {} bytes of extras, flags need 4",
                response.extra.len()
            )));
        }

        let item = CacheItem {
            flags: read_u32(&response.extra, 0),
            data: response.value.clone(),
            cas: response.header.cas,
        };
        self.deliver(status, Some(item));
        Ok(())
    }

    fn fail(&self) {
        self.deliver(Status::InternalError, None);
    }
}
