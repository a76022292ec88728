use bytes::Bytes;

use crate::codec::{Opcode, Response, Status};
use crate::error::Result;
use crate::request::store::StatusCallback;
use crate::request::{CallbackCell, MemcacheRequest, QueryParts, build_query, next_opaque};

/// One SASL exchange step: the mechanism name travels as key, the
/// mechanism-specific data as value.
pub struct SaslRequest {
    opcode: Opcode,
    opaque: u32,
    mechanism: Bytes,
    payload: Bytes,
    callback: CallbackCell<StatusCallback>,
}

impl SaslRequest {
    pub fn start(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::build(Opcode::SaslAuthStart, mechanism, payload.into())
    }

    pub fn step(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::build(Opcode::SaslAuthStep, mechanism, payload.into())
    }

    /// `PLAIN` start request carrying `zone\0user\0password`.
    pub fn plain(zone: &str, user: &str, password: &str) -> Self {
        let payload = [zone.as_bytes(), user.as_bytes(), password.as_bytes()].join(&0u8);
        Self::start("PLAIN", payload)
    }

    fn build(opcode: Opcode, mechanism: &str, payload: Bytes) -> Self {
        Self {
            opcode,
            opaque: next_opaque(),
            mechanism: Bytes::copy_from_slice(mechanism.as_bytes()),
            payload,
            callback: CallbackCell::empty(),
        }
    }

    pub fn on_answer<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Status) + Send + 'static,
    {
        self.callback = CallbackCell::new(Box::new(callback));
        self
    }

    fn deliver(&self, status: Status) {
        if let Some(callback) = self.callback.take() {
            callback(status);
        }
    }
}

impl MemcacheRequest for SaslRequest {
    fn opcode(&self) -> Opcode {
        self.opcode
    }

    fn opaque(&self) -> u32 {
        self.opaque
    }

    fn key(&self) -> &[u8] {
        &self.mechanism
    }

    fn query_buffer(&self) -> Result<Bytes> {
        let parts = QueryParts {
            opcode: self.opcode,
            opaque: self.opaque,
            vbucket: 0,
            cas: 0,
        };
        build_query(parts, &[], &self.mechanism, &self.payload)
    }

    fn handle_response(&self, response: &Response) -> Result<()> {
        self.deliver(response.status());
        Ok(())
    }

    fn fail(&self) {
        self.deliver(Status::InternalError);
    }
}
