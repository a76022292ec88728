use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Opcode, Response, Status, read_u64};
use crate::error::{Error, Result};
use crate::request::{
    CallbackCell, CallbackPolicy, Envelope, Expiration, MemcacheRequest, RedundantState,
};

pub type CounterCallback = Box<dyn FnOnce(Status, u64) + Send + 'static>;

/// Increment or Decrement of a numeric value.
///
/// Extras are `delta(8) + initial(8) + expiration(4)`. The server creates the
/// counter with `initial` when the key is missing.
pub struct ArithmeticRequest {
    envelope: Envelope,
    opcode: Opcode,
    delta: u64,
    initial: u64,
    expiration: Expiration,
    redundancy: RedundantState,
    callback: CallbackCell<CounterCallback>,
}

impl ArithmeticRequest {
    pub fn increment<F>(key: impl Into<Bytes>, delta: u64, initial: u64, callback: F) -> Self
    where
        F: FnOnce(Status, u64) + Send + 'static,
    {
        Self::build(Opcode::Increment, key.into(), delta, initial, Box::new(callback))
    }

    pub fn decrement<F>(key: impl Into<Bytes>, delta: u64, initial: u64, callback: F) -> Self
    where
        F: FnOnce(Status, u64) + Send + 'static,
    {
        Self::build(Opcode::Decrement, key.into(), delta, initial, Box::new(callback))
    }

    fn build(opcode: Opcode, key: Bytes, delta: u64, initial: u64, callback: CounterCallback) -> Self {
        Self {
            envelope: Envelope::new(key),
            opcode,
            delta,
            initial,
            expiration: Expiration::Never,
            redundancy: RedundantState::new(0, CallbackPolicy::AnyOk),
            callback: CallbackCell::new(callback),
        }
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
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

    fn deliver(&self, status: Status, value: u64) {
        if self.redundancy.record_answer(status) {
            if let Some(callback) = self.callback.take() {
                callback(status, value);
            }
        }
    }
}

impl MemcacheRequest for ArithmeticRequest {
    fn opcode(&self) -> Opcode {
        self.opcode
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
        let mut extra = BytesMut::with_capacity(20);
        extra.put_u64(self.delta);
        extra.put_u64(self.initial);
        extra.put_u32(self.expiration.encode());
        self.envelope.query(self.opcode, &extra, &[], 0)
    }

    fn handle_response(&self, response: &Response) -> Result<()> {
        let status = response.status();
        if status != Status::NoError {
            self.deliver(status, 0);
            return Ok(());
        }

        if response.value.len() != 8 {
            return Err(Error::Protocol(format!(
                "counter response carries {} bytes, expected 8",
                response.value.len()
            )));
        }
        self.deliver(status, read_u64(&response.value, 0));
        Ok(())
    }

    fn fail(&self) {
        self.deliver(Status::InternalError, 0);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::codec::{HEADER_LEN, RequestHeader, ResponseHeader};

    fn counter_response(value: &'static [u8]) -> Response {
        Response {
            header: ResponseHeader {
                opcode: Opcode::Increment as u8,
                ..Default::default()
            },
            extra: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::from_static(value),
        }
    }

    #[test]
    fn extras_layout() {
        let request = ArithmeticRequest::decrement("hits", 2, 10, |_, _| {});
        let query = request.query_buffer().unwrap();
        let header = RequestHeader::decode(&query).unwrap();

        assert_eq!(header.opcode, Opcode::Decrement as u8);
        assert_eq!(header.extra_length, 20);
        assert_eq!(header.total_body_length, 24);
        let extra = &query[HEADER_LEN..HEADER_LEN + 20];
        assert_eq!(read_u64(extra, 0), 2);
        assert_eq!(read_u64(extra, 8), 10);
        assert_eq!(&extra[16..], &[0, 0, 0, 0]);
    }

    #[test]
    fn new_value_is_reported() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let request = ArithmeticRequest::increment("hits", 1, 0, move |status, value| {
            *sink.lock().unwrap() = Some((status, value));
        });

        request
            .handle_response(&counter_response(&[0, 0, 0, 0, 0, 0, 1, 0]))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((Status::NoError, 256)));
    }

    #[test]
    fn short_value_is_a_protocol_error() {
        let request = ArithmeticRequest::increment("hits", 1, 0, |_, _| {});
        let err = request.handle_response(&counter_response(&[1, 2])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
