use bytes::Bytes;

use crate::codec::{Opcode, Response, Status};
use crate::error::Result;
use crate::request::store::StatusCallback;
use crate::request::{CallbackCell, CallbackPolicy, Envelope, MemcacheRequest, RedundantState};

pub struct DeleteRequest {
    envelope: Envelope,
    redundancy: RedundantState,
    callback: CallbackCell<StatusCallback>,
}

impl DeleteRequest {
    pub fn new<F>(key: impl Into<Bytes>, callback: F) -> Self
    where
        F: FnOnce(Status) + Send + 'static,
    {
        Self {
            envelope: Envelope::new(key.into()),
            redundancy: RedundantState::new(0, CallbackPolicy::AnyOk),
            callback: CallbackCell::new(Box::new(callback)),
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

    fn deliver(&self, status: Status) {
        if self.redundancy.record_answer(status) {
            if let Some(callback) = self.callback.take() {
                callback(status);
            }
        }
    }
}

impl MemcacheRequest for DeleteRequest {
    fn opcode(&self) -> Opcode {
        Opcode::Delete
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
        self.envelope.query(Opcode::Delete, &[], &[], 0)
    }

    fn handle_response(&self, response: &Response) -> Result<()> {
        self.deliver(response.status());
        Ok(())
    }

    fn fail(&self) {
        self.deliver(Status::InternalError);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::codec::{HEADER_LEN, RequestHeader};

    #[test]
    fn delete_carries_only_the_key() {
        let request = DeleteRequest::new("gone", |_| {}).with_opaque(3);
        let query = request.query_buffer().unwrap();
        let header = RequestHeader::decode(&query).unwrap();

        assert_eq!(header.opcode, Opcode::Delete as u8);
        assert_eq!(header.total_body_length, 4);
        assert_eq!(header.opaque, 3);
        assert_eq!(&query[HEADER_LEN..], b"gone");
    }

    #[test]
    fn failure_is_reported_as_internal_error_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let request = DeleteRequest::new("k", move |status| sink.lock().unwrap().push(status));

        request.fail();
        request.fail();
        assert_eq!(*seen.lock().unwrap(), vec![Status::InternalError]);
    }
}
