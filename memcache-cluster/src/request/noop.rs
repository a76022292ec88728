use bytes::Bytes;

use crate::codec::{Opcode, Response, Status};
use crate::error::Result;
use crate::request::store::StatusCallback;
use crate::request::{CallbackCell, MemcacheRequest, QueryParts, build_query, next_opaque};

/// Keyless round trip, used to probe a connection.
pub struct NoOpRequest {
    opaque: u32,
    callback: CallbackCell<StatusCallback>,
}

impl NoOpRequest {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Status) + Send + 'static,
    {
        Self {
            opaque: next_opaque(),
            callback: CallbackCell::new(Box::new(callback)),
        }
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    fn deliver(&self, status: Status) {
        if let Some(callback) = self.callback.take() {
            callback(status);
        }
    }
}

impl MemcacheRequest for NoOpRequest {
    fn opcode(&self) -> Opcode {
        Opcode::NoOp
    }

    fn opaque(&self) -> u32 {
        self.opaque
    }

    fn key(&self) -> &[u8] {
        &[]
    }

    fn query_buffer(&self) -> Result<Bytes> {
        let parts = QueryParts {
            opcode: Opcode::NoOp,
            opaque: self.opaque,
            vbucket: 0,
            cas: 0,
        };
        build_query(parts, &[], &[], &[])
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
    use super::*;
    use crate::codec::{HEADER_LEN, RequestHeader};

    #[test]
    fn noop_is_a_bare_header() {
        let query = NoOpRequest::new(|_| {}).with_opaque(0x0102).query_buffer().unwrap();
        assert_eq!(query.len(), HEADER_LEN);

        let header = RequestHeader::decode(&query).unwrap();
        assert_eq!(header.opcode, Opcode::NoOp as u8);
        assert_eq!(header.opaque, 0x0102);
        assert_eq!(header.total_body_length, 0);
    }
}
