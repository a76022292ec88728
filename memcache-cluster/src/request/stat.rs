use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::codec::{Opcode, Response, Status};
use crate::error::Result;
use crate::request::{CallbackCell, MemcacheRequest, QueryParts, build_query, next_opaque};

pub type StatCallback = Box<dyn FnOnce(Status, BTreeMap<String, String>) + Send + 'static>;

/// Server statistics, optionally restricted to a group such as `items`.
///
/// The server answers with one response per statistic, all sharing the
/// request opaque, and closes the sequence with an empty-key response.
pub struct StatRequest {
    opaque: u32,
    group: Bytes,
    collected: Mutex<BTreeMap<String, String>>,
    callback: CallbackCell<StatCallback>,
}

impl StatRequest {
    pub fn new<F>(group: Option<&str>, callback: F) -> Self
    where
        F: FnOnce(Status, BTreeMap<String, String>) + Send + 'static,
    {
        Self {
            opaque: next_opaque(),
            group: group.map(|g| Bytes::copy_from_slice(g.as_bytes())).unwrap_or_default(),
            collected: Mutex::new(BTreeMap::new()),
            callback: CallbackCell::new(Box::new(callback)),
        }
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    fn finish(&self, status: Status) {
        if let Some(callback) = self.callback.take() {
            let collected = std::mem::take(&mut *self.collected.lock().unwrap());
            callback(status, collected);
        }
    }
}

impl MemcacheRequest for StatRequest {
    fn opcode(&self) -> Opcode {
        Opcode::Stat
    }

    fn opaque(&self) -> u32 {
        self.opaque
    }

    fn key(&self) -> &[u8] {
        &self.group
    }

    fn query_buffer(&self) -> Result<Bytes> {
        let parts = QueryParts {
            opcode: Opcode::Stat,
            opaque: self.opaque,
            vbucket: 0,
            cas: 0,
        };
        build_query(parts, &[], &self.group, &[])
    }

    fn handle_response(&self, response: &Response) -> Result<()> {
        if self.expects_more(response) {
            let name = String::from_utf8_lossy(&response.key).into_owned();
            let value = String::from_utf8_lossy(&response.value).into_owned();
            self.collected.lock().unwrap().insert(name, value);
        } else {
            self.finish(response.status());
        }
        Ok(())
    }

    fn fail(&self) {
        self.finish(Status::InternalError);
    }

    fn expects_more(&self, response: &Response) -> bool {
        response.status() == Status::NoError && !response.key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::ResponseHeader;

    fn chunk(key: &'static str, value: &'static str) -> Response {
        Response {
            header: ResponseHeader {
                opcode: Opcode::Stat as u8,
                ..Default::default()
            },
            extra: Bytes::new(),
            key: Bytes::from_static(key.as_bytes()),
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    #[test]
    fn chunks_accumulate_until_the_terminator() {
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        let request = StatRequest::new(None, move |status, stats| {
            *sink.lock().unwrap() = Some((status, stats));
        });

        for (key, value) in [("pid", "42"), ("uptime", "7")] {
            let response = chunk(key, value);
            assert!(request.expects_more(&response));
            request.handle_response(&response).unwrap();
        }
        assert!(result.lock().unwrap().is_none());

        let terminator = chunk("", "");
        assert!(!request.expects_more(&terminator));
        request.handle_response(&terminator).unwrap();

        let (status, stats) = result.lock().unwrap().take().expect("callback fired");
        assert_eq!(status, Status::NoError);
        assert_eq!(stats.get("pid").map(String::as_str), Some("42"));
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn group_is_sent_as_key() {
        let request = StatRequest::new(Some("items"), |_, _| {});
        assert_eq!(request.key(), b"items");
    }
}
