//! Connection authentication.
//!
//! A transport that has an [`Authenticator`] asks it for a fresh
//! [`AuthenticationToken`] on every (re)connect and drives the exchange:
//! as long as the token answers [`Status::StepRequired`] together with a
//! request, the request is written and its response fed back into the
//! next step. `NoError` completes the handshake; any other status is fatal
//! to the connection.

use serde::{Deserialize, Serialize};

use crate::codec::{Response, Status};
use crate::request::{MemcacheRequest, SaslRequest};

pub trait AuthenticationToken: Send {
    /// Advances the exchange. `answer` is the response to the request
    /// returned by the previous step, `None` on the first call.
    fn step_authenticate(
        &mut self,
        answer: Option<&Response>,
    ) -> (Status, Option<Box<dyn MemcacheRequest>>);
}

pub trait Authenticator: Send + Sync {
    fn create_token(&self) -> Box<dyn AuthenticationToken>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub zone: String,
    pub user: String,
    pub password: String,
}

/// SASL `PLAIN`, the mechanism Couchbase buckets accept.
#[derive(Debug, Clone)]
pub struct SaslPlainAuthenticator {
    credentials: Credentials,
}

impl SaslPlainAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl Authenticator for SaslPlainAuthenticator {
    fn create_token(&self) -> Box<dyn AuthenticationToken> {
        Box::new(SaslPlainToken {
            credentials: self.credentials.clone(),
            sent: false,
        })
    }
}

struct SaslPlainToken {
    credentials: Credentials,
    sent: bool,
}

impl AuthenticationToken for SaslPlainToken {
    fn step_authenticate(
        &mut self,
        answer: Option<&Response>,
    ) -> (Status, Option<Box<dyn MemcacheRequest>>) {
        if !self.sent {
            self.sent = true;
            let Credentials {
                zone,
                user,
                password,
            } = &self.credentials;
            return (
                Status::StepRequired,
                Some(Box::new(SaslRequest::plain(zone, user, password))),
            );
        }

        // PLAIN is single-step: whatever the server said is final.
        match answer {
            Some(response) if response.status() == Status::StepRequired => {
                (Status::AuthenticationError, None)
            }
            Some(response) => (response.status(), None),
            None => (Status::AuthenticationError, None),
        }
    }
}
