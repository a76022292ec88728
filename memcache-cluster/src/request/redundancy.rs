//! Exactly-once aggregation of answers for replicated requests.
//!
//! A request sent to `replicas + 1` nodes receives that many answers (real
//! responses or synthesized failures), but its callback must fire once.
//! [`RedundantState::record_answer`] decides, answer by answer, whether the
//! current one is the decisive one.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::codec::Status;

/// Which answer of a replicated request reaches the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackPolicy {
    /// The first success wins; failures are only reported when nothing succeeded.
    #[default]
    AnyOk,
    /// The first failure wins; success is only reported when everything succeeded.
    AllOk,
}

#[derive(Debug, Default)]
struct Answers {
    received: usize,
    ignore_next: bool,
}

#[derive(Debug)]
pub struct RedundantState {
    replicas: usize,
    policy: CallbackPolicy,
    answers: Mutex<Answers>,
}

impl RedundantState {
    pub fn new(replicas: usize, policy: CallbackPolicy) -> Self {
        Self {
            replicas,
            policy,
            answers: Mutex::new(Answers::default()),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn policy(&self) -> CallbackPolicy {
        self.policy
    }

    /// Records one answer and returns whether it must be delivered.
    ///
    /// Once an answer has been delivered every later one is swallowed.
    pub fn record_answer(&self, status: Status) -> bool {
        let mut answers = self.answers.lock().unwrap();
        answers.received += 1;

        if answers.ignore_next {
            return false;
        }

        if answers.received == self.replicas + 1 {
            answers.ignore_next = true;
            return true;
        }

        answers.ignore_next = match self.policy {
            CallbackPolicy::AnyOk => status == Status::NoError,
            CallbackPolicy::AllOk => status != Status::NoError,
        };
        answers.ignore_next
    }
}
