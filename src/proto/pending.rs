//! In-flight request records held by a replica backend.
//!
//! A pending request owns its callback and fires it exactly once, on one of
//! four paths: the matching response, a response of the wrong kind, an
//! invalid-request reply, or deadline expiry. Consuming `self` on every
//! completion path makes double invocation unrepresentable.

use std::time::{Duration, Instant};

use crate::types::{HasKeyCallback, Key, LookupCallback, QueryStatus, SizeCallback, StoreMap, Topic};

use super::request::Request;
use super::response::Response;

enum ReplyHandler {
    Lookup { key: Key, cb: LookupCallback },
    HasKey { key: Key, cb: HasKeyCallback },
    Size { cb: SizeCallback },
    /// Snapshots complete against the frontend, not a user callback.
    Snapshot,
}

/// What the backend must do after a pending request completed.
#[derive(Debug)]
pub enum Completion {
    /// Nothing further; any user callback already fired.
    Done,
    /// A snapshot arrived; hand it to the paired frontend.
    ApplySnapshot { store: StoreMap, sequence: u64 },
    /// The snapshot reply was unusable. Re-issue the request, otherwise an
    /// unsynchronized replica would buffer publications forever.
    RetrySnapshot,
}

pub struct PendingRequest {
    request: Request,
    wire: Vec<u8>,
    reply: ReplyHandler,
    /// `None` for snapshots, which never expire.
    deadline: Option<Instant>,
    sent: bool,
}

impl PendingRequest {
    pub fn lookup(topic: Topic, key: Key, timeout: Duration, cb: LookupCallback) -> Self {
        let request = Request::Lookup { topic, key: key.clone() };
        Self::new(request, ReplyHandler::Lookup { key, cb }, Some(timeout))
    }

    pub fn has_key(topic: Topic, key: Key, timeout: Duration, cb: HasKeyCallback) -> Self {
        let request = Request::HasKey { topic, key: key.clone() };
        Self::new(request, ReplyHandler::HasKey { key, cb }, Some(timeout))
    }

    pub fn size(topic: Topic, timeout: Duration, cb: SizeCallback) -> Self {
        Self::new(Request::Size { topic }, ReplyHandler::Size { cb }, Some(timeout))
    }

    pub fn snapshot(topic: Topic) -> Self {
        Self::new(Request::Snapshot { topic }, ReplyHandler::Snapshot, None)
    }

    fn new(request: Request, reply: ReplyHandler, timeout: Option<Duration>) -> Self {
        let wire = request.prepare();
        PendingRequest {
            request,
            wire,
            reply,
            deadline: timeout.map(|t| Instant::now() + t),
            sent: false,
        }
    }

    pub fn topic(&self) -> &str {
        self.request.topic()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn sent(&self) -> bool {
        self.sent
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }

    /// Fire the callback with the timeout code.
    pub fn expire(self) {
        match self.reply {
            ReplyHandler::Lookup { key, cb } => cb(&key, None, QueryStatus::TimedOut),
            ReplyHandler::HasKey { key, cb } => cb(&key, false, QueryStatus::TimedOut),
            ReplyHandler::Size { cb } => cb(0, QueryStatus::TimedOut),
            // Snapshots carry no deadline, so this path is unreachable; there
            // is nothing sensible to do but drop.
            ReplyHandler::Snapshot => debug_assert!(false, "snapshot requests never expire"),
        }
    }

    /// Dispatch a received reply. `response` is `None` when the reply bytes
    /// could not be parsed; the callback still fires, with the
    /// invalid-response code.
    pub fn complete(self, response: Option<Response>) -> Completion {
        match self.reply {
            ReplyHandler::Lookup { key, cb } => {
                match response {
                    Some(Response::Lookup(value)) => cb(&key, value, QueryStatus::Success),
                    Some(Response::Invalid { .. }) => cb(&key, None, QueryStatus::InvalidRequest),
                    _ => cb(&key, None, QueryStatus::InvalidResponse),
                }
                Completion::Done
            }
            ReplyHandler::HasKey { key, cb } => {
                match response {
                    Some(Response::HasKey(exists)) => cb(&key, exists, QueryStatus::Success),
                    Some(Response::Invalid { .. }) => cb(&key, false, QueryStatus::InvalidRequest),
                    _ => cb(&key, false, QueryStatus::InvalidResponse),
                }
                Completion::Done
            }
            ReplyHandler::Size { cb } => {
                match response {
                    Some(Response::Size(n)) => cb(n, QueryStatus::Success),
                    Some(Response::Invalid { .. }) => cb(0, QueryStatus::InvalidRequest),
                    _ => cb(0, QueryStatus::InvalidResponse),
                }
                Completion::Done
            }
            ReplyHandler::Snapshot => match response {
                Some(Response::Snapshot { store, sequence }) => {
                    Completion::ApplySnapshot { store, sequence }
                }
                _ => Completion::RetrySnapshot,
            },
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request", &self.request)
            .field("deadline", &self.deadline)
            .field("sent", &self.sent)
            .finish_non_exhaustive()
    }
}
