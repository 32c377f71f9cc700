//! Best-effort cached store for a topic.
//!
//! Local state changes only through applied publications or an applied
//! snapshot; the replica's own mutators merely forward updates to the
//! authority. Synchronization is tracked explicitly: publications received
//! while unsynchronized are buffered, and a sequence gap observed while
//! synchronized clears the backlog and triggers a fresh snapshot request.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{ReplicaBackend, RequestQueue, UpdateQueue};
use crate::dump::StoreDump;
use crate::proto::{PendingRequest, Publication, Update};
use crate::types::{HasKeyCallback, LookupCallback, SizeCallback, StoreMap, Topic, Value};

use super::KvFrontend;

/// Handles into the paired backend. The backend stays caller-owned; the
/// frontend only shares its outbound queues.
struct BackendLink {
    backend: Weak<RefCell<ReplicaBackend>>,
    updates: UpdateQueue,
    requests: RequestQueue,
}

pub struct ReplicaFrontend {
    topic: Topic,
    store: StoreMap,
    sequence: u64,
    synchronized: bool,
    backlog: VecDeque<Publication>,
    link: Option<BackendLink>,
}

impl ReplicaFrontend {
    pub fn new(topic: impl Into<Topic>) -> Self {
        ReplicaFrontend {
            topic: topic.into(),
            store: StoreMap::default(),
            sequence: 0,
            synchronized: false,
            backlog: VecDeque::new(),
            link: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Bind this frontend to exactly one backend. The backend must already be
    /// connected: its subscription is established before the snapshot request
    /// is queued, so every publication newer than the snapshot is either
    /// received after it or sitting in the backlog.
    pub fn pair(
        frontend: &Rc<RefCell<ReplicaFrontend>>,
        backend: &Rc<RefCell<ReplicaBackend>>,
    ) -> bool {
        if frontend.borrow().link.is_some() {
            return false;
        }
        let link = {
            let mut be = backend.borrow_mut();
            if !be.connected() || !be.add_frontend(Rc::clone(frontend)) {
                return false;
            }
            BackendLink {
                backend: Rc::downgrade(backend),
                updates: be.update_queue(),
                requests: be.request_queue(),
            }
        };
        frontend.borrow_mut().link = Some(link);
        true
    }

    /// Detach from the paired backend. Requests already queued are not
    /// retracted; they complete with whatever outcome the transport yields.
    pub fn unpair(frontend: &Rc<RefCell<ReplicaFrontend>>) -> bool {
        let (topic, link) = {
            let mut fe = frontend.borrow_mut();
            let Some(link) = fe.link.take() else {
                return false;
            };
            (fe.topic.clone(), link)
        };
        if let Some(backend) = link.backend.upgrade() {
            backend.borrow_mut().rem_frontend(&topic);
        }
        true
    }

    /// Install a snapshot, then drain the backlog in order: each buffered
    /// publication that is next in sequence is applied and advances the
    /// counter; anything at or below the snapshot is already reflected and
    /// anything beyond next-in-sequence would be a gap, so both are dropped.
    pub fn apply_snapshot(&mut self, store: StoreMap, sequence: u64) {
        self.store = store;
        self.sequence = sequence;
        while let Some(publication) = self.backlog.pop_front() {
            if publication.sequence() == self.sequence + 1 {
                publication.apply(&mut self.store);
                self.sequence = publication.sequence();
            }
        }
        self.synchronized = true;
    }

    /// Feed one received publication through the synchronization state
    /// machine. Returns true when it was applied to the local store.
    pub fn process_publication(&mut self, publication: Publication) -> bool {
        if !self.synchronized {
            self.backlog.push_back(publication);
            return false;
        }
        if publication.sequence() == self.sequence + 1 {
            publication.apply(&mut self.store);
            self.sequence = publication.sequence();
            return true;
        }
        // Sequence discontinuity: the cache can no longer be trusted.
        warn!(
            topic = %self.topic,
            local = self.sequence,
            received = publication.sequence(),
            "publication gap, requesting snapshot"
        );
        self.backlog.clear();
        self.synchronized = false;
        self.request_snapshot();
        false
    }

    fn request_snapshot(&mut self) {
        match &self.link {
            Some(link) => link
                .requests
                .borrow_mut()
                .push_back(PendingRequest::snapshot(self.topic.clone())),
            None => debug!(topic = %self.topic, "gap detected while unpaired"),
        }
    }

    fn send_update(&self, update: Update) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        link.updates.borrow_mut().push_back(update.prepare());
        true
    }
}

impl KvFrontend for ReplicaFrontend {
    fn topic(&self) -> &str {
        &self.topic
    }

    // Mutators never touch the local store; the change lands when the
    // authority's resulting publication arrives.

    fn insert(&mut self, key: &[u8], value: Value) -> bool {
        self.send_update(Update::Insert { topic: self.topic.clone(), key: key.to_vec(), value })
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        self.send_update(Update::Remove { topic: self.topic.clone(), key: key.to_vec() })
    }

    fn increment(&mut self, key: &[u8], by: Value) -> bool {
        self.send_update(Update::Increment { topic: self.topic.clone(), key: key.to_vec(), by })
    }

    fn decrement(&mut self, key: &[u8], by: Value) -> bool {
        self.send_update(Update::Decrement { topic: self.topic.clone(), key: key.to_vec(), by })
    }

    fn clear(&mut self) -> bool {
        self.send_update(Update::Clear { topic: self.topic.clone() })
    }

    fn lookup(&self, key: &[u8]) -> Option<Value> {
        self.store.get(key).copied()
    }

    fn has_key(&self, key: &[u8]) -> bool {
        self.store.contains_key(key)
    }

    fn size(&self) -> usize {
        self.store.len()
    }

    fn lookup_async(&mut self, key: &[u8], timeout: Duration, cb: LookupCallback) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        link.requests.borrow_mut().push_back(PendingRequest::lookup(
            self.topic.clone(),
            key.to_vec(),
            timeout,
            cb,
        ));
        true
    }

    fn has_key_async(&mut self, key: &[u8], timeout: Duration, cb: HasKeyCallback) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        link.requests.borrow_mut().push_back(PendingRequest::has_key(
            self.topic.clone(),
            key.to_vec(),
            timeout,
            cb,
        ));
        true
    }

    fn size_async(&mut self, timeout: Duration, cb: SizeCallback) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        link.requests
            .borrow_mut()
            .push_back(PendingRequest::size(self.topic.clone(), timeout, cb));
        true
    }

    fn dump(&self) -> StoreDump {
        StoreDump::new(&self.topic, &self.store, self.sequence, Some(self.synchronized))
    }
}
