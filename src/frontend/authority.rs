//! The canonical store for a topic.
//!
//! Every mutation increments the sequence counter and enqueues exactly one
//! publication, carrying the post-mutation sequence, on every attached
//! backend. Arithmetic publications carry the resulting value rather than the
//! delta, so subscribers need no prior state to apply them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{AuthorityBackend, BackendId, PublicationQueue};
use crate::dump::StoreDump;
use crate::proto::{PreparedPublication, Publication, Response};
use crate::types::{HasKeyCallback, LookupCallback, QueryStatus, SizeCallback, StoreMap, Topic, Value};

use super::KvFrontend;

pub struct AuthorityFrontend {
    topic: Topic,
    store: StoreMap,
    sequence: u64,
    /// Publication queues of the attached backends, keyed by backend id.
    backends: HashMap<BackendId, PublicationQueue>,
}

impl AuthorityFrontend {
    pub fn new(topic: impl Into<Topic>) -> Self {
        AuthorityFrontend {
            topic: topic.into(),
            store: StoreMap::default(),
            sequence: 0,
            backends: HashMap::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Attach a backend so future mutations are published through it. The
    /// backend routes requests and updates for this topic back here.
    pub fn add_backend(
        frontend: &Rc<RefCell<AuthorityFrontend>>,
        backend: &Rc<RefCell<AuthorityBackend>>,
    ) -> bool {
        let (id, queue) = {
            let mut be = backend.borrow_mut();
            if !be.add_frontend(Rc::clone(frontend)) {
                return false;
            }
            (be.id(), be.publication_queue())
        };
        frontend.borrow_mut().backends.insert(id, queue).is_none()
    }

    pub fn rem_backend(
        frontend: &Rc<RefCell<AuthorityFrontend>>,
        backend: &Rc<RefCell<AuthorityBackend>>,
    ) -> bool {
        let topic = frontend.borrow().topic.clone();
        let mut be = backend.borrow_mut();
        let detached = frontend.borrow_mut().backends.remove(&be.id()).is_some();
        be.rem_frontend(&topic) && detached
    }

    /// Full store copy plus the sequence it reflects. Any publication with a
    /// sequence at or below it is already folded in.
    pub fn snapshot(&self) -> Response {
        Response::Snapshot { store: self.store.clone(), sequence: self.sequence }
    }

    fn publish(&mut self, publication: Publication) {
        let prepared = Rc::new(PreparedPublication::new(publication));
        for queue in self.backends.values() {
            queue.borrow_mut().push_back(Rc::clone(&prepared));
        }
    }

    fn publish_value(&mut self, key: &[u8], value: Option<Value>) {
        self.sequence += 1;
        let publication = Publication::ValUpdate {
            topic: self.topic.clone(),
            key: key.to_vec(),
            value,
            sequence: self.sequence,
        };
        self.publish(publication);
    }
}

impl KvFrontend for AuthorityFrontend {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn insert(&mut self, key: &[u8], value: Value) -> bool {
        self.store.insert(key.to_vec(), value);
        self.publish_value(key, Some(value));
        true
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        if self.store.remove(key).is_none() {
            return false;
        }
        self.publish_value(key, None);
        true
    }

    fn increment(&mut self, key: &[u8], by: Value) -> bool {
        let Some(value) = self.store.get_mut(key) else {
            return false;
        };
        *value = value.wrapping_add(by);
        let result = *value;
        self.publish_value(key, Some(result));
        true
    }

    fn decrement(&mut self, key: &[u8], by: Value) -> bool {
        let Some(value) = self.store.get_mut(key) else {
            return false;
        };
        *value = value.wrapping_sub(by);
        let result = *value;
        self.publish_value(key, Some(result));
        true
    }

    fn clear(&mut self) -> bool {
        // The sequence advances even when the store was already empty.
        self.store.clear();
        self.sequence += 1;
        let publication = Publication::Clear { topic: self.topic.clone(), sequence: self.sequence };
        self.publish(publication);
        true
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

    // The async surface exists for API uniformity across roles; the
    // authority answers from local state immediately and synchronously.

    fn lookup_async(&mut self, key: &[u8], _timeout: Duration, cb: LookupCallback) -> bool {
        cb(key, self.lookup(key), QueryStatus::Success);
        true
    }

    fn has_key_async(&mut self, key: &[u8], _timeout: Duration, cb: HasKeyCallback) -> bool {
        cb(key, self.has_key(key), QueryStatus::Success);
        true
    }

    fn size_async(&mut self, _timeout: Duration, cb: SizeCallback) -> bool {
        cb(self.size() as u64, QueryStatus::Success);
        true
    }

    fn dump(&self) -> StoreDump {
        StoreDump::new(&self.topic, &self.store, self.sequence, None)
    }
}
