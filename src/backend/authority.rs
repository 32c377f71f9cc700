//! Server-side I/O driver: reply, publish, and pull endpoints.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::frontend::{AuthorityFrontend, KvFrontend};
use crate::proto::{Request, Response, Update};
use crate::transport::tcp::{TcpPublisher, TcpPull, TcpReply};
use crate::transport::Channel;
use crate::types::Topic;

use super::{
    check_channel, AbortOnFault, BackendId, FaultHandler, ListenError, PublicationQueue,
    SelectParams,
};

struct Endpoints {
    reply: Box<dyn Channel>,
    publish: Box<dyn Channel>,
    pull: Box<dyn Channel>,
}

pub struct AuthorityBackend {
    id: BackendId,
    endpoints: Option<Endpoints>,
    frontends: HashMap<Topic, Rc<RefCell<AuthorityFrontend>>>,
    publications: PublicationQueue,
    /// Serialized reply awaiting transmission; at most one at a time.
    pending_response: Option<Vec<u8>>,
    faults: Box<dyn FaultHandler>,
}

impl AuthorityBackend {
    pub fn new() -> Self {
        AuthorityBackend {
            id: BackendId::next(),
            endpoints: None,
            frontends: HashMap::new(),
            publications: PublicationQueue::default(),
            pending_response: None,
            faults: Box::new(AbortOnFault),
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn listening(&self) -> bool {
        self.endpoints.is_some()
    }

    pub fn set_fault_handler(&mut self, faults: Box<dyn FaultHandler>) {
        self.faults = faults;
    }

    /// Bind the three TCP endpoints.
    pub fn listen(
        &mut self,
        reply_addr: &str,
        pub_addr: &str,
        pull_addr: &str,
    ) -> Result<(), ListenError> {
        let bind_err = |addr: &str| {
            let addr = addr.to_string();
            move |source| ListenError::Bind { addr, source }
        };
        if self.listening() {
            return Err(ListenError::AlreadyListening);
        }
        let reply = TcpReply::bind(reply_addr).map_err(bind_err(reply_addr))?;
        let publish = TcpPublisher::bind(pub_addr).map_err(bind_err(pub_addr))?;
        let pull = TcpPull::bind(pull_addr).map_err(bind_err(pull_addr))?;
        self.listen_with(Box::new(reply), Box::new(publish), Box::new(pull))
    }

    /// Install already-constructed endpoints; the transport-agnostic form of
    /// [`listen`](Self::listen).
    pub fn listen_with(
        &mut self,
        reply: Box<dyn Channel>,
        publish: Box<dyn Channel>,
        pull: Box<dyn Channel>,
    ) -> Result<(), ListenError> {
        if self.listening() {
            return Err(ListenError::AlreadyListening);
        }
        self.endpoints = Some(Endpoints { reply, publish, pull });
        Ok(())
    }

    /// Release the endpoints. Unsent publications are discarded; subscribers
    /// left behind resynchronize via snapshot if an equivalent backend comes
    /// back.
    pub fn close(&mut self) -> bool {
        self.endpoints = None;
        self.pending_response = None;
        true
    }

    /// Register a frontend as the authority for its topic.
    pub fn add_frontend(&mut self, frontend: Rc<RefCell<AuthorityFrontend>>) -> bool {
        let topic = frontend.borrow().topic().to_string();
        if self.frontends.contains_key(&topic) {
            return false;
        }
        self.frontends.insert(topic, frontend);
        true
    }

    pub fn rem_frontend(&mut self, topic: &str) -> bool {
        self.frontends.remove(topic).is_some()
    }

    /// Shared handle to the outbound publication queue, given to attached
    /// frontends at attach time.
    pub fn publication_queue(&self) -> PublicationQueue {
        Rc::clone(&self.publications)
    }

    pub fn has_pending_response(&self) -> bool {
        self.pending_response.is_some()
    }

    pub fn queued_publications(&self) -> usize {
        self.publications.borrow().len()
    }

    /// One non-blocking tick: drain one update from the pull channel, advance
    /// the reply channel, then send publications until the transport pushes
    /// back. Returns whether output is still queued.
    pub fn process_io(&mut self) -> bool {
        if self.endpoints.is_none() {
            return false;
        }
        self.pump_endpoints();
        self.drain_pull();
        self.advance_reply();
        self.drain_publications();
        self.has_pending_output()
    }

    pub fn has_pending_output(&self) -> bool {
        self.pending_response.is_some() || !self.publications.borrow().is_empty()
    }

    pub fn select_params(&self) -> SelectParams {
        let mut params = SelectParams::default();
        if let Some(ep) = &self.endpoints {
            ep.reply.read_fds(&mut params.read_fds);
            ep.pull.read_fds(&mut params.read_fds);
            ep.publish.read_fds(&mut params.read_fds);
            if !self.publications.borrow().is_empty() || ep.publish.has_buffered_output() {
                ep.publish.write_fds(&mut params.write_fds);
            }
            if self.pending_response.is_some() || ep.reply.has_buffered_output() {
                ep.reply.write_fds(&mut params.write_fds);
            }
        }
        params
    }

    fn pump_endpoints(&mut self) {
        let results = {
            let Some(ep) = self.endpoints.as_mut() else { return };
            [
                ("reply pump", ep.reply.pump()),
                ("publish pump", ep.publish.pump()),
                ("pull pump", ep.pull.pump()),
            ]
        };
        for (context, result) in results {
            check_channel(self.faults.as_ref(), context, result);
        }
    }

    /// Receive one update and route it to the owning frontend, which mutates
    /// its store and emits the consequent publication as a side effect.
    fn drain_pull(&mut self) {
        let result = {
            let Some(ep) = self.endpoints.as_mut() else { return };
            ep.pull.try_recv()
        };
        let Some(frame) = check_channel(self.faults.as_ref(), "pull receive", result) else {
            return;
        };
        match Update::parse(&frame) {
            Ok(update) => match self.frontends.get(update.topic()).cloned() {
                Some(frontend) => apply_update(&mut frontend.borrow_mut(), update),
                None => debug!(topic = update.topic(), "update for unknown topic dropped"),
            },
            Err(e) => debug!(error = %e, "malformed update dropped"),
        }
    }

    fn advance_reply(&mut self) {
        // Flush the owed response first.
        if let Some(wire) = self.pending_response.clone() {
            let result = {
                let Some(ep) = self.endpoints.as_mut() else { return };
                ep.reply.try_send(&wire)
            };
            if check_channel(self.faults.as_ref(), "response send", result).is_some() {
                self.pending_response = None;
            }
        }
        // With the reply slot free, take the next request.
        if self.pending_response.is_none() {
            let result = {
                let Some(ep) = self.endpoints.as_mut() else { return };
                ep.reply.try_recv()
            };
            let Some(frame) = check_channel(self.faults.as_ref(), "request receive", result)
            else {
                return;
            };
            self.pending_response = match Request::parse(&frame) {
                Err(e) => {
                    debug!(error = %e, "malformed request");
                    Some(Response::Invalid { reason: "malformed".into() }.prepare())
                }
                Ok(request) => match self.frontends.get(request.topic()) {
                    Some(frontend) => Some(respond(&frontend.borrow(), &request).prepare()),
                    None => {
                        // No authority for the topic: drop silently and let
                        // the requester time out.
                        debug!(topic = request.topic(), "request for unknown topic dropped");
                        None
                    }
                },
            };
        }
    }

    fn drain_publications(&mut self) {
        loop {
            let front = self.publications.borrow().front().cloned();
            let Some(publication) = front else {
                return;
            };
            let result = {
                let Some(ep) = self.endpoints.as_mut() else { return };
                ep.publish.try_send(publication.wire())
            };
            if check_channel(self.faults.as_ref(), "publication send", result).is_none() {
                return;
            }
            self.publications.borrow_mut().pop_front();
        }
    }
}

impl Default for AuthorityBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Answer a request against the owning frontend.
fn respond(frontend: &AuthorityFrontend, request: &Request) -> Response {
    match request {
        Request::Lookup { key, .. } => Response::Lookup(frontend.lookup(key)),
        Request::HasKey { key, .. } => Response::HasKey(frontend.has_key(key)),
        Request::Size { .. } => Response::Size(frontend.size() as u64),
        Request::Snapshot { .. } => frontend.snapshot(),
    }
}

/// Apply a pulled update through the frontend's mutators, so sequencing and
/// publication fan-out follow the same path as local mutations.
fn apply_update(frontend: &mut AuthorityFrontend, update: Update) {
    match update {
        Update::Insert { key, value, .. } => {
            frontend.insert(&key, value);
        }
        Update::Remove { key, .. } => {
            frontend.remove(&key);
        }
        Update::Increment { key, by, .. } => {
            frontend.increment(&key, by);
        }
        Update::Decrement { key, by, .. } => {
            frontend.decrement(&key, by);
        }
        Update::Clear { .. } => {
            frontend.clear();
        }
    }
}
