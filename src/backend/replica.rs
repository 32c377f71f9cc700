//! Client-side I/O driver: request, subscribe, and push endpoints.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;

use crate::frontend::{KvFrontend, ReplicaFrontend};
use crate::proto::{Completion, PendingRequest, Publication, Response};
use crate::transport::tcp::{TcpPush, TcpRequest, TcpSubscriber};
use crate::transport::{Channel, Subscription};
use crate::types::Topic;

use super::{
    check_channel, AbortOnFault, BackendId, ConnectError, FaultHandler, RequestQueue,
    SelectParams, UpdateQueue,
};

struct Endpoints {
    request: Box<dyn Channel>,
    subscribe: Box<dyn Subscription>,
    push: Box<dyn Channel>,
}

pub struct ReplicaBackend {
    id: BackendId,
    endpoints: Option<Endpoints>,
    frontends: HashMap<Topic, Rc<RefCell<ReplicaFrontend>>>,
    /// Front is the next request to send, or the one awaiting its response.
    /// At most the front is ever marked sent.
    requests: RequestQueue,
    updates: UpdateQueue,
    faults: Box<dyn FaultHandler>,
}

impl ReplicaBackend {
    pub fn new() -> Self {
        ReplicaBackend {
            id: BackendId::next(),
            endpoints: None,
            frontends: HashMap::new(),
            requests: RequestQueue::default(),
            updates: UpdateQueue::default(),
            faults: Box::new(AbortOnFault),
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn connected(&self) -> bool {
        self.endpoints.is_some()
    }

    pub fn set_fault_handler(&mut self, faults: Box<dyn FaultHandler>) {
        self.faults = faults;
    }

    /// Connect the three TCP endpoints.
    pub fn connect(
        &mut self,
        request_addr: &str,
        sub_addr: &str,
        push_addr: &str,
    ) -> Result<(), ConnectError> {
        let connect_err = |addr: &str| {
            let addr = addr.to_string();
            move |source| ConnectError::Connect { addr, source }
        };
        if self.connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        let request = TcpRequest::connect(request_addr).map_err(connect_err(request_addr))?;
        let subscribe = TcpSubscriber::connect(sub_addr).map_err(connect_err(sub_addr))?;
        let push = TcpPush::connect(push_addr).map_err(connect_err(push_addr))?;
        self.connect_with(Box::new(request), Box::new(subscribe), Box::new(push))
    }

    /// Install already-constructed endpoints; the transport-agnostic form of
    /// [`connect`](Self::connect).
    pub fn connect_with(
        &mut self,
        request: Box<dyn Channel>,
        subscribe: Box<dyn Subscription>,
        push: Box<dyn Channel>,
    ) -> Result<(), ConnectError> {
        if self.connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        self.endpoints = Some(Endpoints { request, subscribe, push });
        Ok(())
    }

    pub fn close(&mut self) -> bool {
        self.endpoints = None;
        true
    }

    /// Subscribe the frontend's topic and queue the initial snapshot request.
    /// The subscription precedes the snapshot request, so any publication
    /// newer than the snapshot is already being received and buffered.
    pub fn add_frontend(&mut self, frontend: Rc<RefCell<ReplicaFrontend>>) -> bool {
        let Some(ep) = self.endpoints.as_mut() else {
            return false;
        };
        let topic = frontend.borrow().topic().to_string();
        if self.frontends.contains_key(&topic) {
            return false;
        }
        ep.subscribe.subscribe(topic.as_bytes());
        self.requests
            .borrow_mut()
            .push_back(PendingRequest::snapshot(topic.clone()));
        self.frontends.insert(topic, frontend);
        true
    }

    pub fn rem_frontend(&mut self, topic: &str) -> bool {
        if self.frontends.remove(topic).is_none() {
            return false;
        }
        if let Some(ep) = self.endpoints.as_mut() {
            ep.subscribe.unsubscribe(topic.as_bytes());
        }
        true
    }

    /// Shared handle to the outbound update queue, for the paired frontend.
    pub fn update_queue(&self) -> UpdateQueue {
        Rc::clone(&self.updates)
    }

    /// Shared handle to the in-flight request list, for the paired frontend.
    pub fn request_queue(&self) -> RequestQueue {
        Rc::clone(&self.requests)
    }

    /// One non-blocking tick: flush updates, expire overdue requests, advance
    /// the lock-step request channel, then take one publication. Returns
    /// whether output is still queued.
    pub fn process_io(&mut self) -> bool {
        if self.endpoints.is_none() {
            return false;
        }
        self.pump_endpoints();
        self.drain_updates();
        self.expire_requests(Instant::now());
        self.advance_request();
        self.drain_subscription();
        self.has_pending_output()
    }

    pub fn has_pending_output(&self) -> bool {
        if !self.updates.borrow().is_empty() {
            return true;
        }
        self.requests.borrow().front().is_some_and(|r| !r.sent())
    }

    pub fn select_params(&self) -> SelectParams {
        let mut params = SelectParams::default();
        if let Some(ep) = &self.endpoints {
            ep.request.read_fds(&mut params.read_fds);
            ep.subscribe.read_fds(&mut params.read_fds);
            if !self.updates.borrow().is_empty() || ep.push.has_buffered_output() {
                ep.push.write_fds(&mut params.write_fds);
            }
            let front_unsent = self.requests.borrow().front().is_some_and(|r| !r.sent());
            if front_unsent || ep.request.has_buffered_output() {
                ep.request.write_fds(&mut params.write_fds);
            }
        }
        params.deadline = self
            .requests
            .borrow()
            .iter()
            .filter_map(|r| r.deadline())
            .min();
        params
    }

    fn pump_endpoints(&mut self) {
        let results = {
            let Some(ep) = self.endpoints.as_mut() else { return };
            [
                ("request pump", ep.request.pump()),
                ("subscribe pump", ep.subscribe.pump()),
                ("push pump", ep.push.pump()),
            ]
        };
        for (context, result) in results {
            check_channel(self.faults.as_ref(), context, result);
        }
    }

    fn drain_updates(&mut self) {
        loop {
            let front = self.updates.borrow().front().cloned();
            let Some(wire) = front else {
                return;
            };
            let result = {
                let Some(ep) = self.endpoints.as_mut() else { return };
                ep.push.try_send(&wire)
            };
            if check_channel(self.faults.as_ref(), "update send", result).is_none() {
                return;
            }
            self.updates.borrow_mut().pop_front();
        }
    }

    /// Drop every request whose deadline has passed, firing its callback with
    /// the timeout code. Callbacks may enqueue new requests; those keep their
    /// position after the surviving ones.
    fn expire_requests(&mut self, now: Instant) {
        if !self.requests.borrow().iter().any(|r| r.expired(now)) {
            return;
        }
        let drained: VecDeque<PendingRequest> = std::mem::take(&mut *self.requests.borrow_mut());
        let mut kept = VecDeque::with_capacity(drained.len());
        for request in drained {
            if request.expired(now) {
                debug!(topic = request.topic(), "request timed out");
                request.expire();
            } else {
                kept.push_back(request);
            }
        }
        let mut queue = self.requests.borrow_mut();
        kept.append(&mut queue);
        *queue = kept;
    }

    /// Lock-step request channel: if the front request is out, try to collect
    /// its response; otherwise try to put it on the wire.
    fn advance_request(&mut self) {
        let front_sent = {
            let queue = self.requests.borrow();
            match queue.front() {
                Some(front) => front.sent(),
                None => return,
            }
        };
        if front_sent {
            let result = {
                let Some(ep) = self.endpoints.as_mut() else { return };
                ep.request.try_recv()
            };
            let Some(frame) = check_channel(self.faults.as_ref(), "response receive", result)
            else {
                return;
            };
            let Some(pending) = self.requests.borrow_mut().pop_front() else {
                return;
            };
            let response = match Response::parse(&frame) {
                Ok(response) => Some(response),
                Err(e) => {
                    debug!(error = %e, "unparseable response");
                    None
                }
            };
            let topic = pending.topic().to_string();
            let frontend = self.frontends.get(&topic).cloned();
            match pending.complete(response) {
                Completion::Done => {}
                Completion::ApplySnapshot { store, sequence } => match frontend {
                    Some(fe) => fe.borrow_mut().apply_snapshot(store, sequence),
                    None => debug!(%topic, "snapshot arrived for unpaired topic"),
                },
                Completion::RetrySnapshot => {
                    if frontend.is_some() {
                        self.requests
                            .borrow_mut()
                            .push_back(PendingRequest::snapshot(topic));
                    }
                }
            }
        } else {
            let result = {
                let queue = self.requests.borrow();
                let Some(front) = queue.front() else { return };
                let Some(ep) = self.endpoints.as_mut() else { return };
                ep.request.try_send(front.wire())
            };
            if check_channel(self.faults.as_ref(), "request send", result).is_some() {
                if let Some(front) = self.requests.borrow_mut().front_mut() {
                    front.mark_sent();
                }
            }
        }
    }

    /// Take one publication and route it to the subscribed frontend.
    fn drain_subscription(&mut self) {
        let result = {
            let Some(ep) = self.endpoints.as_mut() else { return };
            ep.subscribe.try_recv()
        };
        let Some(frame) = check_channel(self.faults.as_ref(), "publication receive", result)
        else {
            return;
        };
        match Publication::parse(&frame) {
            Ok(publication) => match self.frontends.get(publication.topic()).cloned() {
                Some(frontend) => {
                    frontend.borrow_mut().process_publication(publication);
                }
                None => {
                    debug!(topic = publication.topic(), "publication for unknown topic dropped")
                }
            },
            Err(e) => debug!(error = %e, "malformed publication dropped"),
        }
    }
}

impl Default for ReplicaBackend {
    fn default() -> Self {
        Self::new()
    }
}
