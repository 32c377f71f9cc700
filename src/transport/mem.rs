//! In-process channel realization backed by crossbeam channels.
//!
//! Used by the protocol tests and by single-process experiments; carries the
//! same would-block semantics as the socket realization but exposes no file
//! descriptors, so a driving loop falls back to its timeout tick.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use super::{Channel, ChannelError, Subscription};

/// A bidirectional in-process link. Serves as either end of the lock-step
/// request/reply pair or the pipeline push/pull pair.
pub struct MemChannel {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Create two connected [`MemChannel`] endpoints.
pub fn pair() -> (MemChannel, MemChannel) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (MemChannel { tx: a_tx, rx: a_rx }, MemChannel { tx: b_tx, rx: b_rx })
}

impl Channel for MemChannel {
    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        self.tx.send(frame.to_vec()).map_err(|_| ChannelError::Disconnected)
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(frame),
            Err(TryRecvError::Empty) => Err(ChannelError::WouldBlock),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

/// Fan-out hub for the broadcast pattern. Cloneable handle; create the
/// publisher endpoint once and any number of subscriber endpoints, before or
/// after the publisher is handed to a backend.
#[derive(Clone, Default)]
pub struct MemBus {
    subscribers: Rc<RefCell<Vec<Sender<Vec<u8>>>>>,
}

impl MemBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> MemPublisher {
        MemPublisher { subscribers: Rc::clone(&self.subscribers) }
    }

    pub fn subscriber(&self) -> MemSubscriber {
        let (tx, rx) = unbounded();
        self.subscribers.borrow_mut().push(tx);
        MemSubscriber { rx, filters: Vec::new() }
    }
}

pub struct MemPublisher {
    subscribers: Rc<RefCell<Vec<Sender<Vec<u8>>>>>,
}

impl Channel for MemPublisher {
    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        // Dead subscribers are reaped here; delivery to the rest proceeds.
        self.subscribers
            .borrow_mut()
            .retain(|tx| tx.send(frame.to_vec()).is_ok());
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        Err(unsupported("publishers do not receive"))
    }
}

pub struct MemSubscriber {
    rx: Receiver<Vec<u8>>,
    filters: Vec<Vec<u8>>,
}

impl Channel for MemSubscriber {
    fn try_send(&mut self, _frame: &[u8]) -> Result<(), ChannelError> {
        Err(unsupported("subscribers do not send"))
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        // Messages not matching any subscribed prefix are consumed and
        // dropped, exactly like a transport-side subscription filter.
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if self.filters.iter().any(|p| frame.starts_with(p)) {
                        return Ok(frame);
                    }
                }
                Err(TryRecvError::Empty) => return Err(ChannelError::WouldBlock),
                Err(TryRecvError::Disconnected) => return Err(ChannelError::Disconnected),
            }
        }
    }
}

impl Subscription for MemSubscriber {
    fn subscribe(&mut self, prefix: &[u8]) {
        self.filters.push(prefix.to_vec());
    }

    fn unsubscribe(&mut self, prefix: &[u8]) {
        self.filters.retain(|p| p != prefix);
    }
}

fn unsupported(what: &str) -> ChannelError {
    ChannelError::Io(io::Error::new(io::ErrorKind::Unsupported, what.to_string()))
}
