//! Transport-facing I/O drivers.
//!
//! A backend owns three channel endpoints and the queues of outbound
//! messages, and advances everything it can on each `process_io` tick without
//! ever blocking. The driving loop between ticks is external: the backend
//! reports the fds and deadline to wait on through [`SelectParams`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;
use tracing::error;

use crate::proto::{PendingRequest, SharedPublication};
use crate::transport::ChannelError;

pub mod authority;
pub mod replica;


pub use authority::AuthorityBackend;
pub use replica::ReplicaBackend;

/// Stable identity of a backend within the process, used by frontends to key
/// their attachment sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(u64);

impl BackendId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        BackendId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Queue of publications awaiting transmission. Shared between an authority
/// backend and its attached frontends so a mutation can enqueue without
/// re-entering the backend mid-tick.
pub type PublicationQueue = Rc<RefCell<VecDeque<SharedPublication>>>;

/// Queue of prepared update frames awaiting transmission.
pub type UpdateQueue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Ordered in-flight requests; the front is the next to send or the one
/// whose response is awaited.
pub type RequestQueue = Rc<RefCell<VecDeque<PendingRequest>>>;

/// What the external readiness loop should wait on before the next tick.
#[derive(Debug, Default)]
pub struct SelectParams {
    pub read_fds: Vec<RawFd>,
    pub write_fds: Vec<RawFd>,
    /// Earliest pending-request deadline, if any.
    pub deadline: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("backend is already listening")]
    AlreadyListening,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("backend is already connected")]
    AlreadyConnected,
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Sink for non-transient transport failures.
///
/// The protocol has no recovery path for a broken transport, so the default
/// sink aborts the process. Keeping the decision behind this seam lets a
/// future embedding log, reconnect, or escalate instead without touching the
/// I/O drivers.
pub trait FaultHandler {
    fn on_fatal(&self, context: &'static str, error: &ChannelError);
}

/// Default fail-fast handler.
pub struct AbortOnFault;

impl FaultHandler for AbortOnFault {
    fn on_fatal(&self, context: &'static str, error: &ChannelError) {
        error!(context, %error, "fatal transport error");
        eprintln!("fatal transport error in {context}: {error}");
        std::process::exit(1);
    }
}

/// Route a channel result: pass values through, swallow would-block, hand
/// anything else to the fault sink.
pub(crate) fn check_channel<T>(
    faults: &dyn FaultHandler,
    context: &'static str,
    result: Result<T, ChannelError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_would_block() => None,
        Err(e) => {
            faults.on_fatal(context, &e);
            None
        }
    }
}
