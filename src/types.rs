//! Shared aliases and result codes for the store domain.

use std::collections::HashMap;

/// Keys are arbitrary byte strings; the wire format length-prefixes them so
/// spaces and binary content survive transit.
pub type Key = Vec<u8>;

/// Values are signed 64-bit integers so `increment`/`decrement` are closed
/// over the value domain.
pub type Value = i64;

/// Topics are opaque identifier strings partitioning the key space.
/// One authoritative frontend per topic.
pub type Topic = String;

/// The local map held by a frontend.
pub type StoreMap = HashMap<Key, Value>;

/// Outcome code delivered to asynchronous query callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// The matching response arrived and was dispatched.
    Success,
    /// The request's deadline passed before a response arrived.
    TimedOut,
    /// The authority answered with an invalid-request response.
    InvalidRequest,
    /// The reply could not be parsed or its kind did not match the request.
    InvalidResponse,
}

/// Callback for `lookup_async`. Receives the queried key, the value if
/// present, and the outcome code. Invoked exactly once.
pub type LookupCallback = Box<dyn FnOnce(&[u8], Option<Value>, QueryStatus)>;

/// Callback for `has_key_async`.
pub type HasKeyCallback = Box<dyn FnOnce(&[u8], bool, QueryStatus)>;

/// Callback for `size_async`.
pub type SizeCallback = Box<dyn FnOnce(u64, QueryStatus)>;
