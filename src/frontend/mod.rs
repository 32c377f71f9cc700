//! Domain state for both node roles.
//!
//! A frontend owns the store and the sequence counter for one topic and
//! exposes the user-facing API. The authoritative variant mutates locally and
//! publishes; the replica variant forwards mutations and reconciles with the
//! authority through snapshots. Both present the same surface through
//! [`KvFrontend`], so client code can be written once against either role.

use std::time::Duration;

use crate::dump::StoreDump;
use crate::types::{HasKeyCallback, LookupCallback, SizeCallback, Value};

pub mod authority;
pub mod replica;

#[cfg(test)]
mod tests;

pub use authority::AuthorityFrontend;
pub use replica::ReplicaFrontend;

/// The uniform user-facing store API.
///
/// Mutators report whether the operation was accepted locally; on a replica
/// acceptance means the update was handed to the paired backend, not that the
/// authority has applied it. Asynchronous queries complete through their
/// callback exactly once; on the authority they complete immediately and
/// synchronously, the timeout being irrelevant there.
pub trait KvFrontend {
    fn topic(&self) -> &str;

    fn insert(&mut self, key: &[u8], value: Value) -> bool;
    fn remove(&mut self, key: &[u8]) -> bool;
    fn increment(&mut self, key: &[u8], by: Value) -> bool;
    fn decrement(&mut self, key: &[u8], by: Value) -> bool;
    fn clear(&mut self) -> bool;

    fn lookup(&self, key: &[u8]) -> Option<Value>;
    fn has_key(&self, key: &[u8]) -> bool;
    fn size(&self) -> usize;

    fn lookup_async(&mut self, key: &[u8], timeout: Duration, cb: LookupCallback) -> bool;
    fn has_key_async(&mut self, key: &[u8], timeout: Duration, cb: HasKeyCallback) -> bool;
    fn size_async(&mut self, timeout: Duration, cb: SizeCallback) -> bool;

    fn dump(&self) -> StoreDump;
}
