//! Frontend state-machine tests: publication generation on the authority,
//! backlog and reconciliation behavior on the replica.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{AuthorityBackend, ReplicaBackend};
use crate::proto::{Publication, Request, Response};
use crate::transport::mem::{self, MemBus};
use crate::types::{QueryStatus, StoreMap};

use super::{AuthorityFrontend, KvFrontend, ReplicaFrontend};

fn authority_with_backend() -> (Rc<RefCell<AuthorityFrontend>>, Rc<RefCell<AuthorityBackend>>) {
    let frontend = Rc::new(RefCell::new(AuthorityFrontend::new("t")));
    let backend = Rc::new(RefCell::new(AuthorityBackend::new()));
    assert!(AuthorityFrontend::add_backend(&frontend, &backend));
    (frontend, backend)
}

fn queued_messages(backend: &Rc<RefCell<AuthorityBackend>>) -> Vec<Publication> {
    backend
        .borrow()
        .publication_queue()
        .borrow()
        .iter()
        .map(|p| p.message().clone())
        .collect()
}

/// A replica backend wired to in-process channels, with the far ends held by
/// the test.
fn connected_replica() -> (Rc<RefCell<ReplicaBackend>>, mem::MemChannel, mem::MemChannel, MemBus) {
    let bus = MemBus::new();
    let (req_client, req_server) = mem::pair();
    let (push_client, pull_server) = mem::pair();
    let backend = Rc::new(RefCell::new(ReplicaBackend::new()));
    backend
        .borrow_mut()
        .connect_with(Box::new(req_client), Box::new(bus.subscriber()), Box::new(push_client))
        .unwrap();
    (backend, req_server, pull_server, bus)
}

#[test]
fn insert_publishes_post_mutation_sequence() {
    let (frontend, backend) = authority_with_backend();
    assert!(frontend.borrow_mut().insert(b"a", 7));
    assert_eq!(frontend.borrow().sequence(), 1);
    assert_eq!(
        queued_messages(&backend),
        vec![Publication::ValUpdate {
            topic: "t".into(),
            key: b"a".to_vec(),
            value: Some(7),
            sequence: 1,
        }]
    );
}

#[test]
fn remove_absent_key_fails_silently() {
    let (frontend, backend) = authority_with_backend();
    assert!(!frontend.borrow_mut().remove(b"x"));
    assert_eq!(frontend.borrow().sequence(), 0);
    assert!(queued_messages(&backend).is_empty());

    // Same contract for arithmetic on absent keys.
    assert!(!frontend.borrow_mut().increment(b"x", 1));
    assert!(!frontend.borrow_mut().decrement(b"x", 1));
    assert_eq!(frontend.borrow().sequence(), 0);
}

#[test]
fn increment_publishes_result_not_delta() {
    let (frontend, backend) = authority_with_backend();
    frontend.borrow_mut().insert(b"c", 10);
    assert!(frontend.borrow_mut().increment(b"c", 5));

    let published = queued_messages(&backend);
    assert_eq!(
        published,
        vec![
            Publication::ValUpdate { topic: "t".into(), key: b"c".to_vec(), value: Some(10), sequence: 1 },
            Publication::ValUpdate { topic: "t".into(), key: b"c".to_vec(), value: Some(15), sequence: 2 },
        ]
    );
    assert_eq!(frontend.borrow().lookup(b"c"), Some(15));
}

#[test]
fn remove_publishes_absent_value() {
    let (frontend, backend) = authority_with_backend();
    frontend.borrow_mut().insert(b"a", 1);
    assert!(frontend.borrow_mut().remove(b"a"));
    assert_eq!(
        queued_messages(&backend)[1],
        Publication::ValUpdate { topic: "t".into(), key: b"a".to_vec(), value: None, sequence: 2 }
    );
}

#[test]
fn clear_advances_sequence_even_when_empty() {
    let (frontend, backend) = authority_with_backend();
    assert!(frontend.borrow_mut().clear());
    assert_eq!(frontend.borrow().sequence(), 1);
    assert_eq!(
        queued_messages(&backend),
        vec![Publication::Clear { topic: "t".into(), sequence: 1 }]
    );
}

#[test]
fn publications_are_monotone_and_gapless() {
    let (frontend, backend) = authority_with_backend();
    {
        let mut fe = frontend.borrow_mut();
        fe.insert(b"a", 1);
        fe.insert(b"b", 2);
        fe.increment(b"a", 10);
        fe.remove(b"b");
        fe.clear();
        fe.insert(b"c", 3);
    }
    let sequences: Vec<u64> = queued_messages(&backend).iter().map(|p| p.sequence()).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn publications_fan_out_to_every_attached_backend() {
    let (frontend, first) = authority_with_backend();
    let second = Rc::new(RefCell::new(AuthorityBackend::new()));
    assert!(AuthorityFrontend::add_backend(&frontend, &second));

    frontend.borrow_mut().insert(b"a", 1);
    assert_eq!(queued_messages(&first).len(), 1);
    assert_eq!(queued_messages(&second), queued_messages(&first));

    assert!(AuthorityFrontend::rem_backend(&frontend, &second));
    frontend.borrow_mut().insert(b"b", 2);
    assert_eq!(queued_messages(&first).len(), 2);
    assert_eq!(queued_messages(&second).len(), 1);
}

#[test]
fn authority_async_queries_complete_synchronously() {
    let (frontend, _backend) = authority_with_backend();
    frontend.borrow_mut().insert(b"k", 9);

    let fired = Rc::new(Cell::new(0));
    let seen = Rc::clone(&fired);
    frontend.borrow_mut().lookup_async(
        b"k",
        Duration::from_secs(5),
        Box::new(move |key, value, status| {
            assert_eq!(key, b"k");
            assert_eq!(value, Some(9));
            assert_eq!(status, QueryStatus::Success);
            seen.set(seen.get() + 1);
        }),
    );
    // No ticks were run; completion happened inside the call.
    assert_eq!(fired.get(), 1);

    let fired = Rc::new(Cell::new(0));
    let seen = Rc::clone(&fired);
    frontend.borrow_mut().size_async(
        Duration::from_secs(5),
        Box::new(move |n, status| {
            assert_eq!(n, 1);
            assert_eq!(status, QueryStatus::Success);
            seen.set(seen.get() + 1);
        }),
    );
    assert_eq!(fired.get(), 1);
}

#[test]
fn replica_operations_require_pairing() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    assert!(!frontend.borrow_mut().insert(b"a", 1));
    assert!(!frontend.borrow_mut().clear());
    assert!(!frontend.borrow_mut().lookup_async(b"a", Duration::from_secs(1), Box::new(|_, _, _| {})));
    assert!(!ReplicaFrontend::unpair(&frontend));
}

#[test]
fn pair_requires_connected_backend() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    let backend = Rc::new(RefCell::new(ReplicaBackend::new()));
    assert!(!ReplicaFrontend::pair(&frontend, &backend));

    let (backend, _req, _pull, _bus) = connected_replica();
    assert!(ReplicaFrontend::pair(&frontend, &backend));
    // Exactly one backend per frontend.
    assert!(!ReplicaFrontend::pair(&frontend, &backend));
}

#[test]
fn pairing_queues_an_unbounded_snapshot_request() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    let (backend, _req, _pull, _bus) = connected_replica();
    assert!(ReplicaFrontend::pair(&frontend, &backend));

    let requests = backend.borrow().request_queue();
    let queue = requests.borrow();
    assert_eq!(queue.len(), 1);
    let snapshot = queue.front().unwrap();
    assert_eq!(snapshot.request(), &Request::Snapshot { topic: "t".into() });
    assert_eq!(snapshot.deadline(), None);
    assert!(!snapshot.sent());
}

#[test]
fn unpaired_frontend_can_pair_again() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    let (backend, _req, _pull, _bus) = connected_replica();
    assert!(ReplicaFrontend::pair(&frontend, &backend));
    assert!(ReplicaFrontend::unpair(&frontend));
    assert!(!frontend.borrow_mut().insert(b"a", 1));
    assert!(ReplicaFrontend::pair(&frontend, &backend));
}

#[test]
fn replica_mutators_queue_updates_without_touching_state() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    let (backend, _req, _pull, _bus) = connected_replica();
    assert!(ReplicaFrontend::pair(&frontend, &backend));

    assert!(frontend.borrow_mut().insert(b"a", 1));
    assert!(frontend.borrow_mut().increment(b"a", 2));
    assert_eq!(frontend.borrow().size(), 0);
    assert_eq!(frontend.borrow().lookup(b"a"), None);

    let updates = backend.borrow().update_queue();
    assert_eq!(updates.borrow().len(), 2);
    assert_eq!(updates.borrow()[0], b"t INSERT 1 a 1");
    assert_eq!(updates.borrow()[1], b"t += 1 a 2");
}

#[test]
fn publications_buffer_until_snapshot_arrives() {
    let mut frontend = ReplicaFrontend::new("t");
    assert!(!frontend.synchronized());

    let pub_at = |sequence, key: &[u8], value| Publication::ValUpdate {
        topic: "t".into(),
        key: key.to_vec(),
        value,
        sequence,
    };

    // Nothing applies while unsynchronized.
    assert!(!frontend.process_publication(pub_at(4, b"stale", Some(0))));
    assert!(!frontend.process_publication(pub_at(6, b"b", Some(2))));
    assert!(!frontend.process_publication(pub_at(7, b"c", Some(3))));
    assert!(!frontend.process_publication(pub_at(9, b"gap", Some(9))));
    assert_eq!(frontend.backlog_len(), 4);
    assert_eq!(frontend.size(), 0);

    // Snapshot at 5: the stale 4 and the gapped 9 are dropped, 6 and 7 apply.
    let mut store = StoreMap::default();
    store.insert(b"a".to_vec(), 1);
    frontend.apply_snapshot(store, 5);

    assert!(frontend.synchronized());
    assert_eq!(frontend.sequence(), 7);
    assert_eq!(frontend.backlog_len(), 0);
    assert_eq!(frontend.lookup(b"a"), Some(1));
    assert_eq!(frontend.lookup(b"b"), Some(2));
    assert_eq!(frontend.lookup(b"c"), Some(3));
    assert_eq!(frontend.lookup(b"stale"), None);
    assert_eq!(frontend.lookup(b"gap"), None);
}

#[test]
fn contiguous_publications_apply_in_order() {
    let mut frontend = ReplicaFrontend::new("t");
    frontend.apply_snapshot(StoreMap::default(), 0);

    assert!(frontend.process_publication(Publication::ValUpdate {
        topic: "t".into(),
        key: b"a".to_vec(),
        value: Some(1),
        sequence: 1,
    }));
    assert!(frontend.process_publication(Publication::Clear { topic: "t".into(), sequence: 2 }));
    assert_eq!(frontend.sequence(), 2);
    assert_eq!(frontend.size(), 0);
    assert!(frontend.synchronized());
}

#[test]
fn sequence_gap_desynchronizes_and_requests_snapshot() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    let (backend, _req, _pull, _bus) = connected_replica();
    assert!(ReplicaFrontend::pair(&frontend, &backend));

    frontend.borrow_mut().apply_snapshot(StoreMap::default(), 5);
    assert!(frontend.borrow().synchronized());

    let requests = backend.borrow().request_queue();
    let before = requests.borrow().len();

    // Sequence 6 never arrives; 7 exposes the gap.
    let applied = frontend.borrow_mut().process_publication(Publication::ValUpdate {
        topic: "t".into(),
        key: b"k".to_vec(),
        value: Some(1),
        sequence: 7,
    });
    assert!(!applied);
    assert!(!frontend.borrow().synchronized());
    assert_eq!(frontend.borrow().backlog_len(), 1);
    assert_eq!(requests.borrow().len(), before + 1);
    assert_eq!(
        requests.borrow().back().unwrap().request(),
        &Request::Snapshot { topic: "t".into() }
    );
}

#[test]
fn duplicate_sequence_is_treated_as_divergence() {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new("t")));
    let (backend, _req, _pull, _bus) = connected_replica();
    assert!(ReplicaFrontend::pair(&frontend, &backend));
    frontend.borrow_mut().apply_snapshot(StoreMap::default(), 3);

    // A replayed publication at or below the local sequence violates the
    // contiguity invariant just like a gap does.
    let applied = frontend.borrow_mut().process_publication(Publication::ValUpdate {
        topic: "t".into(),
        key: b"k".to_vec(),
        value: Some(1),
        sequence: 3,
    });
    assert!(!applied);
    assert!(!frontend.borrow().synchronized());
}

#[test]
fn snapshot_response_parse_matches_apply() {
    // A snapshot that traveled the wire applies identically to one handed
    // over locally.
    let mut store = StoreMap::default();
    store.insert(b"x".to_vec(), -3);
    store.insert(b"y z".to_vec(), 12);
    let wire = Response::Snapshot { store: store.clone(), sequence: 9 }.prepare();

    let Ok(Response::Snapshot { store: parsed, sequence }) = Response::parse(&wire) else {
        panic!("snapshot failed to parse");
    };
    let mut frontend = ReplicaFrontend::new("t");
    frontend.apply_snapshot(parsed, sequence);
    assert_eq!(frontend.sequence(), 9);
    assert_eq!(frontend.lookup(b"x"), Some(-3));
    assert_eq!(frontend.lookup(b"y z"), Some(12));
}
