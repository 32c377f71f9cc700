//! Transport realization tests: in-process channels and framed TCP loopback.

use std::thread;
use std::time::{Duration, Instant};

use super::mem::{self, MemBus};
use super::tcp::{TcpPublisher, TcpPull, TcpPush, TcpReply, TcpRequest, TcpSubscriber};
use super::{Channel, ChannelError, Subscription};

/// Poll a non-blocking receive until a frame arrives or the deadline passes.
fn recv_within(ch: &mut dyn Channel, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    loop {
        match ch.try_recv() {
            Ok(frame) => return Some(frame),
            Err(ChannelError::WouldBlock) => {
                if Instant::now() > deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(other) => panic!("receive failed: {other}"),
        }
    }
}

#[test]
fn mem_pair_round_trip() {
    let (mut a, mut b) = mem::pair();
    assert!(matches!(a.try_recv(), Err(ChannelError::WouldBlock)));

    a.try_send(b"hello").unwrap();
    assert_eq!(b.try_recv().unwrap(), b"hello");
    assert!(matches!(b.try_recv(), Err(ChannelError::WouldBlock)));

    b.try_send(b"reply").unwrap();
    assert_eq!(a.try_recv().unwrap(), b"reply");
}

#[test]
fn mem_bus_fans_out_with_prefix_filter() {
    let bus = MemBus::new();
    let mut publisher = bus.publisher();
    let mut sub_a = bus.subscriber();
    let mut sub_b = bus.subscriber();
    sub_a.subscribe(b"alpha");
    sub_b.subscribe(b"beta");

    publisher.try_send(b"alpha one").unwrap();
    publisher.try_send(b"beta two").unwrap();

    assert_eq!(sub_a.try_recv().unwrap(), b"alpha one");
    assert!(matches!(sub_a.try_recv(), Err(ChannelError::WouldBlock)));
    // The non-matching frame was consumed and dropped by the filter.
    assert_eq!(sub_b.try_recv().unwrap(), b"beta two");

    sub_b.unsubscribe(b"beta");
    publisher.try_send(b"beta three").unwrap();
    assert!(matches!(sub_b.try_recv(), Err(ChannelError::WouldBlock)));
}

#[test]
fn tcp_request_reply_round_trip() {
    let mut reply = TcpReply::bind("127.0.0.1:0").unwrap();
    let addr = reply.local_addr().unwrap();
    let mut request = TcpRequest::connect(&addr.to_string()).unwrap();

    request.try_send(b"question").unwrap();
    let got = recv_within(&mut reply, Duration::from_secs(2)).expect("request arrives");
    assert_eq!(got, b"question");

    reply.try_send(b"answer").unwrap();
    let got = recv_within(&mut request, Duration::from_secs(2)).expect("reply arrives");
    assert_eq!(got, b"answer");
}

#[test]
fn tcp_reply_pins_one_peer_at_a_time() {
    let mut reply = TcpReply::bind("127.0.0.1:0").unwrap();
    let addr = reply.local_addr().unwrap().to_string();
    let mut first = TcpRequest::connect(&addr).unwrap();
    let mut second = TcpRequest::connect(&addr).unwrap();

    first.try_send(b"one").unwrap();
    second.try_send(b"two").unwrap();

    let got = recv_within(&mut reply, Duration::from_secs(2)).expect("first request");
    // While a reply is owed, no further request is surfaced.
    assert!(matches!(reply.try_recv(), Err(ChannelError::WouldBlock)));

    reply.try_send(b"ack").unwrap();
    let other = recv_within(&mut reply, Duration::from_secs(2)).expect("second request");
    assert_ne!(got, other);

    reply.try_send(b"ack").unwrap();
    assert_eq!(recv_within(&mut first, Duration::from_secs(2)).unwrap(), b"ack");
    assert_eq!(recv_within(&mut second, Duration::from_secs(2)).unwrap(), b"ack");
}

#[test]
fn tcp_publish_subscribe_filters_by_prefix() {
    let mut publisher = TcpPublisher::bind("127.0.0.1:0").unwrap();
    let addr = publisher.local_addr().unwrap().to_string();

    let mut sub_a = TcpSubscriber::connect(&addr).unwrap();
    sub_a.subscribe(b"t0");
    let mut sub_b = TcpSubscriber::connect(&addr).unwrap();
    sub_b.subscribe(b"t1");

    // Wait for the publisher to accept both subscribers before publishing;
    // pub/sub has no retention.
    let deadline = Instant::now() + Duration::from_secs(2);
    while publisher.peer_count() < 2 {
        publisher.pump().unwrap();
        assert!(Instant::now() < deadline, "subscribers not accepted in time");
        thread::sleep(Duration::from_millis(2));
    }

    publisher.try_send(b"t0 first").unwrap();
    publisher.try_send(b"t1 second").unwrap();

    assert_eq!(recv_within(&mut sub_a, Duration::from_secs(2)).unwrap(), b"t0 first");
    assert_eq!(recv_within(&mut sub_b, Duration::from_secs(2)).unwrap(), b"t1 second");
    assert!(matches!(sub_a.try_recv(), Err(ChannelError::WouldBlock)));
}

#[test]
fn tcp_push_pull_delivers_in_order() {
    let mut pull = TcpPull::bind("127.0.0.1:0").unwrap();
    let addr = pull.local_addr().unwrap().to_string();
    let mut push = TcpPush::connect(&addr).unwrap();

    for msg in [&b"a"[..], b"b", b"c"] {
        push.try_send(msg).unwrap();
    }

    for expected in [&b"a"[..], b"b", b"c"] {
        let got = recv_within(&mut pull, Duration::from_secs(2)).expect("update arrives");
        assert_eq!(got, expected);
    }
}

#[test]
fn tcp_large_frame_survives_partial_transfers() {
    let mut pull = TcpPull::bind("127.0.0.1:0").unwrap();
    let addr = pull.local_addr().unwrap().to_string();
    let mut push = TcpPush::connect(&addr).unwrap();

    // Large enough to exceed socket buffers and force multiple flushes.
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    push.try_send(&payload).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        push.pump().unwrap();
        match pull.try_recv() {
            Ok(frame) => {
                assert_eq!(frame, payload);
                break;
            }
            Err(ChannelError::WouldBlock) => {
                assert!(Instant::now() < deadline, "frame did not arrive");
                thread::sleep(Duration::from_millis(2));
            }
            Err(other) => panic!("receive failed: {other}"),
        }
    }
}
