//! End-to-end behavior of the bus facade over the mock transport:
//! loopback round-trips, counters, backpressure, handler dispatch, and
//! cyclic message lifecycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canlink::{CanBus, Frame, MockTransport, RxFilter, Transport};
use embedded_can::Frame as _;
use hex_literal::hex;

/// Route worker logs through RUST_LOG when set.
fn init_diagnostics() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `predicate` until it holds or the deadline passes.
fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn loopback_roundtrip_preserves_frame() {
    init_diagnostics();
    let bus = CanBus::new(MockTransport::new(), true);

    let sent = Frame::new_ext(0x1234_5678 & 0x1FFF_FFFF, &hex!("DE AD BE EF")).unwrap();
    assert!(bus.send(&sent));

    let received = bus.next_message(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(received.id(), sent.id());
    assert_eq!(received.data(), sent.data());
    assert_eq!(received.is_extended(), sent.is_extended());
    bus.shutdown();
}

#[test]
fn lifetime_sent_counts_every_accepted_send() {
    let bus = CanBus::new(MockTransport::new(), false);
    let frame = Frame::new_std(0x123, &hex!("01 02")).unwrap();
    for _ in 0..25 {
        assert!(bus.send(&frame));
    }
    assert_eq!(bus.lifetime_sent(), 25);
    bus.shutdown();
}

#[test]
fn outbound_backpressure_fails_the_third_send() {
    // Nothing drains the mock's outbound queue, so capacity 2 means the
    // third send must time out.
    let bus = CanBus::new(MockTransport::with_capacity(500, 2), false);

    let msg1 = Frame::new_ext(0x123, &hex!("01 02")).unwrap();
    let msg2 = Frame::new_ext(0x1234, &hex!("01 02 03")).unwrap();

    assert!(bus.send(&msg1));
    assert!(bus.send(&msg2));
    assert!(!bus.send(&msg1));
    assert_eq!(bus.lifetime_sent(), 2);
    bus.shutdown();
}

#[test]
fn handlers_see_exactly_their_matches() {
    let mock = MockTransport::new();
    let bus = CanBus::new(mock.clone(), false);

    let msg1 = Frame::new_ext(0x123, &hex!("01 02")).unwrap();
    let msg2 = Frame::new_ext(0x1234, &hex!("01 02 03")).unwrap();
    let msg3 = Frame::new_ext(0x12345, &hex!("01 02 03 04")).unwrap();

    let log: Arc<Mutex<Vec<(&'static str, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    for (tag, filter) in [
        ("h1", RxFilter::Id(msg1.id())),
        ("h2", RxFilter::Id(msg2.id())),
        ("h3", RxFilter::Id(msg3.id())),
        ("any", RxFilter::Any { extended: true }),
    ] {
        let log = log.clone();
        bus.add_receive_handler(filter, move |frame: &Frame| {
            log.lock().unwrap().push((tag, frame.raw_id()));
        });
    }

    for frame in [&msg1, &msg2, &msg3] {
        assert!(mock.inject(frame.clone()));
    }

    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().unwrap().len() == 6
    }));
    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![
            ("h1", 0x123),
            ("any", 0x123),
            ("h2", 0x1234),
            ("any", 0x1234),
            ("h3", 0x12345),
            ("any", 0x12345),
        ]
    );
    bus.shutdown();
}

#[test]
fn specific_handler_ignores_other_ids() {
    let mock = MockTransport::new();
    let bus = CanBus::new(mock.clone(), false);

    let hits = Arc::new(Mutex::new(0u32));
    let counter = hits.clone();
    let wanted = Frame::new_ext(0x77, &[]).unwrap();
    bus.add_receive_handler(RxFilter::Id(wanted.id()), move |_| {
        *counter.lock().unwrap() += 1;
    });

    mock.inject(Frame::new_ext(0x76, &[]).unwrap());
    mock.inject(wanted.clone());
    // Same id bits as a standard frame must not match either
    mock.inject(Frame::new_std(0x77, &[]).unwrap());
    mock.inject(wanted);

    assert!(wait_until(Duration::from_secs(2), || {
        *hits.lock().unwrap() == 2
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*hits.lock().unwrap(), 2);
    bus.shutdown();
}

#[test]
fn cyclic_update_swaps_payload_then_stop_halts() {
    let period = Duration::from_millis(100);
    let bus = CanBus::new(MockTransport::new(), true);

    let p1 = Frame::new_ext(0xA0, &hex!("11 11")).unwrap();
    let p2 = Frame::new_ext(0xA0, &hex!("22 22")).unwrap();

    assert!(bus.add_cyclic_message(p1.clone(), period, Some("A".into())));
    std::thread::sleep(Duration::from_millis(500));
    assert!(bus.update_cyclic_message(p2.clone(), Some("A".into())));

    // After the update, loopback traffic must switch to the new payload
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut saw_updated = false;
    while Instant::now() < deadline && !saw_updated {
        if let Some(frame) = bus.next_message(Some(Duration::from_millis(200))) {
            saw_updated = frame.data() == p2.data();
        }
    }
    assert!(saw_updated);

    assert!(bus.stop_cyclic_message("A"));
    // Let in-flight emissions settle, then drain them
    std::thread::sleep(period);
    while bus.next_message(Some(Duration::from_millis(20))).is_some() {}

    // Well past 2x period after the stop: silence
    std::thread::sleep(Duration::from_millis(300));
    assert!(bus.next_message(Some(Duration::from_millis(20))).is_none());
    bus.shutdown();
}

#[test]
fn stopped_key_can_be_readded() {
    let bus = CanBus::new(MockTransport::new(), false);
    let frame = Frame::new_ext(0xB0, &[1]).unwrap();

    assert!(bus.add_cyclic_message(frame.clone(), Duration::from_millis(50), Some("B".into())));
    assert!(bus.stop_cyclic_message("B"));
    assert_eq!(bus.cyclic_messages(), vec![("B".into(), false)]);

    assert!(bus.add_cyclic_message(frame, Duration::from_millis(50), Some("B".into())));
    assert_eq!(bus.cyclic_messages(), vec![("B".into(), true)]);

    assert!(!bus.stop_cyclic_message("unknown"));
    bus.shutdown();
}

#[test]
fn update_of_unknown_key_fails() {
    let bus = CanBus::new(MockTransport::new(), false);
    let frame = Frame::new_ext(0xC0, &[1]).unwrap();
    assert!(!bus.update_cyclic_message(frame, Some("missing".into())));
    bus.shutdown();
}
