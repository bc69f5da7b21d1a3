//! Message pump behavior against real socket pairs.

mod common;

use bytes::Bytes;
use common::{Event, RecordingListener, drain, init_tracing, pump_until};
use parabuild_ipc::{Channel, ChannelError, IpcError, LivenessPolicy, MessagePump};
use proptest::prelude::*;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

const LIMIT: Duration = Duration::from_secs(5);

fn registered(
    pump: &mut MessagePump,
    listener: &Rc<RecordingListener>,
) -> (Rc<Channel>, Channel) {
    let (parent, child) = Channel::pair().unwrap();
    let parent = Rc::new(parent);
    pump.add_channel(Rc::clone(&parent), listener.clone()).unwrap();
    (parent, child)
}

#[test]
fn test_messages_arrive_in_send_order() {
    init_tracing();
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, child) = registered(&mut pump, &listener);

    for i in 0..20 {
        child.send(format!("msg-{i}").as_bytes()).unwrap();
    }
    drop(child);
    drain(&mut pump, LIMIT);

    let expected: Vec<Bytes> = (0..20).map(|i| Bytes::from(format!("msg-{i}"))).collect();
    assert_eq!(listener.messages(parent.id()), expected);
    assert_eq!(listener.errors(parent.id()), vec![ChannelError::Eof]);
}

#[test]
fn test_large_frames_split_across_reads() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, child) = registered(&mut pump, &listener);

    let writer = thread::spawn(move || {
        for byte in [1u8, 2, 3] {
            child.send(&vec![byte; 300 * 1024]).unwrap();
        }
    });
    pump_until(&mut pump, LIMIT, || listener.messages(parent.id()).len() == 3);
    writer.join().unwrap();

    let messages = listener.messages(parent.id());
    for (message, byte) in messages.iter().zip([1u8, 2, 3]) {
        assert_eq!(message.len(), 300 * 1024);
        assert!(message.iter().all(|b| *b == byte));
    }
}

#[test]
fn test_add_channel_twice_fails_without_side_effects() {
    let mut pump = MessagePump::new().unwrap();
    let first = Rc::new(RecordingListener::new());
    let second = Rc::new(RecordingListener::new());
    let (parent, child) = registered(&mut pump, &first);

    let err = pump.add_channel(Rc::clone(&parent), second.clone()).unwrap_err();
    assert!(matches!(err, IpcError::AlreadyRegistered { .. }));
    assert_eq!(pump.len(), 1);
    assert!(pump.is_registered(&parent));

    child.send(b"hello").unwrap();
    pump.process_events().unwrap();
    assert_eq!(first.messages(parent.id()), vec![Bytes::from_static(b"hello")]);
    assert!(second.events().is_empty());
}

#[test]
fn test_channel_registered_with_one_pump_only() {
    let mut pump = MessagePump::new().unwrap();
    let mut other = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, _child) = registered(&mut pump, &listener);

    assert!(matches!(
        other.add_channel(Rc::clone(&parent), listener.clone()),
        Err(IpcError::AlreadyRegistered { .. })
    ));
    assert!(!other.should_process_events());
    assert!(matches!(
        other.drop_channel(&parent),
        Err(IpcError::NotRegistered { .. })
    ));
    assert!(pump.is_registered(&parent));
}

#[test]
fn test_dropped_channel_gets_no_further_callbacks() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (dropped, dropped_peer) = registered(&mut pump, &listener);
    let (live, live_peer) = registered(&mut pump, &listener);

    pump.drop_channel(&dropped).unwrap();
    assert!(!dropped.is_registered());

    dropped_peer.send(b"ignored").unwrap();
    live_peer.send(b"seen").unwrap();
    drop(dropped_peer);

    pump.process_events().unwrap();
    assert_eq!(listener.events(), vec![Event::Message(live.id(), Bytes::from_static(b"seen"))]);
    assert!(pump.take_dropped().is_empty());

    assert!(matches!(
        pump.drop_channel(&dropped),
        Err(IpcError::NotRegistered { .. })
    ));
}

#[test]
fn test_dropped_channel_may_be_registered_again() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, child) = registered(&mut pump, &listener);

    pump.drop_channel(&parent).unwrap();
    pump.add_channel(Rc::clone(&parent), listener.clone()).unwrap();

    child.send(b"again").unwrap();
    pump.process_events().unwrap();
    assert_eq!(listener.messages(parent.id()), vec![Bytes::from_static(b"again")]);
}

#[test]
fn test_peer_shutdown_yields_exactly_one_eof() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, child) = registered(&mut pump, &listener);

    child.shutdown_write().unwrap();
    pump.process_events().unwrap();

    assert_eq!(listener.errors(parent.id()), vec![ChannelError::Eof]);
    assert!(!pump.should_process_events());
    assert!(!parent.is_registered());
    assert_eq!(pump.process_events().unwrap(), 0);
    assert_eq!(listener.events().len(), 1);

    let dropped = pump.take_dropped();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].channel, parent.id());
    assert_eq!(dropped[0].error, ChannelError::Eof);
}

#[test]
fn test_corrupt_stream_is_reported_as_eof() {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, child) = registered(&mut pump, &listener);

    // A header announcing more than the frame limit.
    let raw = UnixStream::from(child.into_owned_fd());
    (&raw).write_all(&[0xff, 0xff, 0xff, 0xff, 0]).unwrap();

    pump.process_events().unwrap();
    assert_eq!(listener.errors(parent.id()), vec![ChannelError::Eof]);
    assert!(!pump.should_process_events());
}

#[test]
fn test_listener_error_becomes_user_error() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::failing_on(b"boom"));
    let (parent, child) = registered(&mut pump, &listener);

    child.send(b"fine").unwrap();
    child.send(b"boom").unwrap();
    child.send(b"never").unwrap();

    pump.process_events().unwrap();
    assert_eq!(
        listener.events(),
        vec![
            Event::Message(parent.id(), Bytes::from_static(b"fine")),
            Event::Error(parent.id(), ChannelError::User),
        ]
    );
    assert!(!pump.should_process_events());
}

#[test]
fn test_listener_panic_is_contained() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::panicking_on(b"boom"));
    let (parent, child) = registered(&mut pump, &listener);

    child.send(b"boom").unwrap();
    assert!(pump.process_events().is_ok());
    assert_eq!(listener.errors(parent.id()), vec![ChannelError::User]);
}

#[test]
fn test_faulty_listener_does_not_disturb_other_channels() {
    let mut pump = MessagePump::new().unwrap();
    let faulty = Rc::new(RecordingListener::failing_on(b"first"));
    let healthy = Rc::new(RecordingListener::new());
    let (h1, h1_peer) = registered(&mut pump, &faulty);
    let (h2, h2_peer) = registered(&mut pump, &healthy);

    h1_peer.send(b"first").unwrap();
    h2_peer.send(b"one").unwrap();

    // Both channels are ready before the wait, so one call services both.
    pump.process_events().unwrap();
    assert_eq!(faulty.events(), vec![Event::Error(h1.id(), ChannelError::User)]);
    assert_eq!(healthy.messages(h2.id()), vec![Bytes::from_static(b"one")]);
    assert!(pump.is_registered(&h2));
    assert!(!pump.is_registered(&h1));

    h1_peer.send(b"late").unwrap();
    h2_peer.send(b"two").unwrap();
    pump.process_events().unwrap();

    assert_eq!(
        healthy.messages(h2.id()),
        vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
    );
    assert_eq!(faulty.events().len(), 1);
    assert!(healthy.errors(h2.id()).is_empty());
}

#[test]
fn test_silent_channel_blocks_without_liveness_policy() {
    let mut pump = MessagePump::new().unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (parent, _held_open) = registered(&mut pump, &listener);

    let serviced = pump
        .process_events_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(serviced, 0);
    assert!(pump.is_registered(&parent));
    assert!(listener.events().is_empty());
}

#[test]
fn test_liveness_timeout_drops_silent_channel() {
    let mut pump =
        MessagePump::with_liveness(LivenessPolicy::Timeout(Duration::from_millis(100))).unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (silent, _held_open) = registered(&mut pump, &listener);

    let started = Instant::now();
    assert_eq!(pump.process_events().unwrap(), 1);
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(listener.errors(silent.id()), vec![ChannelError::Timeout]);
    assert!(!pump.should_process_events());
    assert_eq!(pump.take_dropped()[0].error, ChannelError::Timeout);
}

#[test]
fn test_liveness_timeout_spares_active_channels() {
    let mut pump =
        MessagePump::with_liveness(LivenessPolicy::Timeout(Duration::from_millis(300))).unwrap();
    let listener = Rc::new(RecordingListener::new());
    let (active, active_peer) = registered(&mut pump, &listener);
    let (silent, _held_open) = registered(&mut pump, &listener);

    let chatter = thread::spawn(move || {
        for _ in 0..8 {
            active_peer.send(b"tick").unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        active_peer
    });

    pump_until(&mut pump, LIMIT, || !listener.errors(silent.id()).is_empty());
    assert!(pump.is_registered(&active));
    assert_eq!(listener.errors(silent.id()), vec![ChannelError::Timeout]);

    let _active_peer = chatter.join().unwrap();
    assert!(listener.errors(active.id()).is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_per_channel_fifo(
        batches in proptest::collection::vec(
            proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 0..8),
            1..4,
        )
    ) {
        let mut pump = MessagePump::new().unwrap();
        let listener = Rc::new(RecordingListener::new());
        let mut channels = Vec::new();
        for batch in &batches {
            let (parent, child) = registered(&mut pump, &listener);
            for message in batch {
                child.send(message).unwrap();
            }
            drop(child);
            channels.push(parent);
        }

        drain(&mut pump, LIMIT);

        for (parent, batch) in channels.iter().zip(&batches) {
            let got: Vec<Vec<u8>> = listener
                .messages(parent.id())
                .iter()
                .map(|m| m.to_vec())
                .collect();
            prop_assert_eq!(&got, batch);
            prop_assert_eq!(listener.errors(parent.id()), vec![ChannelError::Eof]);
        }
    }
}
