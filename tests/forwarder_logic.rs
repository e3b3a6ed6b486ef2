// Forwarder lifecycle tests against in-memory fake endpoints.

mod common;

use common::{
    test_logger, Event, FakeSocket, FakeTunnel, RecordingForwarderSink, SocketRead,
};
use ipsec_datapath::datapath::forwarder::{ForwarderNotification, IpSecPacketForwarder};
use ipsec_datapath::datapath::{SocketInterface, TunnelInterface};
use ipsec_datapath::notification::SerialExecutor;
use ipsec_datapath::{DatapathDebugInfo, DatapathError, ErrorKind};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Harness {
    tunnel: Arc<FakeTunnel>,
    socket: Arc<FakeSocket>,
    sink: Arc<RecordingForwarderSink>,
    executor: Arc<SerialExecutor>,
    forwarder: IpSecPacketForwarder,
}

fn harness(script: Vec<SocketRead>) -> Harness {
    let tunnel = FakeTunnel::new();
    let socket = FakeSocket::new(33, script);
    let sink = RecordingForwarderSink::new();
    let executor = Arc::new(SerialExecutor::new("notification", test_logger()).unwrap());
    let notification: Weak<dyn ForwarderNotification> =
        Arc::downgrade(&(Arc::clone(&sink) as Arc<dyn ForwarderNotification>));
    let forwarder = IpSecPacketForwarder::new(
        Arc::clone(&tunnel) as Arc<dyn TunnelInterface>,
        Arc::clone(&socket) as Arc<dyn SocketInterface>,
        Arc::clone(&executor),
        notification,
        1,
        test_logger(),
    );
    Harness {
        tunnel,
        socket,
        sink,
        executor,
        forwarder,
    }
}

#[test]
fn established_after_bidirectional_traffic() {
    let mut h = harness(vec![SocketRead::Data(b"pong".to_vec())]);
    h.forwarder.start().unwrap();

    h.tunnel.inject(b"ping");

    let events = h.sink.wait_for(1, Duration::from_secs(2));
    assert_eq!(events, vec![(1, Event::Established)]);

    // Uplink delivered to the socket, downlink delivered to the tunnel.
    assert_eq!(h.socket.written(), vec![b"ping".to_vec()]);
    assert_eq!(h.tunnel.written(), vec![b"pong".to_vec()]);

    h.forwarder.stop();
    // Stop emits nothing further.
    assert_eq!(h.sink.events().len(), 1);
}

#[test]
fn uplink_alone_is_not_established() {
    let mut h = harness(Vec::new());
    h.forwarder.start().unwrap();

    h.tunnel.inject(b"ping");
    std::thread::sleep(Duration::from_millis(200));
    assert!(h.sink.events().is_empty());

    h.forwarder.stop();
    assert!(h.sink.events().is_empty());
}

#[test]
fn transient_read_failure_posts_failed_once() {
    let mut h = harness(vec![SocketRead::Fail(DatapathError::aborted_errno(
        "reading from socket fd 33",
        libc::ECONNREFUSED,
    ))]);
    h.forwarder.start().unwrap();

    let events = h.sink.wait_for(1, Duration::from_secs(2));
    assert_eq!(events, vec![(1, Event::Failed(ErrorKind::Aborted))]);

    h.forwarder.stop();
    h.executor.shutdown();
    assert_eq!(h.sink.events().len(), 1);
}

#[test]
fn eperm_read_failure_is_permanent() {
    let mut h = harness(vec![SocketRead::Fail(DatapathError::aborted_errno(
        "reading from socket fd 33",
        libc::EPERM,
    ))]);
    h.forwarder.start().unwrap();

    let events = h.sink.wait_for(1, Duration::from_secs(2));
    assert_eq!(events, vec![(1, Event::PermanentFailure(ErrorKind::Aborted))]);

    h.forwarder.stop();
    h.executor.shutdown();
    assert_eq!(h.sink.events().len(), 1);
}

#[test]
fn eperm_on_write_stays_transient() {
    // Only a network socket *read* carries the permanent classification.
    let mut h = harness(Vec::new());
    h.socket.set_fail_writes();
    h.forwarder.start().unwrap();

    h.tunnel.inject(b"ping");

    let events = h.sink.wait_for(1, Duration::from_secs(2));
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], (1, Event::Failed(_))));

    h.forwarder.stop();
}

#[test]
fn at_most_one_terminal_event() {
    // Both pumps fail: downlink read and uplink write.
    let mut h = harness(vec![SocketRead::Fail(DatapathError::aborted(
        "peer went away",
    ))]);
    h.socket.set_fail_writes();
    h.forwarder.start().unwrap();
    h.tunnel.inject(b"ping");

    let _ = h.sink.wait_for(1, Duration::from_secs(2));
    // Give a second terminal event every chance to show up before asserting.
    std::thread::sleep(Duration::from_millis(200));
    h.executor.shutdown();

    let events = h.sink.events();
    assert_eq!(events.len(), 1, "got {events:?}");
}

#[test]
fn established_never_follows_terminal() {
    let mut h = harness(vec![SocketRead::Fail(DatapathError::aborted("gone"))]);
    h.forwarder.start().unwrap();

    // Terminal lands first; the uplink traffic afterwards must not produce
    // a connected event.
    let _ = h.sink.wait_for(1, Duration::from_secs(2));
    h.tunnel.inject(b"ping");
    std::thread::sleep(Duration::from_millis(200));
    h.executor.shutdown();

    let events = h.sink.events();
    assert_eq!(events, vec![(1, Event::Failed(ErrorKind::Aborted))]);
    h.forwarder.stop();
}

#[test]
fn stop_is_silent() {
    let mut h = harness(Vec::new());
    h.forwarder.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    h.forwarder.stop();
    h.executor.shutdown();
    assert!(h.sink.events().is_empty());
}

#[test]
fn stop_rearms_the_retained_tunnel() {
    let mut h = harness(Vec::new());
    h.forwarder.start().unwrap();
    h.forwarder.stop();

    // The tunnel was cancelled during stop but must be usable by the next
    // forwarder: a fresh read sees traffic again, not a stale cancellation.
    h.tunnel.inject(b"next-session");
    let packets = ipsec_datapath::datapath::PacketPipe::read_packets(h.tunnel.as_ref()).unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data(), b"next-session");
}

#[test]
fn counters_track_both_directions() {
    let mut h = harness(vec![
        SocketRead::Data(b"down1".to_vec()),
        SocketRead::Data(b"down2".to_vec()),
    ]);
    h.forwarder.start().unwrap();

    h.tunnel.inject(b"up1");
    h.tunnel.inject(b"up2");
    h.tunnel.inject(b"up3");

    let _ = h.sink.wait_for(1, Duration::from_secs(2));
    // Let the pumps drain everything queued.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if h.socket.written().len() == 3 && h.tunnel.written().len() == 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "pumps did not drain");
        std::thread::sleep(Duration::from_millis(10));
    }
    h.forwarder.stop();

    let mut info = DatapathDebugInfo::default();
    h.forwarder.fill_debug_info(&mut info);
    assert_eq!(info.uplink_packets_read, 3);
    assert_eq!(info.uplink_packets_written, 3);
    assert_eq!(info.downlink_packets_read, 2);
    assert_eq!(info.downlink_packets_written, 2);
}

#[test]
fn keepalive_marker_is_forwarded_verbatim() {
    let mut h = harness(Vec::new());
    h.forwarder.start().unwrap();

    // The tunnel emits the 1-byte 0xFF marker on keepalive timeout; the
    // forwarder must pass it through untouched.
    h.tunnel.inject(&[0xFF]);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let written = h.socket.written();
        if !written.is_empty() {
            assert_eq!(written, vec![vec![0xFF]]);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "marker never forwarded");
        std::thread::sleep(Duration::from_millis(10));
    }
    h.forwarder.stop();
}
