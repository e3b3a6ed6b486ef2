// Shared fixtures for the integration tests: in-memory endpoint fakes, a
// scripted platform binding, and a recording session controller.
#![allow(dead_code)]

use ipsec_datapath::datapath::forwarder::ForwarderNotification;
use ipsec_datapath::datapath::key_material::IpSecTransformParams;
use ipsec_datapath::datapath::{PacketPipe, SocketInterface, TunnelInterface, VpnService};
use ipsec_datapath::logging::{LogRegistry, Logger};
use ipsec_datapath::packet::Packet;
use ipsec_datapath::status::Result;
use ipsec_datapath::{
    DatapathError, DatapathNotification, Endpoint, ErrorKind, IpProtocol, NetworkInfo, TunFdData,
};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub fn test_logger() -> Logger {
    LogRegistry::new(256).logger()
}

/// In-memory stand-in for the TUN endpoint. `inject` feeds packets the
/// "host stack" wrote; everything the downlink pump delivers lands in
/// `written`.
pub struct FakeTunnel {
    inbound_tx: Mutex<mpsc::Sender<Vec<u8>>>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    cancelled: AtomicBool,
    closed: AtomicBool,
    keepalive: Mutex<Option<Duration>>,
}

impl FakeTunnel {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        Arc::new(Self {
            inbound_tx: Mutex::new(tx),
            inbound_rx: Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            keepalive: Mutex::new(None),
        })
    }

    pub fn inject(&self, data: &[u8]) {
        self.inbound_tx
            .lock()
            .unwrap()
            .send(data.to_vec())
            .expect("fake tunnel receiver is gone");
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn configured_keepalive(&self) -> Option<Duration> {
        *self.keepalive.lock().unwrap()
    }
}

impl PacketPipe for FakeTunnel {
    fn read_packets(&self) -> Result<Vec<Packet>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatapathError::internal("fake tunnel is closed"));
        }
        let rx = self.inbound_rx.lock().unwrap();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(data) => return Ok(vec![Packet::new(data, IpProtocol::Unknown)]),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(Vec::new()),
            }
        }
    }

    fn write_packets(&self, packets: Vec<Packet>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatapathError::internal("fake tunnel is closed"));
        }
        let mut written = self.written.lock().unwrap();
        for packet in &packets {
            written.push(packet.data().to_vec());
        }
        Ok(())
    }
}

impl TunnelInterface for FakeTunnel {
    fn set_keepalive_interval(&self, interval: Option<Duration>) {
        *self.keepalive.lock().unwrap() = interval.filter(|i| !i.is_zero());
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        *self.keepalive.lock().unwrap()
    }

    fn is_keepalive_enabled(&self) -> bool {
        self.keepalive.lock().unwrap().is_some()
    }

    fn cancel_read_packets(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn clear_read_cancellation(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What the next downlink read of a [`FakeSocket`] should produce.
pub enum SocketRead {
    Data(Vec<u8>),
    Fail(DatapathError),
}

/// Scripted stand-in for the protected UDP socket.
pub struct FakeSocket {
    fd: RawFd,
    script: Mutex<VecDeque<SocketRead>>,
    written: Mutex<Vec<Vec<u8>>>,
    connected_to: Mutex<Option<Endpoint>>,
    cancelled: AtomicBool,
    closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeSocket {
    pub fn new(fd: RawFd, script: Vec<SocketRead>) -> Arc<Self> {
        Arc::new(Self {
            fd,
            script: Mutex::new(script.into()),
            written: Mutex::new(Vec::new()),
            connected_to: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn connected_to(&self) -> Option<Endpoint> {
        self.connected_to.lock().unwrap().clone()
    }

    pub fn set_fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl PacketPipe for FakeSocket {
    fn read_packets(&self) -> Result<Vec<Packet>> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return match next {
                    SocketRead::Data(data) => Ok(vec![Packet::new(data, IpProtocol::Unknown)]),
                    SocketRead::Fail(status) => Err(status),
                };
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn write_packets(&self, packets: Vec<Packet>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatapathError::internal("fake socket is closed"));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DatapathError::internal("fake socket write failure"));
        }
        let mut written = self.written.lock().unwrap();
        for packet in &packets {
            written.push(packet.data().to_vec());
        }
        Ok(())
    }
}

impl SocketInterface for FakeSocket {
    fn connect(&self, dest: &Endpoint) -> Result<()> {
        *self.connected_to.lock().unwrap() = Some(dest.clone());
        Ok(())
    }

    fn fd(&self) -> RawFd {
        if self.closed.load(Ordering::SeqCst) {
            -1
        } else {
            self.fd
        }
    }

    fn cancel_read_packets(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn debug_string(&self) -> String {
        format!("FakeSocket{{fd={}}}", self.fd)
    }
}

/// Platform binding that hands out the shared fake tunnel and a queue of
/// prepared fake sockets, and records every `configure_ipsec` call.
pub struct FakeVpnService {
    pub tunnel: Arc<FakeTunnel>,
    sockets: Mutex<VecDeque<Arc<FakeSocket>>>,
    configure_calls: Mutex<Vec<IpSecTransformParams>>,
    fail_socket_creation: AtomicBool,
    fail_configure: AtomicBool,
    tunnels_created: AtomicUsize,
}

impl FakeVpnService {
    pub fn new(tunnel: Arc<FakeTunnel>) -> Arc<Self> {
        Arc::new(Self {
            tunnel,
            sockets: Mutex::new(VecDeque::new()),
            configure_calls: Mutex::new(Vec::new()),
            fail_socket_creation: AtomicBool::new(false),
            fail_configure: AtomicBool::new(false),
            tunnels_created: AtomicUsize::new(0),
        })
    }

    pub fn queue_socket(&self, socket: Arc<FakeSocket>) {
        self.sockets.lock().unwrap().push_back(socket);
    }

    pub fn configure_calls(&self) -> Vec<IpSecTransformParams> {
        self.configure_calls.lock().unwrap().clone()
    }

    pub fn set_fail_socket_creation(&self, fail: bool) {
        self.fail_socket_creation.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }

    pub fn tunnels_created(&self) -> usize {
        self.tunnels_created.load(Ordering::SeqCst)
    }
}

impl VpnService for FakeVpnService {
    fn create_tunnel(&self, _tun_fd_data: &TunFdData) -> Result<()> {
        self.tunnels_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_tunnel(&self) -> Result<Arc<dyn TunnelInterface>> {
        Ok(Arc::clone(&self.tunnel) as Arc<dyn TunnelInterface>)
    }

    fn create_protected_network_socket(
        &self,
        _network_info: &NetworkInfo,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn SocketInterface>> {
        if self.fail_socket_creation.load(Ordering::SeqCst) {
            return Err(DatapathError::unavailable("no usable network"));
        }
        let socket = self
            .sockets
            .lock()
            .unwrap()
            .pop_front()
            .expect("test did not queue a fake socket");
        socket.connect(endpoint)?;
        Ok(socket as Arc<dyn SocketInterface>)
    }

    fn configure_ipsec(&self, params: &IpSecTransformParams) -> Result<()> {
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(DatapathError::internal("kernel rejected transforms"));
        }
        self.configure_calls.lock().unwrap().push(params.clone());
        Ok(())
    }
}

/// Controller-side event as the tests observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Established,
    Failed(ErrorKind),
    PermanentFailure(ErrorKind),
}

/// Records controller notifications and lets a test block until enough of
/// them have arrived.
#[derive(Default)]
pub struct RecordingNotification {
    events: Mutex<Vec<Event>>,
    cond: Condvar,
}

impl RecordingNotification {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.cond.notify_all();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until at least `count` events arrived or the timeout passes, and
    /// return what is there.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        while events.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(events, remaining).unwrap();
            events = guard;
        }
        events.clone()
    }
}

impl DatapathNotification for RecordingNotification {
    fn datapath_established(&self) {
        self.push(Event::Established);
    }

    fn datapath_failed(&self, status: DatapathError) {
        self.push(Event::Failed(status.kind()));
    }

    fn datapath_permanent_failure(&self, status: DatapathError) {
        self.push(Event::PermanentFailure(status.kind()));
    }
}

/// Recorder for raw forwarder events, used by the forwarder tests directly.
#[derive(Default)]
pub struct RecordingForwarderSink {
    events: Mutex<Vec<(u64, Event)>>,
    cond: Condvar,
}

impl RecordingForwarderSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, generation: u64, event: Event) {
        self.events.lock().unwrap().push((generation, event));
        self.cond.notify_all();
    }

    pub fn events(&self) -> Vec<(u64, Event)> {
        self.events.lock().unwrap().clone()
    }

    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(u64, Event)> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        while events.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(events, remaining).unwrap();
            events = guard;
        }
        events.clone()
    }
}

impl ForwarderNotification for RecordingForwarderSink {
    fn forwarder_connected(&self, generation: u64) {
        self.push(generation, Event::Established);
    }

    fn forwarder_failed(&self, generation: u64, status: DatapathError) {
        self.push(generation, Event::Failed(status.kind()));
    }

    fn forwarder_permanent_failure(&self, generation: u64, status: DatapathError) {
        self.push(generation, Event::PermanentFailure(status.kind()));
    }
}
