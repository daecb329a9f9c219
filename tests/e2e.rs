//! End-to-end scenarios: two stacks driven back to back over an in-memory
//! link, with wire-level assertions against the recorded frames.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tcp_stack::protocol::headers::TcpHeader;
use tcp_stack::{Config, Endpoint, Error, MemLink, State, TcpSocket, TcpStack};

const ADDR: &str = "::1";
const PORT: u16 = 7777;

fn addr() -> Ipv6Addr {
    ADDR.parse().unwrap()
}

fn listen_ep() -> Endpoint {
    Endpoint::new(addr(), PORT, 0)
}

/// Builds two connected stacks; returns them with their link endpoints for
/// frame inspection.
fn stack_pair(cfg_a: Config, cfg_b: Config) -> (TcpStack, TcpStack, Arc<MemLink>, Arc<MemLink>) {
    let (link_a, link_b) = MemLink::pair(addr(), addr());
    let link_a = Arc::new(link_a);
    let link_b = Arc::new(link_b);

    let stack_a = TcpStack::new(Arc::clone(&link_a) as Arc<dyn tcp_stack::NetLayer>, cfg_a);
    let stack_b = TcpStack::new(Arc::clone(&link_b) as Arc<dyn tcp_stack::NetLayer>, cfg_b);

    (stack_a, stack_b, link_a, link_b)
}

/// Completes a handshake: `a` passive on the well-known port, `b` active.
fn establish(stack_a: &TcpStack, stack_b: &TcpStack) -> (Arc<TcpSocket>, Arc<TcpSocket>) {
    let a = Arc::new(TcpSocket::new(stack_a));
    let b = Arc::new(TcpSocket::new(stack_b));

    let listener = Arc::clone(&a);
    let accept = thread::spawn(move || listener.open_passive(&listen_ep()));

    wait_for(|| a.state() == State::LISTEN, Duration::from_secs(1));

    b.open_active(&listen_ep(), 0).unwrap();
    accept.join().unwrap().unwrap();

    (a, b)
}

fn wait_for(cond: impl Fn() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn decode(frame: &[u8]) -> (TcpHeader, usize) {
    let hdr = TcpHeader::try_from(frame).unwrap();
    let payload_len = frame.len() - hdr.header_len();
    (hdr, payload_len)
}

/// Config with timers scaled down far enough for tests.
fn fast_config() -> Config {
    Config {
        connection_timeout: Duration::from_secs(10),
        msl: Duration::from_millis(150),
        rto_initial: Duration::from_millis(100),
        rto_min: Duration::from_millis(50),
        probe_lower_bound: Duration::from_millis(50),
        probe_upper_bound: Duration::from_millis(200),
        ..Config::default()
    }
}

#[test]
fn handshake_reaches_established_with_three_segments() {
    let (stack_a, stack_b, link_a, link_b) = stack_pair(fast_config(), fast_config());
    let (a, b) = establish(&stack_a, &stack_b);

    assert_eq!(a.state(), State::ESTABLISHED);
    assert_eq!(b.state(), State::ESTABLISHED);

    // The listener learned the connecting port, and vice versa.
    assert_eq!(a.local_ep().port, PORT);
    assert_eq!(b.peer_ep().port, PORT);
    assert_eq!(a.peer_ep().port, b.local_ep().port);
    assert_ne!(b.local_ep().port, 0);

    // Exactly three segments: SYN, SYN|ACK, ACK.
    let from_b = link_b.sent_frames();
    assert_eq!(from_b.len(), 2);
    let (syn, _) = decode(&from_b[0]);
    assert!(syn.syn() && !syn.ack());
    let (ack, _) = decode(&from_b[1]);
    assert!(ack.ack() && !ack.syn());

    let from_a = link_a.sent_frames();
    assert_eq!(from_a.len(), 1);
    let (syn_ack, _) = decode(&from_a[0]);
    assert!(syn_ack.syn() && syn_ack.ack());
}

#[test]
fn send_and_recv_five_bytes() {
    let (stack_a, stack_b, link_a, link_b) = stack_pair(fast_config(), fast_config());
    let (a, b) = establish(&stack_a, &stack_b);

    assert_eq!(b.send(&[1, 2, 3, 4, 5], None).unwrap(), 5);

    let mut buf = [0u8; 16];
    let n = a.recv(&mut buf, Some(Duration::from_millis(1000))).unwrap();

    assert_eq!(n, 5);
    assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);

    // Exactly one data segment on the wire...
    let data_frames: Vec<_> = link_b
        .sent_frames()
        .iter()
        .map(|frame| decode(frame))
        .filter(|(_, len)| *len > 0)
        .collect();
    assert_eq!(data_frames.len(), 1);
    let (data_hdr, data_len) = data_frames[0];
    assert!(data_hdr.psh() && data_hdr.ack());
    assert_eq!(data_len, 5);

    // ...answered by exactly one ACK covering it.
    let expected_ack = data_hdr.seq_number().wrapping_add(5);
    let acks: Vec<_> = link_a
        .sent_frames()
        .iter()
        .map(|frame| decode(frame))
        .filter(|(hdr, len)| *len == 0 && !hdr.syn() && hdr.ack_number() == expected_ack)
        .collect();
    assert_eq!(acks.len(), 1);
}

#[test]
fn zero_window_send_probes_until_reopened() {
    // A can buffer 128 bytes; the first send fills its window completely.
    let cfg_a = Config {
        rcv_buf_size: 128,
        ..fast_config()
    };
    let (stack_a, stack_b, _link_a, link_b) = stack_pair(cfg_a, fast_config());
    let (a, b) = establish(&stack_a, &stack_b);

    let filler = [0u8; 128];
    assert_eq!(b.send(&filler, None).unwrap(), 128);

    // The window is now closed; this send sits in probe mode until the
    // receiver drains its buffer.
    let payload: Vec<u8> = (0..=99).collect();
    let sender = {
        let b = Arc::clone(&b);
        thread::spawn(move || b.send(&payload, Some(Duration::from_secs(5))))
    };

    thread::sleep(Duration::from_millis(500));

    let mut buf = [0u8; 128];
    assert_eq!(a.recv(&mut buf, Some(Duration::from_millis(500))).unwrap(), 128);

    assert_eq!(sender.join().unwrap().unwrap(), 100);

    let mut out = [0u8; 128];
    let n = a.recv(&mut out, Some(Duration::from_millis(1000))).unwrap();
    assert_eq!(n, 100);
    let expected: Vec<u8> = (0..=99).collect();
    assert_eq!(&out[..100], &expected[..]);

    // At least one zero-window probe: an empty segment one below the next
    // data sequence number.
    let frames = link_b.sent_frames();
    let first_data_seq = frames
        .iter()
        .map(|frame| decode(frame))
        .find(|(_, len)| *len == 128)
        .map(|(hdr, _)| hdr.seq_number())
        .unwrap();
    let probe_seq = first_data_seq.wrapping_add(127);

    let probes = frames
        .iter()
        .map(|frame| decode(frame))
        .filter(|(hdr, len)| *len == 0 && !hdr.syn() && hdr.seq_number() == probe_seq)
        .count();
    assert!(probes >= 1, "expected at least one probe, saw {probes}");
}

#[test]
fn reset_during_blocked_send_returns_conn_reset() {
    // B can buffer 32 bytes; A fills the window, then blocks probing.
    let cfg_b = Config {
        rcv_buf_size: 32,
        ..fast_config()
    };
    let (stack_a, stack_b, _link_a, _link_b) = stack_pair(fast_config(), cfg_b);
    let (a, b) = establish(&stack_a, &stack_b);

    assert_eq!(a.send(&[7u8; 32], None).unwrap(), 32);

    let sender = {
        let a = Arc::clone(&a);
        thread::spawn(move || a.send(&[0], Some(Duration::from_secs(5))))
    };

    thread::sleep(Duration::from_millis(100));
    b.abort();

    assert_eq!(sender.join().unwrap(), Err(Error::ConnReset));
    assert_eq!(a.state(), State::CLOSED);
}

#[test]
fn graceful_close_walks_fin_states_to_closed() {
    let (stack_a, stack_b, _link_a, _link_b) = stack_pair(fast_config(), fast_config());
    let (a, b) = establish(&stack_a, &stack_b);

    let closer = {
        let a = Arc::clone(&a);
        thread::spawn(move || a.close())
    };

    // B acknowledges the FIN without closing yet.
    wait_for(|| a.state() == State::FIN_WAIT_2, Duration::from_secs(1));
    wait_for(|| b.state() == State::CLOSE_WAIT, Duration::from_secs(1));

    // End-of-stream on the half-closed connection.
    let mut buf = [0u8; 8];
    assert_eq!(b.recv(&mut buf, Some(Duration::from_millis(500))).unwrap(), 0);

    b.close();
    assert_eq!(b.state(), State::CLOSED);

    // A lingers in TIME_WAIT for 2 MSL, then frees the connection.
    closer.join().unwrap();
    assert_eq!(a.state(), State::CLOSED);
}

#[test]
fn open_active_to_silent_peer_times_out_after_retries() {
    // The far link endpoint has no stack attached: a silent peer.
    let cfg = Config {
        connection_timeout: Duration::from_millis(1200),
        rto_initial: Duration::from_millis(30),
        ..Config::default()
    };
    let (link_a, _link_b) = MemLink::pair(addr(), addr());
    let link_a = Arc::new(link_a);
    let stack_a = TcpStack::new(Arc::clone(&link_a) as Arc<dyn tcp_stack::NetLayer>, cfg);

    let socket = TcpSocket::new(&stack_a);

    let start = Instant::now();
    let err = socket.open_active(&listen_ep(), 0).unwrap_err();

    assert_eq!(err, Error::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(1200));
    assert_eq!(socket.state(), State::CLOSED);

    // The initial SYN plus RETRIES_MAX retransmissions.
    let frames = link_a.sent_frames();
    assert_eq!(frames.len(), 1 + tcp_stack::config::RETRIES_MAX);
    for frame in &frames {
        let (hdr, len) = decode(frame);
        assert!(hdr.syn() && !hdr.ack());
        assert_eq!(len, 0);
    }
}

#[test]
fn recv_nonblocking_and_user_timeout() {
    let (stack_a, stack_b, _link_a, _link_b) = stack_pair(fast_config(), fast_config());
    let (a, _b) = establish(&stack_a, &stack_b);

    let mut buf = [0u8; 8];
    assert_eq!(
        a.recv(&mut buf, Some(Duration::ZERO)),
        Err(Error::WouldBlock)
    );

    let start = Instant::now();
    assert_eq!(
        a.recv(&mut buf, Some(Duration::from_millis(120))),
        Err(Error::TimedOut)
    );
    assert!(start.elapsed() >= Duration::from_millis(120));
}

#[test]
fn open_on_connected_socket_is_rejected() {
    let (stack_a, stack_b, _link_a, _link_b) = stack_pair(fast_config(), fast_config());
    let (a, b) = establish(&stack_a, &stack_b);

    assert_eq!(
        b.open_active(&listen_ep(), 0),
        Err(Error::AlreadyConnected)
    );
    assert_eq!(a.open_passive(&listen_ep()), Err(Error::AlreadyConnected));
}

#[test]
fn calls_on_unconnected_socket_are_rejected() {
    let (stack_a, _stack_b, _link_a, _link_b) = stack_pair(fast_config(), fast_config());
    let socket = TcpSocket::new(&stack_a);

    let mut buf = [0u8; 8];
    assert_eq!(socket.send(&[1], None), Err(Error::NotConnected));
    assert_eq!(socket.recv(&mut buf, None), Err(Error::NotConnected));

    // Malformed arguments are rejected before anything is armed.
    assert_eq!(
        socket.open_active(&Endpoint::new(addr(), 0, 0), 0),
        Err(Error::InvalidArg)
    );
    assert_eq!(
        socket.open_active(&Endpoint::default(), 0),
        Err(Error::FamilyUnsupported)
    );
}

#[test]
fn second_listener_on_same_port_is_rejected() {
    let (stack_a, _stack_b, _link_a, _link_b) = stack_pair(fast_config(), fast_config());

    let first = Arc::new(TcpSocket::new(&stack_a));
    {
        let first = Arc::clone(&first);
        thread::spawn(move || first.open_passive(&listen_ep()));
    }
    wait_for(|| first.state() == State::LISTEN, Duration::from_secs(1));

    let second = TcpSocket::new(&stack_a);
    assert_eq!(second.open_passive(&listen_ep()), Err(Error::AddrInUse));
}

#[test]
fn exhausted_buffer_pool_fails_open() {
    let cfg = Config {
        rcv_buffers: 0,
        ..fast_config()
    };
    let (stack_a, _stack_b, _link_a, _link_b) = stack_pair(cfg, fast_config());

    let socket = TcpSocket::new(&stack_a);
    assert_eq!(socket.open_active(&listen_ep(), 0), Err(Error::NoBuffer));
}
