//! The Transmission Control Block, the sole stateful record of a
//! connection.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::mailbox::Mailbox;
use crate::protocol::socket::{AddrFamily, Socket, SocketAddr};
use crate::protocol::segment::TcpSegment;
use crate::rcvbuf::RingBuf;
use crate::timer::TimerSlot;

/// Different TCP connection states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
pub enum State {
    /// Represents no connection state at all.
    CLOSED,
    /// Represents waiting for a connection request from any remote TCP and
    /// port.
    LISTEN,
    /// Represents waiting for a matching connection request after having
    /// sent a connection request.
    SYN_SENT,
    /// Represents waiting for a confirming connection request
    /// acknowledgment after having both received and sent a connection
    /// request.
    SYN_RCVD,
    /// Represents an open connection; the normal state for the data
    /// transfer phase.
    ESTABLISHED,
    /// Represents waiting for a connection termination request from the
    /// local user after the peer has already sent its own.
    CLOSE_WAIT,
    /// Represents waiting for an acknowledgment of the connection
    /// termination request previously sent to the remote TCP.
    LAST_ACK,
    /// Represents waiting for a connection termination request from the
    /// remote TCP, or an acknowledgment of the one previously sent.
    FIN_WAIT_1,
    /// Represents waiting for a connection termination request from the
    /// remote TCP.
    FIN_WAIT_2,
    /// Represents waiting for a connection termination request
    /// acknowledgment from the remote TCP.
    CLOSING,
    /// Represents waiting for enough time to pass to be sure the remote
    /// TCP received the acknowledgment of its termination request.
    TIME_WAIT,
}

/// Send Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers of unacknowledged data
///        3 - sequence numbers allowed for new data transmission
///        4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Default)]
pub(crate) struct SendSeqSpace {
    /// SND.UNA - send unacknowledged
    pub(crate) una: u32,
    /// SND.NXT - send next
    pub(crate) nxt: u32,
    /// SND.WND - send window
    pub(crate) wnd: u16,
    /// SND.WL1 - segment sequence number used for last window update
    pub(crate) wl1: u32,
    /// SND.WL2 - segment acknowledgment number used for last window update
    pub(crate) wl2: u32,
    /// ISS     - initial send sequence number
    pub(crate) iss: u32,
}

/// Receive Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                       1          2          3
///                   ----------|----------|----------
///                          RCV.NXT    RCV.NXT
///                                    +RCV.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers allowed for new reception
///        3 - future sequence numbers which are not yet allowed
/// ```
///
/// RCV.WND is not stored: the advertised window is always the free space of
/// the leased receive ring.
#[derive(Debug, Default)]
pub(crate) struct RecvSeqSpace {
    /// RCV.NXT - receive next
    pub(crate) nxt: u32,
    /// IRS     - initial receive sequence number
    pub(crate) irs: u32,
}

/// The single outstanding segment kept for retransmission.
#[derive(Debug)]
pub(crate) struct RetransmitSeg {
    /// Copy of the unacknowledged segment.
    pub(crate) segment: TcpSegment,
    /// When the segment was first handed to the network layer; the
    /// round-trip sample on acknowledgment.
    pub(crate) sent_at: Instant,
    /// When the retransmission timer for this segment expires.
    pub(crate) deadline: Instant,
    /// How often the segment has been retransmitted.
    pub(crate) retries: usize,
}

/// Transmission Control Block (TCB).
#[derive(Debug)]
pub(crate) struct Tcb {
    /// Current state of the TCP connection.
    pub(crate) state: State,
    /// Address family the TCB was initialized with.
    pub(crate) family: AddrFamily,
    /// Whether the connection was opened passively (via listen).
    pub(crate) passive: bool,
    /// Whether a passive open was bound to the unspecified local address.
    pub(crate) allow_any_addr: bool,
    /// Local address and port.
    pub(crate) local: SocketAddr,
    /// Peer address and port.
    pub(crate) peer: SocketAddr,
    /// Network-interface index, zero if unspecified.
    pub(crate) netif: u16,
    /// Send Sequence Space for the TCP connection.
    pub(crate) snd: SendSeqSpace,
    /// Receive Sequence Space for the TCP connection.
    pub(crate) rcv: RecvSeqSpace,
    /// Smoothed round-trip time, unset until the first measurement.
    pub(crate) srtt: Option<Duration>,
    /// Round-trip time variation, unset until the first measurement.
    pub(crate) rtt_var: Option<Duration>,
    /// Current retransmission timeout.
    pub(crate) rto: Duration,
    /// Receive ring leased from the pool while the connection is open.
    pub(crate) rcv_buf: Option<RingBuf>,
    /// At most one outstanding segment snapshot awaiting acknowledgment.
    pub(crate) retransmit: Option<RetransmitSeg>,
    /// Maximum segment size announced by the peer.
    pub(crate) peer_mss: u16,
    /// Mailbox of the user call currently active on this TCB, if any.
    pub(crate) mbox: Option<Mailbox>,
    /// Timer slot for the retransmission timer.
    pub(crate) slot_retransmit: TimerSlot,
    /// Reusable timer slot, shared between the connection timeout of user
    /// calls and the TIME_WAIT expiry.
    pub(crate) slot_misc: TimerSlot,
    /// When the TIME_WAIT state ends, if the connection is in it.
    pub(crate) time_wait_deadline: Option<Instant>,
}

impl Tcb {
    /// Creates a TCB in the CLOSED state with everything unset.
    pub(crate) fn new(rto_initial: Duration) -> Self {
        Self {
            state: State::CLOSED,
            family: AddrFamily::Ipv6,
            passive: false,
            allow_any_addr: false,
            local: SocketAddr::UNSPECIFIED,
            peer: SocketAddr::UNSPECIFIED,
            netif: 0,
            snd: SendSeqSpace::default(),
            rcv: RecvSeqSpace::default(),
            srtt: None,
            rtt_var: None,
            rto: rto_initial,
            rcv_buf: None,
            retransmit: None,
            peer_mss: 0,
            mbox: None,
            slot_retransmit: TimerSlot::new(),
            slot_misc: TimerSlot::new(),
            time_wait_deadline: None,
        }
    }

    /// The window to advertise: free space of the receive ring.
    pub(crate) fn rcv_wnd(&self) -> u16 {
        match &self.rcv_buf {
            Some(ring) => u16::try_from(ring.free()).unwrap_or(u16::MAX),
            None => 0,
        }
    }

    /// The connection 4-tuple, used in log output.
    pub(crate) fn socket(&self) -> Socket {
        Socket {
            local: self.local,
            peer: self.peer,
        }
    }
}

/// Demux-relevant mirror of a TCB, kept outside the FSM lock.
///
/// The event loop and the port-in-use scan read these under their own
/// mutex, so no path ever holds two FSM locks at once.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    /// Local address and port.
    pub(crate) local: SocketAddr,
    /// Peer address and port.
    pub(crate) peer: SocketAddr,
    /// Whether the TCB is in LISTEN.
    pub(crate) listening: bool,
    /// Whether the TCB is in any state but CLOSED.
    pub(crate) open: bool,
}

impl Binding {
    fn idle() -> Self {
        Self {
            local: SocketAddr::UNSPECIFIED,
            peer: SocketAddr::UNSPECIFIED,
            listening: false,
            open: false,
        }
    }
}

/// A TCB together with its two locks.
///
/// `function_lock` serializes user calls on the connection; `fsm` is the
/// FSM lock serializing all state transitions.
#[derive(Debug)]
pub(crate) struct TcbHandle {
    /// Serializes user calls on this TCB.
    pub(crate) function_lock: Mutex<()>,
    /// The FSM lock and the state it protects.
    pub(crate) fsm: Mutex<Tcb>,
    /// Demux mirror, updated after every FSM step.
    pub(crate) binding: Mutex<Binding>,
}

impl TcbHandle {
    /// Creates a handle around a fresh CLOSED TCB.
    pub(crate) fn new(rto_initial: Duration) -> Self {
        Self {
            function_lock: Mutex::new(()),
            fsm: Mutex::new(Tcb::new(rto_initial)),
            binding: Mutex::new(Binding::idle()),
        }
    }
}
