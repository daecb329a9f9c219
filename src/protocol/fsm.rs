//! TCP finite state machine (FSM), as described in [RFC 793].
//!
//! Every transition of a connection funnels through [step]: user calls,
//! validated inbound segments and timer expirations alike. `step` acquires
//! the TCB's FSM lock, mutates the TCB, may emit at most one segment, may
//! arm or cancel timers, and may post a notification to the mailbox of the
//! user call bound to the TCB.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793
//!
//! TCP State Diagram.
//!
//! (RFC 793 3.2)
//!
//! ```text
//!                              +---------+ ---------\      active OPEN
//!                              |  CLOSED |            \    -----------
//!                              +---------+<---------\   \   create TCB
//!                                |     ^              \   \  snd SYN
//!                   passive OPEN |     |   CLOSE        \   \
//!                   ------------ |     | ----------       \   \
//!                    create TCB  |     | delete TCB         \   \
//!                                V     |                      \   \
//!                              +---------+            CLOSE    |    \
//!                              |  LISTEN |          ---------- |     |
//!                              +---------+          delete TCB |     |
//!                   rcv SYN      |     |     SEND              |     |
//!                  -----------   |     |    -------            |     V
//! +---------+      snd SYN,ACK  /       \   snd SYN          +---------+
//! |         |<-----------------           ------------------>|         |
//! |   SYN   |                    rcv SYN                     |   SYN   |
//! |   RCVD  |<-----------------------------------------------|   SENT  |
//! |         |                    snd ACK                     |         |
//! |         |------------------           -------------------|         |
//! +---------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +---------+
//!   |           --------------   |     |   -----------
//!   |                  x         |     |     snd ACK
//!   |                            V     V
//!   |  CLOSE                   +---------+
//!   | -------                  |  ESTAB  |
//!   | snd FIN                  +---------+
//!   |                   CLOSE    |     |    rcv FIN
//!   V                  -------   |     |    -------
//! +---------+          snd FIN  /       \   snd ACK          +---------+
//! |  FIN    |<-----------------           ------------------>|  CLOSE  |
//! | WAIT-1  |------------------                              |   WAIT  |
//! +---------+          rcv FIN  \                            +---------+
//!   | rcv ACK of FIN   -------   |                            CLOSE  |
//!   | --------------   snd ACK   |                           ------- |
//!   V        x                   V                           snd FIN V
//! +---------+                  +---------+                   +---------+
//! |FINWAIT-2|                  | CLOSING |                   | LAST-ACK|
//! +---------+                  +---------+                   +---------+
//!   |                rcv ACK of FIN |                 rcv ACK of FIN |
//!   |  rcv FIN       -------------- |    Timeout=2MSL -------------- |
//!   |  -------              x       V    ------------        x       V
//!    \ snd ACK                 +---------+delete TCB         +---------+
//!     ------------------------>|TIME WAIT|------------------>| CLOSED  |
//!                              +---------+                   +---------+
//! ```

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::mailbox::Msg;
use crate::protocol::headers::TcpHeader;
use crate::protocol::segment::TcpSegment;
use crate::protocol::socket::{AddrFamily, SocketAddr};
use crate::protocol::tcb::{Binding, RetransmitSeg, SendSeqSpace, State, Tcb, TcbHandle};
use crate::stack::StackCtx;
use crate::{Error, Result};

/// First port of the ephemeral range used when an active open does not name
/// a local port.
const EPHEMERAL_PORT_BASE: u16 = 49152;

/// A validated inbound segment together with its datagram context.
#[derive(Debug)]
pub(crate) struct RcvdSegment<'a> {
    /// Decoded TCP header.
    pub(crate) hdr: &'a TcpHeader,
    /// Segment payload.
    pub(crate) payload: &'a [u8],
    /// Network-layer source address of the datagram.
    pub(crate) src: Ipv6Addr,
    /// Network-layer destination address of the datagram.
    pub(crate) dst: Ipv6Addr,
    /// Interface the datagram arrived on.
    pub(crate) netif: u16,
}

/// Events dispatched through [step].
#[derive(Debug)]
pub(crate) enum FsmEvent<'a> {
    /// User opened the connection (active or passive per the TCB flags).
    CallOpen,
    /// User handed data to transmit.
    CallSend(&'a [u8]),
    /// User asked for buffered data.
    CallRecv(&'a mut [u8]),
    /// User initiated a graceful close.
    CallClose,
    /// User tore the connection down.
    CallAbort,
    /// The event loop delivered a checksum-verified segment.
    RcvdPkt(RcvdSegment<'a>),
    /// The TIME_WAIT period may have elapsed.
    TimeoutTimeWait,
    /// The retransmission timer may have expired.
    TimeoutRetransmit,
    /// The idle-connection timeout of the active user call expired.
    TimeoutConnection,
    /// The user call asked for a zero-window probe.
    SendProbe,
    /// The user call abandoned the outstanding segment.
    ClearRetransmit,
}

/// Runs one FSM transition under the TCB's FSM lock.
///
/// Returns the number of bytes accepted (CALL_SEND) or delivered
/// (CALL_RECV); zero for every other event.
pub(crate) fn step(ctx: &StackCtx, handle: &TcbHandle, event: FsmEvent<'_>) -> Result<usize> {
    let mut tcb = handle.fsm.lock().unwrap();

    let ret = match event {
        FsmEvent::CallOpen => on_call_open(ctx, handle, &mut tcb),
        FsmEvent::CallSend(buf) => on_call_send(ctx, &mut tcb, buf),
        FsmEvent::CallRecv(buf) => on_call_recv(ctx, &mut tcb, buf),
        FsmEvent::CallClose => on_call_close(ctx, &mut tcb),
        FsmEvent::CallAbort => {
            abort_conn(ctx, &mut tcb, true);
            Ok(0)
        }
        FsmEvent::RcvdPkt(seg) => on_rcvd_pkt(ctx, &mut tcb, &seg),
        FsmEvent::TimeoutTimeWait => on_timeout_timewait(ctx, &mut tcb),
        FsmEvent::TimeoutRetransmit => on_timeout_retransmit(ctx, &mut tcb),
        FsmEvent::TimeoutConnection => on_timeout_connection(ctx, &mut tcb),
        FsmEvent::SendProbe => on_send_probe(ctx, &mut tcb),
        FsmEvent::ClearRetransmit => {
            clear_retransmit(ctx, &mut tcb);
            Ok(0)
        }
    };

    // Mirror the demux-relevant fields while still holding the FSM lock.
    *handle.binding.lock().unwrap() = Binding {
        local: tcb.local,
        peer: tcb.peer,
        listening: tcb.state == State::LISTEN,
        open: tcb.state != State::CLOSED,
    };

    ret
}

fn on_call_open(ctx: &StackCtx, handle: &TcbHandle, tcb: &mut Tcb) -> Result<usize> {
    if tcb.state != State::CLOSED {
        // A passive connection stuck in SYN_RCVD re-opens after its
        // connection timeout: drop the half-open peer, back to LISTEN.
        if tcb.passive && matches!(tcb.state, State::LISTEN | State::SYN_RCVD) {
            debug!(
                "[{}] ({:?}) open call on passive connection: {:?} -> LISTEN",
                tcb.socket(),
                tcb.state,
                tcb.state,
            );

            tcb.peer = SocketAddr::UNSPECIFIED;
            set_state(tcb, State::LISTEN);
            return Ok(0);
        }

        return Err(Error::AlreadyConnected);
    }

    if tcb.family != AddrFamily::Ipv6 {
        return Err(Error::FamilyUnsupported);
    }

    if tcb.passive {
        if port_in_use(ctx, handle, tcb.local.port) {
            warn!("({:?}) local port {} is already in use", tcb.state, tcb.local.port);
            return Err(Error::AddrInUse);
        }
    } else {
        if tcb.local.port == 0 {
            tcb.local.port = ephemeral_port(ctx, handle);
        } else if port_in_use(ctx, handle, tcb.local.port) {
            warn!("({:?}) local port {} is already in use", tcb.state, tcb.local.port);
            return Err(Error::AddrInUse);
        }

        if tcb.local.addr.is_unspecified() {
            tcb.local.addr = ctx
                .net
                .local_addr(tcb.netif)
                .ok_or(Error::InvalidArg)?;
        }
    }

    tcb.rcv_buf = Some(ctx.pool.lease().ok_or(Error::NoBuffer)?);

    if tcb.passive {
        debug!(
            "[{}] (CLOSED) passive open: CLOSED -> LISTEN",
            tcb.socket()
        );

        set_state(tcb, State::LISTEN);
        return Ok(0);
    }

    // <SEQ=ISS><CTL=SYN>
    let iss = random_iss();
    tcb.snd = SendSeqSpace {
        una: iss,
        nxt: iss.wrapping_add(1),
        wnd: 0,
        wl1: 0,
        wl2: 0,
        iss,
    };
    tcb.rto = ctx.config.rto_initial;

    let syn = tcb.create_syn(ctx.config.mss);
    setup_retransmit(ctx, tcb, syn.clone());
    transmit(ctx, tcb, &syn);

    debug!(
        "[{}] (CLOSED) constructing SYN: CLOSED -> SYN_SENT",
        tcb.socket()
    );

    set_state(tcb, State::SYN_SENT);
    Ok(0)
}

fn on_call_send(ctx: &StackCtx, tcb: &mut Tcb, buf: &[u8]) -> Result<usize> {
    if !matches!(tcb.state, State::ESTABLISHED | State::CLOSE_WAIT) {
        return Err(Error::NotConnected);
    }

    // A closed send window puts the caller into probe mode.
    if tcb.snd.wnd == 0 {
        return Ok(0);
    }

    // One outstanding segment at a time; the caller waits for the
    // acknowledgment before handing over more data.
    if tcb.retransmit.is_some() {
        return Ok(0);
    }

    let mss = if tcb.peer_mss > 0 {
        tcb.peer_mss
    } else {
        ctx.config.mss
    };
    let n = buf
        .len()
        .min(tcb.snd.wnd as usize)
        .min(mss as usize);

    // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=PSH,ACK>
    let seg = tcb.create_ack(&buf[..n]);
    setup_retransmit(ctx, tcb, seg.clone());
    transmit(ctx, tcb, &seg);

    tcb.snd.nxt = tcb.snd.nxt.wrapping_add(n as u32);

    debug!(
        "[{}] ({:?}) accepted {} bytes for transmission",
        tcb.socket(),
        tcb.state,
        n,
    );

    Ok(n)
}

fn on_call_recv(ctx: &StackCtx, tcb: &mut Tcb, buf: &mut [u8]) -> Result<usize> {
    if !matches!(
        tcb.state,
        State::ESTABLISHED | State::FIN_WAIT_1 | State::FIN_WAIT_2 | State::CLOSE_WAIT,
    ) {
        return Err(Error::NotConnected);
    }

    let Some(ring) = tcb.rcv_buf.as_mut() else {
        return Ok(0);
    };

    let before = ring.free();
    let n = ring.pop(buf);
    let after = ring.free();
    let buffered = ring.len();

    // Announce the re-opened window once enough space is back.
    let threshold = (ctx.config.mss / 2) as usize;
    if n > 0 && before < threshold && after >= threshold {
        let ack = tcb.create_ack(&[]);
        transmit(ctx, tcb, &ack);

        debug!(
            "[{}] ({:?}) window re-opened to {}: constructing ACK",
            tcb.socket(),
            tcb.state,
            after,
        );
    }

    if n > 0 {
        debug!(
            "[{}] ({:?}) delivered {} bytes to the user, {} still buffered",
            tcb.socket(),
            tcb.state,
            n,
            buffered,
        );
    }

    Ok(n)
}

fn on_call_close(ctx: &StackCtx, tcb: &mut Tcb) -> Result<usize> {
    match tcb.state {
        State::CLOSED => Ok(0),
        State::LISTEN | State::SYN_SENT => {
            debug!(
                "[{}] ({:?}) close call received: {:?} -> CLOSED",
                tcb.socket(),
                tcb.state,
                tcb.state,
            );

            free_tcb(ctx, tcb);
            Ok(0)
        }
        State::SYN_RCVD | State::ESTABLISHED => {
            send_fin(ctx, tcb);

            debug!(
                "[{}] ({:?}) close call received, constructing FIN_ACK: {:?} -> FIN_WAIT_1",
                tcb.socket(),
                tcb.state,
                tcb.state,
            );

            set_state(tcb, State::FIN_WAIT_1);
            Ok(0)
        }
        State::CLOSE_WAIT => {
            send_fin(ctx, tcb);

            debug!(
                "[{}] (CLOSE_WAIT) close call received, constructing FIN_ACK: CLOSE_WAIT -> LAST_ACK",
                tcb.socket()
            );

            set_state(tcb, State::LAST_ACK);
            Ok(0)
        }
        // Teardown is already under way.
        _ => Ok(0),
    }
}

fn on_timeout_connection(ctx: &StackCtx, tcb: &mut Tcb) -> Result<usize> {
    if tcb.state != State::CLOSED {
        warn!(
            "[{}] ({:?}) connection timed out: {:?} -> CLOSED",
            tcb.socket(),
            tcb.state,
            tcb.state,
        );

        free_tcb(ctx, tcb);
    }
    Ok(0)
}

fn on_timeout_timewait(ctx: &StackCtx, tcb: &mut Tcb) -> Result<usize> {
    if tcb.state == State::TIME_WAIT
        && tcb
            .time_wait_deadline
            .is_some_and(|deadline| deadline <= Instant::now())
    {
        debug!(
            "[{}] (TIME_WAIT) timer expired: TIME_WAIT -> CLOSED",
            tcb.socket()
        );

        free_tcb(ctx, tcb);
    }
    Ok(0)
}

fn on_timeout_retransmit(ctx: &StackCtx, tcb: &mut Tcb) -> Result<usize> {
    let now = Instant::now();

    let due = tcb
        .retransmit
        .as_ref()
        .is_some_and(|snap| snap.deadline <= now);
    if !due {
        return Ok(0);
    }

    let retries = tcb.retransmit.as_ref().map(|snap| snap.retries).unwrap_or(0);
    if retries >= ctx.config.retries_max {
        warn!(
            "[{}] ({:?}) max retransmit limit reached, aborting: {:?} -> CLOSED",
            tcb.socket(),
            tcb.state,
            tcb.state,
        );

        abort_conn(ctx, tcb, true);
        return Ok(0);
    }

    // Exponential backoff, clamped to the configured maximum.
    tcb.rto = Duration::min(tcb.rto * 2, ctx.config.rto_max);

    let rto = tcb.rto;
    let segment = {
        let snap = tcb.retransmit.as_mut().unwrap();
        snap.retries += 1;
        snap.deadline = now + rto;
        snap.segment.clone()
    };

    ctx.timers
        .schedule(&mut tcb.slot_retransmit, rto, Msg::RetransmitTick, &ctx.evl_mbox);
    transmit(ctx, tcb, &segment);

    debug!(
        "[{}] ({:?}) segment retransmission constructed, transmit count: {}",
        tcb.socket(),
        tcb.state,
        retries + 1,
    );

    Ok(0)
}

fn on_send_probe(ctx: &StackCtx, tcb: &mut Tcb) -> Result<usize> {
    if !matches!(tcb.state, State::ESTABLISHED | State::CLOSE_WAIT) {
        return Ok(0);
    }

    // RFC 1122 (4.2.2.17): probe the zero window with a segment the peer
    // must answer, one sequence number below SND.NXT and without data.
    let probe = tcb.create_probe();
    transmit(ctx, tcb, &probe);

    debug!(
        "[{}] ({:?}) constructed zero-window probe",
        tcb.socket(),
        tcb.state,
    );

    Ok(0)
}

fn on_rcvd_pkt(ctx: &StackCtx, tcb: &mut Tcb, seg: &RcvdSegment<'_>) -> Result<usize> {
    match tcb.state {
        State::CLOSED => return Ok(0),
        State::LISTEN => return on_pkt_listen(ctx, tcb, seg),
        State::SYN_SENT => return on_pkt_syn_sent(ctx, tcb, seg),
        _ => {}
    }

    let hdr = seg.hdr;
    let payload = seg.payload;
    let seqn = hdr.seq_number();
    let ackn = hdr.ack_number();

    // The number of octets occupied by the segment (counting SYN and FIN).
    let seg_len = payload.len() as u32
        + if hdr.syn() { 1 } else { 0 }
        + if hdr.fin() { 1 } else { 0 };

    let rcv_wnd = tcb.rcv_wnd() as u32;
    let wnd_end = tcb.rcv.nxt.wrapping_add(rcv_wnd);

    // RFC 793 (3.3)
    //
    // There are four cases for the acceptability test for an incoming
    // segment:
    //
    // ```text
    //    Segment Receive  Test
    //    Length  Window
    //    ------- -------  -------------------------------------------
    //
    //       0       0     SEG.SEQ = RCV.NXT
    //
    //       0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
    //
    //      >0       0     not acceptable
    //
    //      >0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
    //                  or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    // ```
    let acceptable = match (seg_len, rcv_wnd) {
        (0, 0) => seqn == tcb.rcv.nxt,
        (0, _) => is_between_wrapping(tcb.rcv.nxt, seqn, wnd_end),
        (_, 0) => false,
        (len, _) => {
            is_between_wrapping(tcb.rcv.nxt, seqn, wnd_end)
                || is_between_wrapping(
                    tcb.rcv.nxt,
                    seqn.wrapping_add(len - 1),
                    wnd_end,
                )
        }
    };

    if !acceptable {
        // RST segments outside the window are ignored outright.
        if hdr.rst() {
            return Ok(0);
        }

        // The only thing that can arrive in TIME_WAIT is a retransmission
        // of the remote FIN. Acknowledge it, and restart the 2 MSL timeout.
        if tcb.state == State::TIME_WAIT && hdr.fin() {
            debug!("[{}] (TIME_WAIT) received FIN: restarting timer", tcb.socket());
            enter_time_wait(ctx, tcb);
        } else {
            debug!(
                "[{}] ({:?}) received unacceptable SEQ number {}: constructing ACK",
                tcb.socket(),
                tcb.state,
                seqn,
            );
        }

        let ack = tcb.create_ack(&[]);
        transmit(ctx, tcb, &ack);
        return Ok(0);
    }

    if hdr.rst() {
        return on_rst(ctx, tcb);
    }

    if hdr.syn() {
        // An in-window SYN on a synchronized connection is fatal.
        warn!(
            "[{}] ({:?}) received SYN, constructing RST: {:?} -> CLOSED",
            tcb.socket(),
            tcb.state,
            tcb.state,
        );

        let rst = if hdr.ack() {
            tcb.create_rst(ackn, None)
        } else {
            tcb.create_rst(0, Some(seqn.wrapping_add(seg_len)))
        };
        transmit(ctx, tcb, &rst);

        free_tcb(ctx, tcb);
        return Ok(0);
    }

    if !hdr.ack() {
        debug!(
            "[{}] ({:?}) did not receive ACK: ignoring",
            tcb.socket(),
            tcb.state,
        );
        return Ok(0);
    }

    if tcb.state == State::SYN_RCVD {
        // If SND.UNA =< SEG.ACK =< SND.NXT then enter ESTABLISHED.
        if !is_between_wrapping(tcb.snd.una, ackn, tcb.snd.nxt.wrapping_add(1)) {
            // <SEQ=SEG.ACK><CTL=RST>
            warn!(
                "[{}] (SYN_RCVD) received unacceptable ACK number {}, constructing RST",
                tcb.socket(),
                ackn,
            );

            let rst = tcb.create_rst(ackn, None);
            transmit(ctx, tcb, &rst);
            return Ok(0);
        }

        tcb.snd.wnd = hdr.window();
        tcb.snd.wl1 = seqn;
        tcb.snd.wl2 = ackn;

        debug!(
            "[{}] (SYN_RCVD) received valid ACK: SYN_RCVD -> ESTABLISHED",
            tcb.socket()
        );

        set_state(tcb, State::ESTABLISHED);
    }

    // ACK field processing.
    let nxt1 = tcb.snd.nxt.wrapping_add(1);
    if is_between_wrapping(tcb.snd.una.wrapping_add(1), ackn, nxt1) {
        // SND.UNA < SEG.ACK =< SND.NXT: new data is acknowledged.
        tcb.snd.una = ackn;
        process_snapshot_ack(ctx, tcb);
    } else if ackn != tcb.snd.una && !wrapping_lt(ackn, tcb.snd.una) {
        // Acknowledgment of something not yet sent.
        debug!(
            "[{}] ({:?}) received ACK number {} for untransmitted data: constructing ACK",
            tcb.socket(),
            tcb.state,
            ackn,
        );

        let ack = tcb.create_ack(&[]);
        transmit(ctx, tcb, &ack);
        return Ok(0);
    }

    // If SND.UNA =< SEG.ACK =< SND.NXT, the send window should be updated.
    if is_between_wrapping(tcb.snd.una, ackn, nxt1)
        && (wrapping_lt(tcb.snd.wl1, seqn)
            || (tcb.snd.wl1 == seqn && !wrapping_lt(ackn, tcb.snd.wl2)))
    {
        let old_wnd = tcb.snd.wnd;
        tcb.snd.wnd = hdr.window();
        tcb.snd.wl1 = seqn;
        tcb.snd.wl2 = ackn;

        if old_wnd != tcb.snd.wnd {
            debug!(
                "[{}] ({:?}) updated send window, new size: {}",
                tcb.socket(),
                tcb.state,
                tcb.snd.wnd,
            );
        }

        // A re-opened window ends probe mode; wake the blocked sender.
        if old_wnd == 0 && tcb.snd.wnd > 0 {
            notify_owner(tcb);
        }
    }

    // State-specific consequences of the acknowledgment.
    match tcb.state {
        State::FIN_WAIT_1 => {
            if tcb.snd.una == tcb.snd.nxt {
                debug!(
                    "[{}] (FIN_WAIT_1) received ACK for FIN: FIN_WAIT_1 -> FIN_WAIT_2",
                    tcb.socket()
                );

                set_state(tcb, State::FIN_WAIT_2);
            }
        }
        State::CLOSING => {
            if tcb.snd.una == tcb.snd.nxt {
                debug!(
                    "[{}] (CLOSING) received ACK for FIN: CLOSING -> TIME_WAIT",
                    tcb.socket()
                );

                enter_time_wait(ctx, tcb);
                set_state(tcb, State::TIME_WAIT);
            }
        }
        State::LAST_ACK => {
            if tcb.snd.una == tcb.snd.nxt {
                debug!(
                    "[{}] (LAST_ACK) received ACK for FIN: LAST_ACK -> CLOSED",
                    tcb.socket()
                );

                free_tcb(ctx, tcb);
                return Ok(0);
            }
        }
        _ => {}
    }

    let mut need_ack = false;

    // Segment text processing.
    if matches!(
        tcb.state,
        State::ESTABLISHED | State::FIN_WAIT_1 | State::FIN_WAIT_2,
    ) && !payload.is_empty()
    {
        if seqn == tcb.rcv.nxt {
            // The next bytes we were expecting; trimmed to the window by
            // the ring itself.
            let taken = tcb.rcv_buf.as_mut().map(|ring| ring.push(payload)).unwrap_or(0);
            tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(taken as u32);
            need_ack = true;

            debug!(
                "[{}] ({:?}) received {} expected bytes: buffering",
                tcb.socket(),
                tcb.state,
                taken,
            );

            if taken > 0 {
                notify_owner(tcb);
            }
        } else if wrapping_lt(seqn, tcb.rcv.nxt) {
            // The segment straddles the boundary between old and new data;
            // only the new part is processed, duplicates are re-ACKed.
            let start = tcb.rcv.nxt.wrapping_sub(seqn) as usize;
            need_ack = true;

            if start < payload.len() {
                let taken = tcb
                    .rcv_buf
                    .as_mut()
                    .map(|ring| ring.push(&payload[start..]))
                    .unwrap_or(0);
                tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(taken as u32);

                debug!(
                    "[{}] ({:?}) received partially duplicate payload: buffering {} new bytes",
                    tcb.socket(),
                    tcb.state,
                    taken,
                );

                if taken > 0 {
                    notify_owner(tcb);
                }
            } else {
                debug!(
                    "[{}] ({:?}) received fully duplicate payload: ignoring",
                    tcb.socket(),
                    tcb.state,
                );
            }
        } else {
            // Data beyond RCV.NXT; there is no reordering queue, the peer
            // retransmits once the gap is acknowledged away.
            debug!(
                "[{}] ({:?}) received out-of-order payload: dropping",
                tcb.socket(),
                tcb.state,
            );
            need_ack = true;
        }
    }

    // FIN processing; only a FIN that lines up with RCV.NXT counts, an
    // out-of-order FIN is retransmitted by the peer.
    if hdr.fin() && seqn.wrapping_add(payload.len() as u32) == tcb.rcv.nxt {
        tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
        need_ack = true;

        match tcb.state {
            State::ESTABLISHED => {
                debug!(
                    "[{}] (ESTABLISHED) received FIN: ESTABLISHED -> CLOSE_WAIT",
                    tcb.socket()
                );

                set_state(tcb, State::CLOSE_WAIT);
            }
            State::FIN_WAIT_1 => {
                // Our FIN was not acknowledged yet, otherwise the ACK
                // processing above had moved us to FIN_WAIT_2.
                debug!(
                    "[{}] (FIN_WAIT_1) received FIN: FIN_WAIT_1 -> CLOSING",
                    tcb.socket()
                );

                set_state(tcb, State::CLOSING);
            }
            State::FIN_WAIT_2 => {
                debug!(
                    "[{}] (FIN_WAIT_2) received FIN: FIN_WAIT_2 -> TIME_WAIT",
                    tcb.socket()
                );

                enter_time_wait(ctx, tcb);
                set_state(tcb, State::TIME_WAIT);
            }
            _ => {}
        }
    }

    if need_ack {
        // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
        let ack = tcb.create_ack(&[]);
        transmit(ctx, tcb, &ack);
    }

    Ok(0)
}

fn on_pkt_listen(ctx: &StackCtx, tcb: &mut Tcb, seg: &RcvdSegment<'_>) -> Result<usize> {
    let hdr = seg.hdr;

    // An incoming RST should be ignored.
    if hdr.rst() {
        debug!("(LISTEN) received RST: ignoring");
        return Ok(0);
    }

    // Any acknowledgment is bad if it arrives on a connection still in the
    // LISTEN state; form an acceptable reset segment.
    if hdr.ack() {
        debug!("(LISTEN) received ACK: constructing RST");

        if let Some(rst) = rst_reply(hdr, seg.payload.len(), seg.dst, seg.src) {
            ctx.net.send(seg.src, seg.netif, &rst.to_be_bytes());
        }
        return Ok(0);
    }

    if !hdr.syn() {
        debug!("(LISTEN) did not receive SYN: ignoring");
        return Ok(0);
    }

    // Data riding on the SYN is dropped; the handshake proceeds normally.
    tcb.peer = SocketAddr {
        addr: seg.src,
        port: hdr.src_port(),
    };
    if tcb.allow_any_addr {
        tcb.local.addr = seg.dst;
    }
    tcb.netif = seg.netif;

    let seqn = hdr.seq_number();
    let iss = random_iss();
    tcb.snd = SendSeqSpace {
        una: iss,
        nxt: iss.wrapping_add(1),
        wnd: hdr.window(),
        wl1: seqn,
        wl2: 0,
        iss,
    };
    tcb.rcv.nxt = seqn.wrapping_add(1);
    tcb.rcv.irs = seqn;
    tcb.peer_mss = hdr.options().mss().unwrap_or(ctx.config.mss);
    tcb.rto = ctx.config.rto_initial;

    // <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
    let syn_ack = tcb.create_syn_ack(ctx.config.mss);
    setup_retransmit(ctx, tcb, syn_ack.clone());
    transmit(ctx, tcb, &syn_ack);

    debug!(
        "[{}] (LISTEN) received SYN (IRS {}), constructing SYN_ACK: LISTEN -> SYN_RCVD",
        tcb.socket(),
        tcb.rcv.irs,
    );

    set_state(tcb, State::SYN_RCVD);
    Ok(0)
}

fn on_pkt_syn_sent(ctx: &StackCtx, tcb: &mut Tcb, seg: &RcvdSegment<'_>) -> Result<usize> {
    let hdr = seg.hdr;
    let seqn = hdr.seq_number();
    let ackn = hdr.ack_number();

    // Do not process an incoming FIN since SEG.SEQ cannot be validated.
    if hdr.fin() {
        debug!("[{}] (SYN_SENT) received FIN: ignoring", tcb.socket());
        return Ok(0);
    }

    let ack_ok = if hdr.ack() {
        // If SEG.ACK =< ISS or SEG.ACK > SND.NXT the ACK is unacceptable.
        if !is_between_wrapping(
            tcb.snd.iss.wrapping_add(1),
            ackn,
            tcb.snd.nxt.wrapping_add(1),
        ) {
            if !hdr.rst() {
                debug!(
                    "[{}] (SYN_SENT) received invalid ACK number {}: constructing RST",
                    tcb.socket(),
                    ackn,
                );

                // <SEQ=SEG.ACK><CTL=RST>
                let rst = tcb.create_rst(ackn, None);
                transmit(ctx, tcb, &rst);
            }
            return Ok(0);
        }
        true
    } else {
        false
    };

    if hdr.rst() {
        // A RST is only credible alongside an acceptable ACK.
        if ack_ok {
            warn!(
                "[{}] (SYN_SENT) received RST, connection refused: SYN_SENT -> CLOSED",
                tcb.socket()
            );

            free_tcb(ctx, tcb);
        }
        return Ok(0);
    }

    if hdr.syn() {
        tcb.rcv.nxt = seqn.wrapping_add(1);
        tcb.rcv.irs = seqn;
        tcb.snd.wnd = hdr.window();
        tcb.snd.wl1 = seqn;
        tcb.snd.wl2 = ackn;
        tcb.peer_mss = hdr.options().mss().unwrap_or(ctx.config.mss);

        if ack_ok {
            // Our SYN was acknowledged.
            tcb.snd.una = ackn;
            process_snapshot_ack(ctx, tcb);

            // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
            let ack = tcb.create_ack(&[]);
            transmit(ctx, tcb, &ack);

            debug!(
                "[{}] (SYN_SENT) received SYN_ACK, constructed ACK: SYN_SENT -> ESTABLISHED",
                tcb.socket()
            );

            set_state(tcb, State::ESTABLISHED);
        } else {
            // Simultaneous open: answer with SYN_ACK and wait for the
            // acknowledgment of our SYN in SYN_RCVD.
            clear_retransmit(ctx, tcb);

            let syn_ack = tcb.create_syn_ack(ctx.config.mss);
            setup_retransmit(ctx, tcb, syn_ack.clone());
            transmit(ctx, tcb, &syn_ack);

            debug!(
                "[{}] (SYN_SENT) received SYN, constructed SYN_ACK: SYN_SENT -> SYN_RCVD",
                tcb.socket()
            );

            set_state(tcb, State::SYN_RCVD);
        }
    } else if ack_ok {
        // A bare acceptable ACK; keep waiting for the SYN.
        debug!(
            "[{}] (SYN_SENT) received valid ACK: waiting for SYN",
            tcb.socket()
        );

        tcb.snd.una = ackn;
        process_snapshot_ack(ctx, tcb);
    }

    Ok(0)
}

fn on_rst(ctx: &StackCtx, tcb: &mut Tcb) -> Result<usize> {
    if tcb.state == State::SYN_RCVD && tcb.passive {
        // RFC 793: a passively opened connection returns to LISTEN.
        warn!(
            "[{}] (SYN_RCVD) received RST: SYN_RCVD -> LISTEN",
            tcb.socket()
        );

        clear_retransmit(ctx, tcb);
        tcb.peer = SocketAddr::UNSPECIFIED;
        set_state(tcb, State::LISTEN);
        return Ok(0);
    }

    warn!(
        "[{}] ({:?}) received RST, connection reset: {:?} -> CLOSED",
        tcb.socket(),
        tcb.state,
        tcb.state,
    );

    free_tcb(ctx, tcb);
    Ok(0)
}

/// Forms the RFC 793 reset answer for a segment that reached no connection.
///
/// Returns `None` for segments that carry RST themselves.
pub(crate) fn rst_reply(
    hdr: &TcpHeader,
    payload_len: usize,
    local: Ipv6Addr,
    peer: Ipv6Addr,
) -> Option<TcpSegment> {
    if hdr.rst() {
        return None;
    }

    let mut rst;
    if hdr.ack() {
        // <SEQ=SEG.ACK><CTL=RST>
        rst = TcpHeader::new(hdr.dst_port(), hdr.src_port(), hdr.ack_number(), 0);
        rst.set_rst();
    } else {
        // <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>
        let seg_len = payload_len as u32
            + if hdr.syn() { 1 } else { 0 }
            + if hdr.fin() { 1 } else { 0 };

        rst = TcpHeader::new(hdr.dst_port(), hdr.src_port(), 0, 0);
        rst.set_rst();
        rst.set_ack();
        rst.set_ack_number(hdr.seq_number().wrapping_add(seg_len));
    }

    rst.set_checksum(&local, &peer, &[]);
    Some(TcpSegment::new(rst, &[]))
}

/// Tears the connection down, optionally announcing it with a RST.
fn abort_conn(ctx: &StackCtx, tcb: &mut Tcb, send_rst: bool) {
    if tcb.state == State::CLOSED {
        return;
    }

    if send_rst && !matches!(tcb.state, State::LISTEN | State::SYN_SENT) {
        // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=RST,ACK>
        let rst = tcb.create_rst(tcb.snd.nxt, Some(tcb.rcv.nxt));
        transmit(ctx, tcb, &rst);
    }

    warn!(
        "[{}] ({:?}) aborting connection: {:?} -> CLOSED",
        tcb.socket(),
        tcb.state,
        tcb.state,
    );

    free_tcb(ctx, tcb);
}

/// Emits a FIN_ACK and snapshots it for retransmission.
fn send_fin(ctx: &StackCtx, tcb: &mut Tcb) {
    // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=FIN,ACK>
    let fin = tcb.create_fin_ack();
    setup_retransmit(ctx, tcb, fin.clone());
    transmit(ctx, tcb, &fin);

    tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
}

/// Arms the TIME_WAIT expiry of 2 MSL, restarting it when already armed.
fn enter_time_wait(ctx: &StackCtx, tcb: &mut Tcb) {
    let timeout = 2 * ctx.config.msl;

    tcb.time_wait_deadline = Some(Instant::now() + timeout);
    ctx.timers
        .schedule(&mut tcb.slot_misc, timeout, Msg::TimeWaitTick, &ctx.evl_mbox);
}

/// Clears the retransmission snapshot and disarms its timer.
fn clear_retransmit(ctx: &StackCtx, tcb: &mut Tcb) {
    tcb.retransmit = None;
    ctx.timers.cancel(&mut tcb.slot_retransmit);
}

/// Releases every resource of the connection and parks it in CLOSED.
fn free_tcb(ctx: &StackCtx, tcb: &mut Tcb) {
    clear_retransmit(ctx, tcb);
    ctx.timers.cancel(&mut tcb.slot_misc);
    tcb.time_wait_deadline = None;

    if let Some(ring) = tcb.rcv_buf.take() {
        ctx.pool.release(ring);
    }

    set_state(tcb, State::CLOSED);
}

/// Clears the snapshot once SND.UNA has moved past it, sampling the
/// round-trip time of first transmissions (Karn's algorithm).
fn process_snapshot_ack(ctx: &StackCtx, tcb: &mut Tcb) {
    let Some((first, len, sent_at, retries)) = tcb.retransmit.as_ref().map(|snap| {
        (
            snap.segment.hdr.seq_number(),
            snap.segment.seq_len(),
            snap.sent_at,
            snap.retries,
        )
    }) else {
        return;
    };

    let end = first.wrapping_add(len);
    if !is_between_wrapping(end, tcb.snd.una, tcb.snd.nxt.wrapping_add(1)) {
        // Only part of the snapshot was acknowledged.
        return;
    }

    if retries == 0 {
        update_rto(ctx, tcb, sent_at.elapsed());
    }

    clear_retransmit(ctx, tcb);
    notify_owner(tcb);

    debug!(
        "[{}] ({:?}) outstanding segment fully acknowledged",
        tcb.socket(),
        tcb.state,
    );
}

/// Folds a round-trip sample into SRTT/RTTVAR/RTO per [RFC 6298].
///
/// [RFC 6298]: https://www.rfc-editor.org/rfc/rfc6298
fn update_rto(ctx: &StackCtx, tcb: &mut Tcb, sample: Duration) {
    // Clock granularity G of the RTO formula.
    const GRANULARITY: Duration = Duration::from_millis(10);

    let (srtt, rtt_var) = match (tcb.srtt, tcb.rtt_var) {
        (Some(srtt), Some(rtt_var)) => {
            // RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
            // SRTT   <- (1 - alpha) * SRTT + alpha * R'
            let delta = if srtt > sample { srtt - sample } else { sample - srtt };
            ((srtt * 7 + sample) / 8, (rtt_var * 3 + delta) / 4)
        }
        _ => (sample, sample / 2),
    };

    tcb.srtt = Some(srtt);
    tcb.rtt_var = Some(rtt_var);
    tcb.rto = (srtt + Duration::max(GRANULARITY, rtt_var * 4))
        .clamp(ctx.config.rto_min, ctx.config.rto_max);
}

/// Snapshots `segment` as the one outstanding segment and arms the
/// retransmission timer.
fn setup_retransmit(ctx: &StackCtx, tcb: &mut Tcb, segment: TcpSegment) {
    debug_assert!(tcb.retransmit.is_none());

    let now = Instant::now();
    tcb.retransmit = Some(RetransmitSeg {
        segment,
        sent_at: now,
        deadline: now + tcb.rto,
        retries: 0,
    });

    ctx.timers.schedule(
        &mut tcb.slot_retransmit,
        tcb.rto,
        Msg::RetransmitTick,
        &ctx.evl_mbox,
    );
}

/// Hands a finished segment to the network layer.
fn transmit(ctx: &StackCtx, tcb: &Tcb, segment: &TcpSegment) {
    ctx.net
        .send(tcb.peer.addr, tcb.netif, &segment.to_be_bytes());
}

fn set_state(tcb: &mut Tcb, state: State) {
    tcb.state = state;
    notify_owner(tcb);
}

/// Posts NOTIFY_USER to the bound mailbox, if a user call is active.
fn notify_owner(tcb: &Tcb) {
    if let Some(mbox) = &tcb.mbox {
        // A full mailbox loses the notification; the blocked call recovers
        // through its remaining timeouts.
        let _ = mbox.put(Msg::NotifyUser);
    }
}

fn port_in_use(ctx: &StackCtx, exclude: &TcbHandle, port: u16) -> bool {
    let sockets = ctx.sockets.lock().unwrap();

    sockets.iter().any(|other| {
        if std::ptr::eq(Arc::as_ptr(other), exclude) {
            return false;
        }
        let binding = other.binding.lock().unwrap();
        binding.open && binding.local.port == port
    })
}

fn ephemeral_port(ctx: &StackCtx, exclude: &TcbHandle) -> u16 {
    loop {
        let port = EPHEMERAL_PORT_BASE + (rand::random::<u16>() % (u16::MAX - EPHEMERAL_PORT_BASE));
        if !port_in_use(ctx, exclude, port) {
            return port;
        }
    }
}

/// Picks an initial send sequence number: random with the MSB clear.
fn random_iss() -> u32 {
    rand::random::<u32>() & !(1 << 31)
}

impl Tcb {
    /// Creates a `SYN` segment to initiate a connection request.
    fn create_syn(&self, mss: u16) -> TcpSegment {
        let mut syn = TcpHeader::new(
            self.local.port,
            self.peer.port,
            self.snd.iss,
            self.rcv_wnd(),
        );

        syn.set_syn();
        syn.set_option_mss(mss);
        syn.set_checksum(&self.local.addr, &self.peer.addr, &[]);

        TcpSegment::new(syn, &[])
    }

    /// Creates a `SYN_ACK` segment in response to a peer's connection
    /// request.
    fn create_syn_ack(&self, mss: u16) -> TcpSegment {
        let mut syn_ack = TcpHeader::new(
            self.local.port,
            self.peer.port,
            self.snd.iss,
            self.rcv_wnd(),
        );

        syn_ack.set_ack_number(self.rcv.nxt);
        syn_ack.set_syn();
        syn_ack.set_ack();
        syn_ack.set_option_mss(mss);
        syn_ack.set_checksum(&self.local.addr, &self.peer.addr, &[]);

        TcpSegment::new(syn_ack, &[])
    }

    /// Creates an `ACK` segment, carrying data when transmitting.
    fn create_ack(&self, payload: &[u8]) -> TcpSegment {
        let mut ack = TcpHeader::new(
            self.local.port,
            self.peer.port,
            self.snd.nxt,
            self.rcv_wnd(),
        );

        ack.set_ack_number(self.rcv.nxt);
        ack.set_ack();

        if !payload.is_empty() {
            ack.set_psh();
        }

        ack.set_checksum(&self.local.addr, &self.peer.addr, payload);

        TcpSegment::new(ack, payload)
    }

    /// Creates a `FIN_ACK` segment initiating a graceful termination.
    fn create_fin_ack(&self) -> TcpSegment {
        let mut fin_ack = TcpHeader::new(
            self.local.port,
            self.peer.port,
            self.snd.nxt,
            self.rcv_wnd(),
        );

        fin_ack.set_ack_number(self.rcv.nxt);
        fin_ack.set_fin();
        fin_ack.set_ack();
        fin_ack.set_checksum(&self.local.addr, &self.peer.addr, &[]);

        TcpSegment::new(fin_ack, &[])
    }

    /// Creates an `RST` segment terminating the current connection.
    fn create_rst(&self, seq: u32, ack: Option<u32>) -> TcpSegment {
        let mut rst = TcpHeader::new(self.local.port, self.peer.port, seq, 0);

        rst.set_rst();
        if let Some(ackn) = ack {
            rst.set_ack_number(ackn);
            rst.set_ack();
        }
        rst.set_checksum(&self.local.addr, &self.peer.addr, &[]);

        TcpSegment::new(rst, &[])
    }

    /// Creates a zero-window probe: one sequence number below SND.NXT,
    /// without data.
    fn create_probe(&self) -> TcpSegment {
        let mut probe = TcpHeader::new(
            self.local.port,
            self.peer.port,
            self.snd.nxt.wrapping_sub(1),
            self.rcv_wnd(),
        );

        probe.set_ack_number(self.rcv.nxt);
        probe.set_ack();
        probe.set_checksum(&self.local.addr, &self.peer.addr, &[]);

        TcpSegment::new(probe, &[])
    }
}

#[inline]
fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // RFC 1323 (2.3)
    //
    // TCP determines if a data segment is "old" or "new" by testing whether
    // its sequence number is within 2**31 bytes of the left edge of the
    // window, and if it is not, discarding the data as "old".
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Returns `true` if `x` lies in the half-open wrapping interval
/// `[start, end)` of the 32-bit sequence space.
#[inline]
fn is_between_wrapping(start: u32, x: u32, end: u32) -> bool {
    x.wrapping_sub(start) < end.wrapping_sub(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sequence_window_membership_across_wraparound(
            base in any::<u32>(),
            delta in (-(1i64 << 31))..(1i64 << 31),
        ) {
            let x = base.wrapping_add(delta as u32);
            let end = base.wrapping_add(1 << 31);

            prop_assert_eq!(
                is_between_wrapping(base, x, end),
                (0..(1i64 << 31)).contains(&delta),
            );
        }
    }

    #[test]
    fn wrapping_lt_across_boundary() {
        assert!(wrapping_lt(u32::MAX, 0));
        assert!(wrapping_lt(u32::MAX - 5, 3));
        assert!(!wrapping_lt(3, u32::MAX - 5));
        assert!(!wrapping_lt(7, 7));
        assert!(wrapping_lt(0, 1));
    }

    #[test]
    fn is_between_wrapping_empty_window() {
        // A zero-length interval contains nothing, not even its start.
        assert!(!is_between_wrapping(10, 10, 10));
        assert!(!is_between_wrapping(u32::MAX, u32::MAX, u32::MAX));
    }

    #[test]
    fn is_between_wrapping_includes_start_excludes_end() {
        assert!(is_between_wrapping(100, 100, 105));
        assert!(is_between_wrapping(100, 104, 105));
        assert!(!is_between_wrapping(100, 105, 105));

        // Interval straddling the wraparound point.
        assert!(is_between_wrapping(u32::MAX - 1, u32::MAX, 3));
        assert!(is_between_wrapping(u32::MAX - 1, 2, 3));
        assert!(!is_between_wrapping(u32::MAX - 1, 3, 3));
    }

    #[test]
    fn random_iss_clears_msb() {
        for _ in 0..64 {
            assert_eq!(random_iss() & (1 << 31), 0);
        }
    }
}
