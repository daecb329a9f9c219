//! The TCP processing threads: one ingress task blocking on the network
//! layer, one event-loop task multiplexing inbound segments, retransmission
//! work and TIME_WAIT expirations through the stack's mailbox.

use std::sync::Arc;
use std::thread;

use log::{debug, warn};

use crate::mailbox::Msg;
use crate::net::Datagram;
use crate::protocol::fsm::{self, FsmEvent, RcvdSegment};
use crate::protocol::headers::TcpHeader;
use crate::protocol::socket::SocketAddr;
use crate::protocol::tcb::TcbHandle;
use crate::stack::StackCtx;

/// Starts the ingress and event-loop threads of a stack.
pub(crate) fn spawn(ctx: Arc<StackCtx>) {
    let ingress_ctx = Arc::clone(&ctx);
    thread::Builder::new()
        .name("tcp-ingress".into())
        .spawn(move || ingress_loop(ingress_ctx))
        .expect("failed to spawn ingress thread");

    thread::Builder::new()
        .name("tcp-eventloop".into())
        .spawn(move || event_loop(ctx))
        .expect("failed to spawn event loop thread");
}

/// Blocks on the network-receive primitive, forwarding datagrams into the
/// event-loop mailbox.
fn ingress_loop(ctx: Arc<StackCtx>) {
    while let Some(dgram) = ctx.net.recv() {
        if ctx.evl_mbox.put(Msg::Packet(dgram)).is_err() {
            // Best-effort layer: an overloaded loop drops the datagram and
            // relies on the peer retransmitting.
            warn!("event loop congested: dropping datagram");
        }
    }

    debug!("network layer gone, ingress stopping");
}

fn event_loop(ctx: Arc<StackCtx>) {
    loop {
        match ctx.evl_mbox.get() {
            Msg::Packet(dgram) => handle_packet(&ctx, dgram),
            Msg::RetransmitTick => sweep(&ctx, Tick::Retransmit),
            Msg::TimeWaitTick => sweep(&ctx, Tick::TimeWait),
            msg => debug!("event loop received unexpected message: {msg:?}"),
        }
    }
}

#[derive(Clone, Copy)]
enum Tick {
    Retransmit,
    TimeWait,
}

/// Runs the housekeeping step for every registered connection. Timer
/// messages carry no payload, so the FSM itself decides per connection
/// whether a deadline is actually due.
fn sweep(ctx: &StackCtx, tick: Tick) {
    let handles: Vec<Arc<TcbHandle>> = ctx.sockets.lock().unwrap().clone();

    for handle in handles {
        let event = match tick {
            Tick::Retransmit => FsmEvent::TimeoutRetransmit,
            Tick::TimeWait => FsmEvent::TimeoutTimeWait,
        };
        let _ = fsm::step(ctx, &handle, event);
    }
}

fn handle_packet(ctx: &StackCtx, dgram: Datagram) {
    let hdr = match TcpHeader::try_from(&dgram.bytes[..]) {
        Ok(hdr) => hdr,
        Err(err) => {
            debug!("invalid segment received: {err}");
            return;
        }
    };

    let payload = &dgram.bytes[hdr.header_len()..];

    // Segments failing the checksum are dropped silently.
    if !hdr.is_valid_checksum(&dgram.src, &dgram.dst, payload) {
        debug!("invalid segment received: bad checksum");
        return;
    }

    match demux(ctx, &dgram, &hdr) {
        Some(handle) => {
            let _ = fsm::step(
                ctx,
                &handle,
                FsmEvent::RcvdPkt(RcvdSegment {
                    hdr: &hdr,
                    payload,
                    src: dgram.src,
                    dst: dgram.dst,
                    netif: dgram.netif,
                }),
            );
        }
        None => {
            // No connection: answer with the RFC 793 reset (RSTs excepted).
            if let Some(rst) = fsm::rst_reply(&hdr, payload.len(), dgram.dst, dgram.src) {
                debug!(
                    "no connection for [{}]:{} -> [{}]:{}: constructing RST",
                    dgram.src,
                    hdr.src_port(),
                    dgram.dst,
                    hdr.dst_port(),
                );

                ctx.net.send(dgram.src, dgram.netif, &rst.to_be_bytes());
            }
        }
    }
}

/// Locates the TCB a segment belongs to: the exact 4-tuple first, then a
/// listener bound to the local port.
fn demux(ctx: &StackCtx, dgram: &Datagram, hdr: &TcpHeader) -> Option<Arc<TcbHandle>> {
    let local = SocketAddr {
        addr: dgram.dst,
        port: hdr.dst_port(),
    };
    let peer = SocketAddr {
        addr: dgram.src,
        port: hdr.src_port(),
    };

    let sockets = ctx.sockets.lock().unwrap();
    let mut listener = None;

    for handle in sockets.iter() {
        let binding = handle.binding.lock().unwrap();
        if !binding.open {
            continue;
        }

        if !binding.listening && binding.local == local && binding.peer == peer {
            return Some(Arc::clone(handle));
        }

        if binding.listening
            && binding.local.port == local.port
            && (binding.local.addr.is_unspecified() || binding.local.addr == local.addr)
        {
            listener = Some(Arc::clone(handle));
        }
    }

    listener
}
