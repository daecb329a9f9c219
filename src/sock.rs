//! The blocking user API.
//!
//! Every call follows the same pattern: take the TCB's function lock,
//! verify the state precondition, bind a private mailbox to the TCB, arm
//! the idle-connection timeout (and the optional user timeout), kick the
//! FSM with the matching CALL event, then loop on the mailbox until a
//! result or error is reached. The mailbox is the sole suspension point.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::mailbox::{Mailbox, Msg};
use crate::protocol::fsm::{self, FsmEvent};
use crate::protocol::socket::{AddrFamily, Endpoint, SocketAddr};
use crate::protocol::tcb::{State, Tcb, TcbHandle};
use crate::stack::StackCtx;
use crate::timer::TimerSlot;
use crate::{Error, Result, TcpStack};

/// One TCP connection endpoint, owned by the caller.
///
/// All methods block the calling thread; only one call can be active on a
/// socket at a time.
#[derive(Debug)]
pub struct TcpSocket {
    ctx: Arc<StackCtx>,
    tcb: Arc<TcbHandle>,
}

impl TcpSocket {
    /// Allocates a connection endpoint on `stack`, in the CLOSED state.
    pub fn new(stack: &TcpStack) -> Self {
        let tcb = Arc::new(TcbHandle::new(stack.ctx.config.rto_initial));
        stack.ctx.sockets.lock().unwrap().push(Arc::clone(&tcb));

        Self {
            ctx: Arc::clone(&stack.ctx),
            tcb,
        }
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.with_tcb(|tcb| tcb.state)
    }

    /// The local endpoint of the connection.
    pub fn local_ep(&self) -> Endpoint {
        self.with_tcb(|tcb| Endpoint::new(tcb.local.addr, tcb.local.port, tcb.netif))
    }

    /// The peer endpoint of the connection.
    pub fn peer_ep(&self) -> Endpoint {
        self.with_tcb(|tcb| Endpoint::new(tcb.peer.addr, tcb.peer.port, tcb.netif))
    }

    /// Opens a connection to `remote`, blocking until it is established.
    ///
    /// A `local_port` of zero picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// [Error::AlreadyConnected] if the socket is not CLOSED,
    /// [Error::FamilyUnsupported] or [Error::InvalidArg] for a bad remote,
    /// [Error::NoBuffer] or [Error::AddrInUse] when resources are taken,
    /// [Error::TimedOut] when the attempt timed out and
    /// [Error::ConnRefused] when the peer reset it.
    pub fn open_active(&self, remote: &Endpoint, local_port: u16) -> Result<()> {
        if remote.family != AddrFamily::Ipv6 {
            return Err(Error::FamilyUnsupported);
        }
        if remote.port == 0 {
            return Err(Error::InvalidArg);
        }

        self.open(Some(remote), None, local_port, false)
    }

    /// Listens on `local`, blocking until a peer connected.
    ///
    /// An unspecified local address accepts connections on any address;
    /// the concrete one is taken from the connection request.
    ///
    /// # Errors
    ///
    /// See [TcpSocket::open_active]; a passive open never times out and
    /// instead keeps listening for the next connection attempt.
    pub fn open_passive(&self, local: &Endpoint) -> Result<()> {
        if local.family != AddrFamily::Ipv6 {
            return Err(Error::FamilyUnsupported);
        }
        if local.port == 0 {
            return Err(Error::InvalidArg);
        }

        self.open(None, Some(local), local.port, true)
    }

    fn open(
        &self,
        remote: Option<&Endpoint>,
        local: Option<&Endpoint>,
        local_port: u16,
        passive: bool,
    ) -> Result<()> {
        let _guard = self.tcb.function_lock.lock().unwrap();
        let mbox = Mailbox::new();

        {
            let mut tcb = self.tcb.fsm.lock().unwrap();
            if tcb.state != State::CLOSED {
                return Err(Error::AlreadyConnected);
            }

            tcb.mbox = Some(mbox.clone());
            tcb.passive = passive;

            if let Some(local) = local {
                tcb.local = SocketAddr {
                    addr: local.addr,
                    port: local.port,
                };
                tcb.netif = local.netif;
                tcb.allow_any_addr = local.addr.is_unspecified();
            }
            if let Some(remote) = remote {
                tcb.peer = SocketAddr {
                    addr: remote.addr,
                    port: remote.port,
                };
                tcb.netif = remote.netif;
                tcb.local.port = local_port;

                // Only active attempts are bounded; a listener waits for
                // the next connection request indefinitely.
                self.arm_connection_timeout(&mut tcb, &mbox);
            }
        }

        let mut result = fsm::step(&self.ctx, &self.tcb, FsmEvent::CallOpen).map(|_| ());

        // Wait until a connection was established or closed.
        while result.is_ok() {
            let state = self.state();
            if matches!(
                state,
                State::CLOSED | State::ESTABLISHED | State::CLOSE_WAIT,
            ) {
                break;
            }

            match mbox.get() {
                Msg::NotifyUser => {
                    // Bound the half-open SYN_RCVD phase of a listener so an
                    // unanswered SYN_ACK falls back to LISTEN eventually.
                    if passive && self.state() == State::SYN_RCVD {
                        let mut tcb = self.tcb.fsm.lock().unwrap();
                        self.arm_connection_timeout(&mut tcb, &mbox);
                    }
                }
                Msg::ConnectionTimeout => {
                    if passive {
                        // Stop the ongoing retransmission and wait for the
                        // next connection attempt.
                        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::ClearRetransmit);
                        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::CallOpen);
                    } else {
                        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::TimeoutConnection);
                        result = Err(Error::TimedOut);
                    }
                }
                msg => debug!("open received unexpected message: {msg:?}"),
            }
        }

        self.unbind(&mbox);

        // The FSM went to CLOSED without a timeout: the peer refused.
        if result.is_ok() && self.state() == State::CLOSED {
            result = Err(Error::ConnRefused);
        }

        result
    }

    /// Transmits `data`, blocking until at least a prefix of it was
    /// accepted *and* acknowledged by the peer, then returns the number of
    /// bytes taken.
    ///
    /// While the peer advertises a zero window the call probes it with
    /// exponential backoff. `user_timeout` bounds the whole call; `None`
    /// leaves only the connection timeout.
    ///
    /// # Errors
    ///
    /// [Error::NotConnected] outside ESTABLISHED/CLOSE_WAIT,
    /// [Error::ConnReset] when the peer reset the connection,
    /// [Error::ConnAborted] on the connection timeout and
    /// [Error::TimedOut] on the user timeout.
    pub fn send(&self, data: &[u8], user_timeout: Option<Duration>) -> Result<usize> {
        let _guard = self.tcb.function_lock.lock().unwrap();
        let mbox = Mailbox::new();

        {
            let mut tcb = self.tcb.fsm.lock().unwrap();
            if !matches!(tcb.state, State::ESTABLISHED | State::CLOSE_WAIT) {
                return Err(Error::NotConnected);
            }

            tcb.mbox = Some(mbox.clone());
            self.arm_connection_timeout(&mut tcb, &mbox);
        }

        let mut user_slot = TimerSlot::new();
        if let Some(timeout) = user_timeout
            && !timeout.is_zero()
        {
            self.ctx
                .timers
                .schedule(&mut user_slot, timeout, Msg::UserTimeout, &mbox);
        }

        let mut probe_slot = TimerSlot::new();
        let mut probing = false;
        let mut probe_backoff = Duration::ZERO;

        let mut accepted = 0usize;
        let mut error = None;

        // Loop until something was sent and acknowledged.
        loop {
            let (state, snd_wnd, outstanding) =
                self.with_tcb(|tcb| (tcb.state, tcb.snd.wnd, tcb.retransmit.is_some()));

            if accepted > 0 && !outstanding {
                break;
            }

            // A reset was received.
            if state == State::CLOSED {
                error = Some(Error::ConnReset);
                break;
            }

            // If the send window is closed: set up probing.
            if snd_wnd == 0 {
                if !probing {
                    probing = true;
                    probe_backoff = self.with_tcb(|tcb| tcb.rto);
                }
                self.ctx
                    .timers
                    .schedule(&mut probe_slot, probe_backoff, Msg::ProbeTimeout, &mbox);
            }

            if accepted == 0 && !probing {
                match fsm::step(&self.ctx, &self.tcb, FsmEvent::CallSend(data)) {
                    Ok(n) => accepted = n,
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
            }

            match mbox.get() {
                Msg::ConnectionTimeout => {
                    let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::TimeoutConnection);
                    error = Some(Error::ConnAborted);
                    break;
                }
                Msg::UserTimeout => {
                    let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::ClearRetransmit);
                    error = Some(Error::TimedOut);
                    break;
                }
                Msg::ProbeTimeout => {
                    let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::SendProbe);

                    probe_backoff = (probe_backoff * 2).clamp(
                        self.ctx.config.probe_lower_bound,
                        self.ctx.config.probe_upper_bound,
                    );
                }
                Msg::NotifyUser => {
                    // The connection is alive: reset the idle timeout.
                    {
                        let mut tcb = self.tcb.fsm.lock().unwrap();
                        self.arm_connection_timeout(&mut tcb, &mbox);
                    }

                    // If the window re-opened and we are probing: stop it.
                    if probing && self.with_tcb(|tcb| tcb.snd.wnd) > 0 {
                        probing = false;
                        self.ctx.timers.cancel(&mut probe_slot);
                    }
                }
                msg => debug!("send received unexpected message: {msg:?}"),
            }
        }

        self.unbind(&mbox);
        self.ctx.timers.cancel(&mut probe_slot);
        self.ctx.timers.cancel(&mut user_slot);

        match error {
            Some(err) => Err(err),
            None => Ok(accepted),
        }
    }

    /// Receives into `buf`, returning the number of bytes delivered.
    ///
    /// `Some(Duration::ZERO)` makes the call non-blocking; `None` blocks
    /// until data arrives or the connection times out. After the peer
    /// closed its side, the call drains the remaining bytes and then
    /// reports end-of-stream with `Ok(0)`.
    ///
    /// # Errors
    ///
    /// [Error::NotConnected] in states without a receivable stream,
    /// [Error::WouldBlock] for an empty non-blocking call,
    /// [Error::ConnReset], [Error::ConnAborted] and [Error::TimedOut] as
    /// in [TcpSocket::send].
    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let _guard = self.tcb.function_lock.lock().unwrap();

        let state = self.state();
        if !matches!(
            state,
            State::ESTABLISHED | State::FIN_WAIT_1 | State::FIN_WAIT_2 | State::CLOSE_WAIT,
        ) {
            return Err(Error::NotConnected);
        }

        // The peer sent FIN: drain what is buffered, zero marks the end of
        // the stream.
        if state == State::CLOSE_WAIT {
            return fsm::step(&self.ctx, &self.tcb, FsmEvent::CallRecv(buf));
        }

        // Non-blocking read.
        if timeout.is_some_and(|timeout| timeout.is_zero()) {
            let n = fsm::step(&self.ctx, &self.tcb, FsmEvent::CallRecv(buf))?;
            return if n == 0 { Err(Error::WouldBlock) } else { Ok(n) };
        }

        let mbox = Mailbox::new();
        {
            let mut tcb = self.tcb.fsm.lock().unwrap();
            tcb.mbox = Some(mbox.clone());
            self.arm_connection_timeout(&mut tcb, &mbox);
        }

        let mut user_slot = TimerSlot::new();
        if let Some(timeout) = timeout
            && !timeout.is_zero()
        {
            self.ctx
                .timers
                .schedule(&mut user_slot, timeout, Msg::UserTimeout, &mbox);
        }

        let mut delivered = 0usize;
        let mut error = None;

        while delivered == 0 {
            // A reset was received.
            if self.state() == State::CLOSED {
                error = Some(Error::ConnReset);
                break;
            }

            match fsm::step(&self.ctx, &self.tcb, FsmEvent::CallRecv(&mut *buf)) {
                Ok(n) => delivered = n,
                Err(err) => {
                    error = Some(err);
                    break;
                }
            }

            // The peer closed its side; whatever was drained is the result.
            if self.state() == State::CLOSE_WAIT {
                break;
            }

            if delivered == 0 {
                match mbox.get() {
                    Msg::ConnectionTimeout => {
                        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::TimeoutConnection);
                        error = Some(Error::ConnAborted);
                        break;
                    }
                    Msg::UserTimeout => {
                        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::ClearRetransmit);
                        error = Some(Error::TimedOut);
                        break;
                    }
                    Msg::NotifyUser => {}
                    msg => debug!("recv received unexpected message: {msg:?}"),
                }
            }
        }

        self.unbind(&mbox);
        self.ctx.timers.cancel(&mut user_slot);

        match error {
            Some(err) => Err(err),
            None => Ok(delivered),
        }
    }

    /// Gracefully closes the connection, blocking until the TCB reaches
    /// CLOSED (including the TIME_WAIT period when it applies).
    pub fn close(&self) {
        let _guard = self.tcb.function_lock.lock().unwrap();

        if self.state() == State::CLOSED {
            return;
        }

        let mbox = Mailbox::new();
        {
            let mut tcb = self.tcb.fsm.lock().unwrap();
            tcb.mbox = Some(mbox.clone());
            self.arm_connection_timeout(&mut tcb, &mbox);
        }

        // Start the connection teardown sequence.
        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::CallClose);

        while self.state() != State::CLOSED {
            match mbox.get() {
                Msg::ConnectionTimeout => {
                    let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::TimeoutConnection);
                }
                Msg::NotifyUser => {}
                msg => debug!("close received unexpected message: {msg:?}"),
            }
        }

        self.unbind(&mbox);
    }

    /// Tears the connection down immediately, emitting a RST when the peer
    /// is known. Never blocks.
    pub fn abort(&self) {
        let _guard = self.tcb.function_lock.lock().unwrap();
        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::CallAbort);
    }

    fn with_tcb<R>(&self, f: impl FnOnce(&mut Tcb) -> R) -> R {
        f(&mut self.tcb.fsm.lock().unwrap())
    }

    /// (Re)arms the idle-connection timeout on the TCB's misc slot.
    fn arm_connection_timeout(&self, tcb: &mut Tcb, mbox: &Mailbox) {
        self.ctx.timers.schedule(
            &mut tcb.slot_misc,
            self.ctx.config.connection_timeout,
            Msg::ConnectionTimeout,
            mbox,
        );
    }

    /// Unbinds the call's mailbox and disarms the idle timeout.
    fn unbind(&self, _mbox: &Mailbox) {
        let mut tcb = self.tcb.fsm.lock().unwrap();
        tcb.mbox = None;

        // The misc slot may meanwhile serve the TIME_WAIT expiry; only a
        // pending idle timeout aimed at this call is cancelled.
        if tcb.time_wait_deadline.is_none() {
            self.ctx.timers.cancel(&mut tcb.slot_misc);
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let _ = fsm::step(&self.ctx, &self.tcb, FsmEvent::CallAbort);

        let mut sockets = self.ctx.sockets.lock().unwrap();
        sockets.retain(|handle| !std::ptr::eq(Arc::as_ptr(handle), Arc::as_ptr(&self.tcb)));
    }
}
