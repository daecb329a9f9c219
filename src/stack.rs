//! The explicitly constructed stack context: timer service, receive-buffer
//! pool, socket table and the network-layer handle, shared by the event
//! loop and every socket of one stack instance.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::eventloop;
use crate::mailbox::Mailbox;
use crate::net::NetLayer;
use crate::protocol::tcb::TcbHandle;
use crate::rcvbuf::RcvBufPool;
use crate::timer::TimerService;

/// Capacity of the event-loop mailbox, shared by inbound datagrams and
/// housekeeping timer ticks. Must be a power of two.
const EVENT_QUEUE_SIZE: usize = 64;

/// Shared state of one stack instance.
pub(crate) struct StackCtx {
    /// Stack tunables.
    pub(crate) config: Config,
    /// Deadline scheduler shared by all connections.
    pub(crate) timers: TimerService,
    /// Receive-buffer pool shared by all connections.
    pub(crate) pool: RcvBufPool,
    /// Every TCB created on this stack.
    pub(crate) sockets: Mutex<Vec<Arc<TcbHandle>>>,
    /// Mailbox driving the event-loop task.
    pub(crate) evl_mbox: Mailbox,
    /// The network layer below.
    pub(crate) net: Arc<dyn NetLayer>,
}

impl fmt::Debug for StackCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackCtx")
            .field("config", &self.config)
            .field("sockets", &self.sockets.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

/// One running TCP stack on top of a network layer.
///
/// Creating the stack spawns its timer-driver, ingress and event-loop
/// threads; sockets are created with [crate::TcpSocket::new].
#[derive(Debug)]
pub struct TcpStack {
    pub(crate) ctx: Arc<StackCtx>,
}

impl TcpStack {
    /// Builds the stack services on top of `net` and starts processing.
    pub fn new(net: Arc<dyn NetLayer>, config: Config) -> Self {
        let ctx = Arc::new(StackCtx {
            timers: TimerService::new(),
            pool: RcvBufPool::new(config.rcv_buffers, config.rcv_buf_size),
            sockets: Mutex::new(Vec::new()),
            evl_mbox: Mailbox::with_capacity(EVENT_QUEUE_SIZE),
            net,
            config,
        });

        eventloop::spawn(Arc::clone(&ctx));

        Self { ctx }
    }
}
