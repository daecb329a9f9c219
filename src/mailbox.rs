//! Bounded mailbox carrying the typed messages that drive the FSM.
//!
//! The mailbox is the sole suspension point for blocking user calls: a call
//! binds a freshly created mailbox to its TCB, sleeps in [Mailbox::get] and
//! is woken by the event loop or the timer service. Putting never blocks;
//! a full queue drops the message, the sender keeps going.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::config::MSG_QUEUE_SIZE;
use crate::net::Datagram;

/// Messages exchanged between the timer service, the event loop, and
/// blocking user calls.
#[derive(Debug, Clone)]
pub(crate) enum Msg {
    /// The FSM changed connection state on behalf of the bound user call.
    NotifyUser,
    /// The idle-connection timeout of a blocked user call expired.
    ConnectionTimeout,
    /// The user-specified timeout of a send or receive call expired.
    UserTimeout,
    /// The next zero-window probe is due.
    ProbeTimeout,
    /// A retransmission deadline may have expired somewhere in the stack.
    RetransmitTick,
    /// A TIME_WAIT deadline may have expired somewhere in the stack.
    TimeWaitTick,
    /// The network layer delivered a datagram.
    Packet(Datagram),
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<Msg>>,
    avail: Condvar,
}

/// Bounded FIFO of [Msg] values.
///
/// Clones are handles to the same queue.
#[derive(Debug, Clone)]
pub(crate) struct Mailbox {
    shared: Arc<Shared>,
    capacity: usize,
}

impl Mailbox {
    /// Creates an empty mailbox with the compile-time capacity.
    pub(crate) fn new() -> Self {
        Self::with_capacity(MSG_QUEUE_SIZE)
    }

    /// Creates an empty mailbox holding up to `capacity` messages.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());

        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                avail: Condvar::new(),
            }),
            capacity,
        }
    }

    /// Appends a message without blocking.
    ///
    /// Returns the message back to the caller if the queue is full. The
    /// receiver is expected to recover through its own timeouts, so callers
    /// may ignore the returned value.
    pub(crate) fn put(&self, msg: Msg) -> Result<(), Msg> {
        let mut queue = self.shared.queue.lock().unwrap();

        if queue.len() >= self.capacity {
            return Err(msg);
        }

        queue.push_back(msg);
        drop(queue);

        self.shared.avail.notify_one();
        Ok(())
    }

    /// Removes the front message, blocking until one is available.
    pub(crate) fn get(&self) -> Msg {
        let mut queue = self.shared.queue.lock().unwrap();

        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = self.shared.avail.wait(queue).unwrap();
        }
    }

    /// Removes the front message if one is available.
    #[cfg(test)]
    pub(crate) fn try_get(&self) -> Option<Msg> {
        self.shared.queue.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_put_get_in_order() {
        let mbox = Mailbox::with_capacity(4);

        mbox.put(Msg::NotifyUser).unwrap();
        mbox.put(Msg::ConnectionTimeout).unwrap();

        assert!(matches!(mbox.get(), Msg::NotifyUser));
        assert!(matches!(mbox.get(), Msg::ConnectionTimeout));
        assert!(mbox.try_get().is_none());
    }

    #[test]
    fn mailbox_put_full_drops() {
        let mbox = Mailbox::with_capacity(2);

        mbox.put(Msg::NotifyUser).unwrap();
        mbox.put(Msg::NotifyUser).unwrap();

        assert!(matches!(mbox.put(Msg::ProbeTimeout), Err(Msg::ProbeTimeout)));
    }

    #[test]
    fn mailbox_get_blocks_until_put() {
        let mbox = Mailbox::with_capacity(2);
        let remote = mbox.clone();

        let handle = std::thread::spawn(move || remote.get());

        std::thread::sleep(std::time::Duration::from_millis(20));
        mbox.put(Msg::NotifyUser).unwrap();

        assert!(matches!(handle.join().unwrap(), Msg::NotifyUser));
    }
}
