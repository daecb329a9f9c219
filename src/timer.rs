//! Deadline scheduler posting typed messages to mailboxes.
//!
//! One [TimerService] exists per stack. Events are held in a map ordered by
//! absolute wakeup time; an internal driver thread sleeps until the head
//! event is due, posts its message and advances. Timer messages never carry
//! payload beyond their type.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::mailbox::{Mailbox, Msg};

/// A reusable handle to one scheduled event.
///
/// The slot is a plain value owned by its user (a TCB field or a local of a
/// blocking call). Scheduling an armed slot reschedules it; cancelling an
/// unarmed slot is a no-op.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    key: Option<(Instant, u64)>,
}

impl TimerSlot {
    /// Creates an unarmed slot.
    pub(crate) fn new() -> Self {
        Self { key: None }
    }
}

#[derive(Debug)]
struct Entry {
    msg: Msg,
    target: Mailbox,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<BTreeMap<(Instant, u64), Entry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Scheduler with a dedicated driver thread.
#[derive(Debug)]
pub(crate) struct TimerService {
    shared: Arc<Shared>,
    seq: AtomicU64,
}

impl TimerService {
    /// Creates the scheduler and spawns its driver thread.
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BTreeMap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let driver = Arc::clone(&shared);
        thread::Builder::new()
            .name("tcp-timer".into())
            .spawn(move || Self::drive(driver))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            seq: AtomicU64::new(0),
        }
    }

    /// Arms `slot` to post `msg` to `target` after `offset`.
    ///
    /// An already armed slot is cancelled first, so a slot never names more
    /// than one pending event.
    pub(crate) fn schedule(&self, slot: &mut TimerSlot, offset: Duration, msg: Msg, target: &Mailbox) {
        let key = (Instant::now() + offset, self.seq.fetch_add(1, Ordering::Relaxed));

        let mut queue = self.shared.queue.lock().unwrap();
        if let Some(old) = slot.key.take() {
            queue.remove(&old);
        }
        queue.insert(
            key,
            Entry {
                msg,
                target: target.clone(),
            },
        );
        slot.key = Some(key);
        drop(queue);

        self.shared.wakeup.notify_one();
    }

    /// Disarms `slot` if it names a pending event.
    pub(crate) fn cancel(&self, slot: &mut TimerSlot) {
        if let Some(key) = slot.key.take() {
            self.shared.queue.lock().unwrap().remove(&key);
            self.shared.wakeup.notify_one();
        }
    }

    fn drive(shared: Arc<Shared>) {
        let mut queue = shared.queue.lock().unwrap();

        loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                return;
            }

            let now = Instant::now();
            let head = queue.first_key_value().map(|(&(deadline, _), _)| deadline);

            match head {
                None => {
                    queue = shared.wakeup.wait(queue).unwrap();
                }
                Some(deadline) if deadline <= now => {
                    let (_, entry) = queue.pop_first().unwrap();
                    drop(queue);

                    // A full target mailbox loses the notification; the
                    // receiver recovers through its remaining timeouts.
                    let _ = entry.target.put(entry.msg);

                    queue = shared.queue.lock().unwrap();
                }
                Some(deadline) => {
                    let (guard, _) = shared
                        .wakeup
                        .wait_timeout(queue, deadline - now)
                        .unwrap();
                    queue = guard;
                }
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_posts_after_offset() {
        let timers = TimerService::new();
        let mbox = Mailbox::new();
        let mut slot = TimerSlot::new();

        let start = Instant::now();
        timers.schedule(&mut slot, Duration::from_millis(30), Msg::ProbeTimeout, &mbox);

        assert!(matches!(mbox.get(), Msg::ProbeTimeout));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn timer_cancel_unarmed_is_noop() {
        let timers = TimerService::new();
        let mut slot = TimerSlot::new();

        timers.cancel(&mut slot);
        timers.cancel(&mut slot);
    }

    #[test]
    fn timer_reschedule_replaces_pending_event() {
        let timers = TimerService::new();
        let mbox = Mailbox::new();
        let mut slot = TimerSlot::new();

        timers.schedule(&mut slot, Duration::from_millis(10), Msg::UserTimeout, &mbox);
        timers.schedule(&mut slot, Duration::from_millis(40), Msg::ConnectionTimeout, &mbox);

        // Only the rescheduled event fires.
        assert!(matches!(mbox.get(), Msg::ConnectionTimeout));
        std::thread::sleep(Duration::from_millis(30));
        assert!(mbox.try_get().is_none());
    }

    #[test]
    fn timer_events_fire_in_deadline_order() {
        let timers = TimerService::new();
        let mbox = Mailbox::new();
        let mut first = TimerSlot::new();
        let mut second = TimerSlot::new();

        timers.schedule(&mut second, Duration::from_millis(60), Msg::TimeWaitTick, &mbox);
        timers.schedule(&mut first, Duration::from_millis(20), Msg::RetransmitTick, &mbox);

        assert!(matches!(mbox.get(), Msg::RetransmitTick));
        assert!(matches!(mbox.get(), Msg::TimeWaitTick));
    }
}
