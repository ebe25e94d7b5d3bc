//! Per-fiber event queues.
//!
//! A mailbox is a multi-producer, single-consumer FIFO of [`PendingEvent`]s.
//! Any thread may enqueue; only the owning fiber dequeues. Events from a
//! single producer are observed in the order they were sent.

use std::collections::VecDeque;

use crossbeam::queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;

use crate::event::PendingEvent;

/// Queue of pending events addressed to one fiber.
///
/// `enqueue` is non-blocking and thread-safe for any number of producers;
/// `dequeue` is called only by the owning fiber. Dropping a mailbox drops
/// every remaining pending event, which frees their payloads.
pub trait Mailbox: Send + Sync {
    /// Queues an event. Returns it back if the mailbox refuses it (bounded
    /// variants at capacity); unbounded variants never refuse.
    fn enqueue(&self, event: PendingEvent) -> Result<(), PendingEvent>;

    /// Takes the oldest pending event, if any. Owner-only.
    fn dequeue(&self) -> Option<PendingEvent>;

    /// Whether the mailbox currently holds no events.
    fn is_empty(&self) -> bool;
}

/// The default lock-free mailbox, unbounded.
#[derive(Default)]
pub struct LockfreeMailbox {
    queue: SegQueue<PendingEvent>,
}

impl LockfreeMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mailbox for LockfreeMailbox {
    fn enqueue(&self, event: PendingEvent) -> Result<(), PendingEvent> {
        self.queue.push(event);
        Ok(())
    }

    fn dequeue(&self) -> Option<PendingEvent> {
        self.queue.pop()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A lock-based mailbox, unbounded. Slower than [`LockfreeMailbox`] but
/// easier to reason about when debugging delivery problems.
#[derive(Default)]
pub struct LockingMailbox {
    queue: Mutex<VecDeque<PendingEvent>>,
}

impl LockingMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mailbox for LockingMailbox {
    fn enqueue(&self, event: PendingEvent) -> Result<(), PendingEvent> {
        self.queue.lock().push_back(event);
        Ok(())
    }

    fn dequeue(&self) -> Option<PendingEvent> {
        self.queue.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// A fixed-capacity mailbox.
///
/// A full bounded mailbox refuses new events: [`FiberRef::try_send`] surfaces
/// the refusal as [`SendError::Full`], while infallible sends drop the event
/// with a debug log.
///
/// [`FiberRef::try_send`]: crate::FiberRef::try_send
/// [`SendError::Full`]: crate::SendError::Full
pub struct BoundedMailbox {
    queue: ArrayQueue<PendingEvent>,
}

impl BoundedMailbox {
    pub fn new(capacity: usize) -> Self {
        BoundedMailbox {
            queue: ArrayQueue::new(capacity),
        }
    }
}

impl Mailbox for BoundedMailbox {
    fn enqueue(&self, event: PendingEvent) -> Result<(), PendingEvent> {
        self.queue.push(event)
    }

    fn dequeue(&self) -> Option<PendingEvent> {
        self.queue.pop()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pending(path: Path, value: u32) -> PendingEvent {
        PendingEvent::new(path, value)
    }

    fn payload_of(event: &PendingEvent) -> u32 {
        *event.data.downcast_ref::<u32>().unwrap()
    }

    #[test]
    fn lockfree_preserves_fifo_order() {
        let mailbox = LockfreeMailbox::new();
        for i in 0..100 {
            mailbox.enqueue(pending(Path::named("e"), i)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(payload_of(&mailbox.dequeue().unwrap()), i);
        }
        assert!(mailbox.is_empty());
    }

    #[test]
    fn locking_preserves_fifo_order() {
        let mailbox = LockingMailbox::new();
        for i in 0..100 {
            mailbox.enqueue(pending(Path::named("e"), i)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(payload_of(&mailbox.dequeue().unwrap()), i);
        }
    }

    #[test]
    fn bounded_refuses_when_full() {
        let mailbox = BoundedMailbox::new(2);
        assert!(mailbox.enqueue(pending(Path::named("e"), 0)).is_ok());
        assert!(mailbox.enqueue(pending(Path::named("e"), 1)).is_ok());
        let refused = mailbox.enqueue(pending(Path::named("e"), 2));
        assert_eq!(payload_of(&refused.unwrap_err()), 2);
        mailbox.dequeue().unwrap();
        assert!(mailbox.enqueue(pending(Path::named("e"), 3)).is_ok());
    }

    #[test]
    fn drop_frees_remaining_events() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mailbox = LockfreeMailbox::new();
        for _ in 0..5 {
            mailbox
                .enqueue(PendingEvent::new(Path::unique(), Tracked(drops.clone())))
                .unwrap();
        }
        drop(mailbox);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn concurrent_producers_are_all_observed() {
        let mailbox = Arc::new(LockfreeMailbox::new());
        let mut threads = Vec::new();
        for producer in 0..4u32 {
            let mailbox = mailbox.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    mailbox
                        .enqueue(pending(Path::named("e"), producer * 1000 + i))
                        .unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        // Per-producer order: each producer's values must come out ascending.
        let mut last = [None::<u32>; 4];
        let mut total = 0;
        while let Some(event) = mailbox.dequeue() {
            let value = payload_of(&event);
            let producer = (value / 1000) as usize;
            if let Some(prev) = last[producer] {
                assert!(value > prev);
            }
            last[producer] = Some(value);
            total += 1;
        }
        assert_eq!(total, 4000);
    }
}
