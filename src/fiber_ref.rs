//! Opaque, cheap-to-copy handles to fibers.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use crate::error::SendError;
use crate::event::{Event, PendingEvent};
use crate::fiber::ControlBlock;
use crate::path::Path;
use crate::promise::Promise;

/// Where a fiber lives relative to the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// A fiber in this process.
    Local,
    /// Reserved for future distribution; never produced by this runtime.
    Remote,
    /// The target is gone or the system is shutting down; sends are
    /// discarded.
    DeadLetter,
}

#[derive(Clone)]
enum RefInner {
    Local(Arc<ControlBlock>),
    DeadLetter {
        path: Path,
        finished: Path,
        crashed: Path,
    },
}

/// A handle to a fiber. Clones share the same underlying block; the only
/// capabilities are sending events and observing termination.
#[derive(Clone)]
pub struct FiberRef {
    inner: RefInner,
}

impl FiberRef {
    pub(crate) fn local(block: Arc<ControlBlock>) -> Self {
        FiberRef {
            inner: RefInner::Local(block),
        }
    }

    pub(crate) fn dead_letter(path: Path) -> Self {
        FiberRef {
            inner: RefInner::DeadLetter {
                path,
                finished: Path::unique(),
                crashed: Path::unique(),
            },
        }
    }

    /// Queues an event for the fiber, waking it if it was suspended.
    ///
    /// Sends to dead or dead-letter targets are discarded: senders
    /// routinely race fiber termination, so this is not an error. A full
    /// bounded mailbox also discards; use [`try_send`](Self::try_send) to
    /// observe that case.
    pub fn send<A: Send + 'static>(&self, event: &Event<A>, value: A) {
        match &self.inner {
            RefInner::Local(block) => {
                let pending = PendingEvent::new(event.path().clone(), value);
                if block.enqueue(pending).is_err() {
                    debug!(fiber = %block.path(), event = %event.path(), "mailbox full; event dropped");
                }
            }
            RefInner::DeadLetter { path, .. } => {
                debug!(fiber = %path, event = %event.path(), "send to dead-letter reference dropped");
            }
        }
    }

    /// Like [`send`](Self::send), but surfaces a full bounded mailbox to
    /// the caller. Dead-letter discards still succeed.
    pub fn try_send<A: Send + 'static>(&self, event: &Event<A>, value: A) -> Result<(), SendError> {
        match &self.inner {
            RefInner::Local(block) => {
                let pending = PendingEvent::new(event.path().clone(), value);
                block.enqueue(pending).map_err(|_| SendError::Full)
            }
            RefInner::DeadLetter { .. } => Ok(()),
        }
    }

    /// Path of the fiber this reference points to.
    pub fn path(&self) -> &Path {
        match &self.inner {
            RefInner::Local(block) => block.path(),
            RefInner::DeadLetter { path, .. } => path,
        }
    }

    /// References to dead fibers report [`Locality::DeadLetter`]: they
    /// behave exactly like dead-letter references from that point on.
    pub fn locality(&self) -> Locality {
        match &self.inner {
            RefInner::Local(block) => {
                if block.is_dead() {
                    Locality::DeadLetter
                } else {
                    Locality::Local
                }
            }
            RefInner::DeadLetter { .. } => Locality::DeadLetter,
        }
    }

    /// The event emitted to the spawner when this fiber returns normally.
    pub fn finished_event(&self) -> Event<()> {
        match &self.inner {
            RefInner::Local(block) => Event::from_path(block.finished_path().clone()),
            RefInner::DeadLetter { finished, .. } => Event::from_path(finished.clone()),
        }
    }

    /// The event emitted to the spawner when this fiber crashes.
    pub fn crashed_event(&self) -> Event<()> {
        match &self.inner {
            RefInner::Local(block) => Event::from_path(block.crashed_path().clone()),
            RefInner::DeadLetter { crashed, .. } => Event::from_path(crashed.clone()),
        }
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("path", self.path())
            .field("locality", &self.locality())
            .finish()
    }
}

/// Reference to a fiber that yields a result: the fiber handle plus its
/// result promise.
pub struct FutureRef<A> {
    fiber: FiberRef,
    result: Arc<Promise<A>>,
}

impl<A> FutureRef<A> {
    pub(crate) fn new(fiber: FiberRef, result: Arc<Promise<A>>) -> Self {
        FutureRef { fiber, result }
    }

    /// The promise that resolves with the fiber's return value, or fails if
    /// the fiber crashes.
    pub fn result(&self) -> &Promise<A> {
        &self.result
    }
}

impl<A> Clone for FutureRef<A> {
    fn clone(&self) -> Self {
        FutureRef {
            fiber: self.fiber.clone(),
            result: self.result.clone(),
        }
    }
}

impl<A> Deref for FutureRef<A> {
    type Target = FiberRef;

    fn deref(&self) -> &FiberRef {
        &self.fiber
    }
}
