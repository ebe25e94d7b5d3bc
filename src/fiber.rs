//! Fiber control blocks and the stack-switching lifecycle.
//!
//! A control block is the per-fiber record: identity, life status, mailbox,
//! dispatch state and the execution flavor. Microthread fibers own a
//! `corosensei` coroutine (stack plus saved machine context); thread-backed
//! fibers and fiberized host threads use a condition variable instead.

use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::context::{self, EventContext};
use crate::event::PendingEvent;
use crate::mailbox::Mailbox;
use crate::path::Path;
use crate::system::SystemShared;

/// Life status of a fiber. Dead is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifeStatus {
    /// Parked; not on any run queue. A sender observing this wakes the fiber.
    Suspended,
    /// On a run queue (or about to be notified, for thread-backed fibers).
    Scheduled,
    /// Executing on exactly one worker or thread.
    Running,
    /// Returned or crashed; never runs again.
    Dead,
}

/// What the fiber asks of its worker when it switches back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchCommand {
    /// Stay runnable; push back onto the local deque.
    Reschedule,
    /// Parked waiting for mail. Status was set Suspended under the status
    /// mutex, which is still held and must be released by the worker.
    Suspend,
}

/// Outcome of resuming a microthread fiber, as seen by the worker.
pub(crate) enum RunOutcome {
    Rescheduled,
    Suspended,
    Finished,
}

/// Execution flavor of a control block.
pub(crate) enum Flavor {
    /// Multiplexed onto the worker pool via stack switching.
    Micro {
        /// The coroutine holding the fiber's stack and saved context.
        /// Touched only by the worker that owns the block in Running state.
        stack: UnsafeCell<Option<Coroutine<(), SwitchCommand, ()>>>,
        /// Suspension point recorded at coroutine entry; valid while the
        /// fiber body is on its stack.
        yielder: Cell<*const Yielder<(), SwitchCommand>>,
        /// Scheduler this fiber is pinned to, if any.
        bound: Option<usize>,
    },
    /// Backed by a dedicated OS thread (or a fiberized host thread).
    Thread { wakeup: Condvar },
}

/// The per-fiber record. Shared ownership: fiber references, promises and
/// run queues may all outlive the fiber body.
pub(crate) struct ControlBlock {
    path: Path,
    status: Mutex<LifeStatus>,
    mailbox: Box<dyn Mailbox>,
    ctx: EventContext,
    flavor: Flavor,
    system: Arc<SystemShared>,
    finished_path: Path,
    crashed_path: Path,
}

// SAFETY: the non-Sync state (coroutine cell, yielder cell, event context)
// is only ever touched by the single thread currently holding the block in
// Running state; the status mutex enforces at most one such runner. The
// mailbox and status word are internally synchronized.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    pub(crate) fn new_micro(
        path: Path,
        mailbox: Box<dyn Mailbox>,
        bound: Option<usize>,
        system: Arc<SystemShared>,
    ) -> Arc<ControlBlock> {
        Arc::new(ControlBlock {
            path,
            status: Mutex::new(LifeStatus::Scheduled),
            mailbox,
            ctx: EventContext::new(),
            flavor: Flavor::Micro {
                stack: UnsafeCell::new(None),
                yielder: Cell::new(std::ptr::null()),
                bound,
            },
            system,
            finished_path: Path::unique(),
            crashed_path: Path::unique(),
        })
    }

    pub(crate) fn new_thread(
        path: Path,
        mailbox: Box<dyn Mailbox>,
        system: Arc<SystemShared>,
    ) -> Arc<ControlBlock> {
        Arc::new(ControlBlock {
            path,
            status: Mutex::new(LifeStatus::Running),
            mailbox,
            ctx: EventContext::new(),
            flavor: Flavor::Thread {
                wakeup: Condvar::new(),
            },
            system,
            finished_path: Path::unique(),
            crashed_path: Path::unique(),
        })
    }

    /// Builds the coroutine around the erased entry functor. Called once,
    /// before the block is shared with any queue or reference.
    pub(crate) fn install_entry(&self, entry: Box<dyn FnOnce() + Send>) {
        let Flavor::Micro { stack, .. } = &self.flavor else {
            return;
        };
        let coroutine: Coroutine<(), SwitchCommand, ()> = Coroutine::new(move |yielder, _: ()| {
            // The trampoline: record the suspension point for this fiber,
            // then hand control to the entry functor. Completion
            // bookkeeping (promise, watcher events) lives inside the
            // functor; the worker handles the Dead transition.
            context::register_yielder(yielder);
            entry();
        });
        // SAFETY: the block is not yet shared; no other thread can observe
        // the cell.
        unsafe { *stack.get() = Some(coroutine) };
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn finished_path(&self) -> &Path {
        &self.finished_path
    }

    pub(crate) fn crashed_path(&self) -> &Path {
        &self.crashed_path
    }

    pub(crate) fn system(&self) -> &Arc<SystemShared> {
        &self.system
    }

    pub(crate) fn bound_index(&self) -> Option<usize> {
        match &self.flavor {
            Flavor::Micro { bound, .. } => *bound,
            Flavor::Thread { .. } => None,
        }
    }

    /// Dispatch state. Only the thread currently running this fiber may use
    /// the returned context.
    pub(crate) fn ctx(&self) -> &EventContext {
        &self.ctx
    }

    pub(crate) fn mailbox(&self) -> &dyn Mailbox {
        &*self.mailbox
    }

    pub(crate) fn set_yielder(&self, yielder: *const Yielder<(), SwitchCommand>) {
        if let Flavor::Micro { yielder: cell, .. } = &self.flavor {
            cell.set(yielder);
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        *self.status.lock() == LifeStatus::Dead
    }

    /// Queues an event and wakes the fiber if it was suspended.
    ///
    /// Protocol (lost-wakeup avoidance): push into the mailbox first, then
    /// take the status mutex; a suspended fiber is moved to Scheduled and
    /// placed on a run queue. A fiber observed Scheduled or Running will
    /// drain the mailbox before it next suspends, so nothing is done.
    pub(crate) fn enqueue(self: &Arc<Self>, event: PendingEvent) -> Result<(), PendingEvent> {
        self.mailbox.enqueue(event)?;
        let mut status = self.status.lock();
        match *status {
            LifeStatus::Suspended => {
                *status = LifeStatus::Scheduled;
                match &self.flavor {
                    Flavor::Micro { bound, .. } => {
                        let bound = *bound;
                        drop(status);
                        self.system.schedule(self.clone(), bound);
                    }
                    Flavor::Thread { wakeup } => {
                        drop(status);
                        wakeup.notify_one();
                    }
                }
            }
            LifeStatus::Dead => {
                // Senders routinely race fiber termination; the event stays
                // in the mailbox and is freed when the block is reclaimed.
                debug!(fiber = %self.path, "event sent to dead fiber");
            }
            LifeStatus::Scheduled | LifeStatus::Running => {}
        }
        Ok(())
    }

    /// Scheduled -> Running, taken by a worker just before switching in.
    pub(crate) fn set_running(&self) {
        let mut status = self.status.lock();
        debug_assert_eq!(*status, LifeStatus::Scheduled);
        *status = LifeStatus::Running;
    }

    /// Running -> Scheduled, for fibers that ceded without suspending.
    pub(crate) fn set_scheduled(&self) {
        *self.status.lock() = LifeStatus::Scheduled;
    }

    /// Releases the status mutex a suspending fiber left locked across the
    /// stack switch.
    ///
    /// # Safety
    ///
    /// Must be called exactly once by the worker, right after a resume
    /// returned [`SwitchCommand::Suspend`].
    pub(crate) unsafe fn release_suspend_handoff(&self) {
        self.status.force_unlock();
    }

    /// Running -> Dead. Frees any mail that arrived after the fiber stopped
    /// processing and releases the stack.
    pub(crate) fn mark_dead(&self) {
        *self.status.lock() = LifeStatus::Dead;
        if let Flavor::Micro { stack, .. } = &self.flavor {
            // SAFETY: the fiber has returned; this worker is the only
            // thread touching the cell.
            unsafe { *stack.get() = None };
        }
        while self.mailbox.dequeue().is_some() {}
    }

    /// Switches onto the fiber's stack and runs it until it switches back.
    /// Worker-side half of the switching protocol.
    pub(crate) fn resume(&self) -> RunOutcome {
        let Flavor::Micro { stack, .. } = &self.flavor else {
            // Thread-backed blocks never appear on a run queue.
            return RunOutcome::Finished;
        };
        // SAFETY: status was moved Scheduled -> Running under the block
        // mutex by this worker; no other thread touches the cell until the
        // fiber switches back.
        let coroutine = unsafe { &mut *stack.get() };
        let Some(coroutine) = coroutine.as_mut() else {
            return RunOutcome::Finished;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume(()))) {
            Ok(CoroutineResult::Yield(SwitchCommand::Reschedule)) => RunOutcome::Rescheduled,
            Ok(CoroutineResult::Yield(SwitchCommand::Suspend)) => RunOutcome::Suspended,
            Ok(CoroutineResult::Return(())) => RunOutcome::Finished,
            Err(payload) => {
                // The entry functor catches fiber panics itself; anything
                // surfacing here escaped during unwinding.
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic payload"
                };
                error!(fiber = %self.path, panic = msg, "fiber aborted");
                RunOutcome::Finished
            }
        }
    }

    /// Fiber-side suspend: park until new mail arrives.
    ///
    /// Re-checks the mailbox while holding the status mutex so that an
    /// enqueue racing the suspension is never lost; returns without
    /// suspending when mail is already waiting.
    pub(crate) fn suspend(&self) {
        match &self.flavor {
            Flavor::Micro { yielder, .. } => {
                let mut status = self.status.lock();
                if !self.mailbox.is_empty() {
                    return;
                }
                *status = LifeStatus::Suspended;
                // The mutex stays locked across the switch; the worker
                // releases it once this stack is fully saved, so a waker
                // can never resume a half-switched fiber.
                std::mem::forget(status);
                let yielder = yielder.get();
                debug_assert!(!yielder.is_null());
                // SAFETY: recorded at coroutine entry; the fiber body is on
                // its stack for as long as this code runs.
                unsafe { (*yielder).suspend(SwitchCommand::Suspend) };
                // Resumed: the worker already moved us back to Running.
            }
            Flavor::Thread { wakeup } => {
                let mut status = self.status.lock();
                if !self.mailbox.is_empty() {
                    return;
                }
                *status = LifeStatus::Suspended;
                while *status != LifeStatus::Scheduled {
                    wakeup.wait(&mut status);
                }
                *status = LifeStatus::Running;
            }
        }
    }

    /// Fiber-side cooperative yield: give up the worker but stay runnable.
    pub(crate) fn cede(&self) {
        match &self.flavor {
            Flavor::Micro { yielder, .. } => {
                let yielder = yielder.get();
                debug_assert!(!yielder.is_null());
                // SAFETY: as in `suspend`.
                unsafe { (*yielder).suspend(SwitchCommand::Reschedule) };
            }
            Flavor::Thread { .. } => std::thread::yield_now(),
        }
    }
}
