//! Declarative configuration of a to-be-spawned fiber.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::context;
use crate::error::FiberError;
use crate::event::Event;
use crate::fiber::ControlBlock;
use crate::fiber_ref::{FiberRef, FutureRef};
use crate::mailbox::{BoundedMailbox, LockfreeMailbox, Mailbox};
use crate::path::Path;
use crate::promise::Promise;
use crate::scheduler::SchedulerId;
use crate::system::FiberSystem;

type MailboxFactory = Arc<dyn Fn() -> Box<dyn Mailbox> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BuildFlavor {
    Microthread,
    OsThread,
}

/// Fluent configuration for a fiber: name, mailbox, pinning and execution
/// flavor.
///
/// Modifiers consume the builder, so a moved-from builder cannot be reused
/// by construction; clone one to keep a reusable configuration. Obtained
/// from [`FiberSystem::fiber`].
#[derive(Clone)]
pub struct Builder {
    system: FiberSystem,
    name: Option<String>,
    mailbox: MailboxFactory,
    pin: Option<usize>,
    flavor: BuildFlavor,
}

impl Builder {
    pub(crate) fn new(system: FiberSystem) -> Self {
        Builder {
            system,
            name: None,
            mailbox: Arc::new(|| Box::new(LockfreeMailbox::new())),
            pin: None,
            flavor: BuildFlavor::Microthread,
        }
    }

    /// Gives the fiber a name in the global namespace.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Reverts to a generated unique name. This is the default.
    pub fn unnamed(mut self) -> Self {
        self.name = None;
        self
    }

    /// Pins the fiber to the scheduler of the calling worker. Pinned fibers
    /// are never stolen. No effect when called off a worker thread.
    pub fn pinned(mut self) -> Self {
        self.pin = context::current_scheduler();
        self
    }

    /// Pins the fiber to a specific scheduler (see
    /// [`FiberSystem::scheduler_ids`]).
    pub fn pinned_to(mut self, scheduler: SchedulerId) -> Self {
        self.pin = Some(scheduler.0);
        self
    }

    /// Lets the fiber run on any scheduler. This is the default.
    pub fn detached(mut self) -> Self {
        self.pin = None;
        self
    }

    /// Uses a custom mailbox for the fiber.
    pub fn with_mailbox<F, M>(mut self, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Mailbox + 'static,
    {
        self.mailbox = Arc::new(move || Box::new(factory()) as Box<dyn Mailbox>);
        self
    }

    /// Uses a fixed-capacity mailbox; overflowing sends are refused (see
    /// [`FiberRef::try_send`]).
    pub fn bounded_mailbox(self, capacity: usize) -> Self {
        self.with_mailbox(move || BoundedMailbox::new(capacity))
    }

    /// Multiplexes the fiber onto the worker pool. This is the default.
    pub fn microthread(mut self) -> Self {
        self.flavor = BuildFlavor::Microthread;
        self
    }

    /// Runs the fiber on a dedicated OS thread. Overrides pinning.
    pub fn osthread(mut self) -> Self {
        self.flavor = BuildFlavor::OsThread;
        self
    }

    /// Spawns a fiber running `task` and returns its reference.
    ///
    /// During shutdown the task is discarded and a dead-letter reference is
    /// returned.
    pub fn run<F>(self, task: F) -> FiberRef
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_inner(task, None::<Arc<Promise<()>>>)
    }

    /// Spawns a fiber whose return value resolves a result promise.
    ///
    /// During shutdown the task is discarded and the returned reference
    /// carries a promise pre-failed with [`FiberError::ShuttingDown`].
    pub fn run_future<A, F>(self, task: F) -> FutureRef<A>
    where
        A: Clone + Send + 'static,
        F: FnOnce() -> A + Send + 'static,
    {
        let promise = Arc::new(Promise::new());
        let fiber = self.run_inner(task, Some(promise.clone()));
        FutureRef::new(fiber, promise)
    }

    fn run_inner<A, F>(self, task: F, promise: Option<Arc<Promise<A>>>) -> FiberRef
    where
        A: Clone + Send + 'static,
        F: FnOnce() -> A + Send + 'static,
    {
        let shared = self.system.shared().clone();
        let path = match &self.name {
            Some(name) => Path::named(name),
            None => Path::unique(),
        };

        if shared.is_shutting_down() {
            debug!(fiber = %path, "spawn during shutdown; returning dead-letter reference");
            if let Some(promise) = &promise {
                promise.fail(FiberError::ShuttingDown);
            }
            return FiberRef::dead_letter(path);
        }

        // The spawning fiber, if any, is notified of termination through
        // the finished/crashed events of the child.
        let watcher = context::try_self_ref();

        match self.flavor {
            BuildFlavor::Microthread => {
                let block = ControlBlock::new_micro(path, (self.mailbox)(), self.pin, shared.clone());
                let fiber_ref = FiberRef::local(block.clone());
                let entry = make_entry(
                    task,
                    promise,
                    watcher,
                    fiber_ref.finished_event(),
                    fiber_ref.crashed_event(),
                );
                block.install_entry(entry);
                shared.fiber_started();
                let bound = block.bound_index();
                shared.schedule_spawn(block, bound);
                fiber_ref
            }
            BuildFlavor::OsThread => {
                let block = ControlBlock::new_thread(path, (self.mailbox)(), shared.clone());
                let fiber_ref = FiberRef::local(block.clone());
                let entry = make_entry(
                    task,
                    promise.clone(),
                    watcher,
                    fiber_ref.finished_event(),
                    fiber_ref.crashed_event(),
                );
                shared.fiber_started();
                let thread_block = block.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("filament-fiber-{}", block.path()))
                    .spawn(move || {
                        context::set_current(Some(thread_block.clone()));
                        entry();
                        thread_block.mark_dead();
                        context::set_current(None);
                        thread_block.system().fiber_finished();
                    });
                if spawned.is_err() {
                    debug!(fiber = %block.path(), "failed to spawn backing thread");
                    block.mark_dead();
                    shared.fiber_finished();
                    if let Some(promise) = &promise {
                        promise.fail(FiberError::Crashed);
                    }
                }
                fiber_ref
            }
        }
    }
}

/// Wraps the typed task into the erased entry run by the trampoline:
/// resolve the result promise, then notify the watcher.
fn make_entry<A, F>(
    task: F,
    promise: Option<Arc<Promise<A>>>,
    watcher: Option<FiberRef>,
    finished: Event<()>,
    crashed: Event<()>,
) -> Box<dyn FnOnce() + Send>
where
    A: Clone + Send + 'static,
    F: FnOnce() -> A + Send + 'static,
{
    Box::new(move || match panic::catch_unwind(AssertUnwindSafe(|| task())) {
        Ok(value) => {
            if let Some(promise) = &promise {
                promise.fulfill(value);
            }
            if let Some(watcher) = &watcher {
                watcher.send(&finished, ());
            }
        }
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "unknown panic payload"
            };
            debug!(panic = message, "fiber crashed");
            if let Some(promise) = &promise {
                promise.fail(FiberError::Crashed);
            }
            if let Some(watcher) = &watcher {
                watcher.send(&crashed, ());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::LockingMailbox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn modifiers_carry_configuration() {
        let system = FiberSystem::with_workers(1);

        let builder = system.fiber().named("cfg").osthread();
        assert_eq!(builder.name.as_deref(), Some("cfg"));
        assert_eq!(builder.flavor, BuildFlavor::OsThread);

        let builder = builder.unnamed().microthread();
        assert_eq!(builder.name, None);
        assert_eq!(builder.flavor, BuildFlavor::Microthread);

        system.shutdown();
    }

    #[test]
    fn pinning_records_the_target_scheduler() {
        let system = FiberSystem::with_workers(2);
        let target = system.scheduler_ids()[1];

        let builder = system.fiber().pinned_to(target);
        assert_eq!(builder.pin, Some(1));

        let builder = builder.detached();
        assert_eq!(builder.pin, None);

        // Off a worker thread there is no current scheduler to pin to.
        let builder = builder.pinned();
        assert_eq!(builder.pin, None);

        system.shutdown();
    }

    #[test]
    fn pinned_fibers_run_on_their_bound_scheduler() {
        let system = FiberSystem::with_workers(2);
        let target = system.scheduler_ids()[0];

        let observed = system
            .fiber()
            .pinned_to(target)
            .run_future(|| crate::context::current_scheduler());
        assert_eq!(observed.result().wait(), Ok(Some(0)));

        system.shutdown();
    }

    #[test]
    fn custom_mailbox_factory_is_used_per_spawn() {
        let system = FiberSystem::with_workers(1);
        let built = Arc::new(AtomicUsize::new(0));

        let counter = built.clone();
        let template = system.fiber().with_mailbox(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            LockingMailbox::new()
        });

        template.clone().run(|| {});
        assert_eq!(built.load(Ordering::SeqCst), 1);
        template.run(|| {});
        assert_eq!(built.load(Ordering::SeqCst), 2);

        system.shutdown();
    }

    #[test]
    fn osthread_flavor_produces_a_result() {
        let system = FiberSystem::with_workers(1);

        let future = system.fiber().named("dedicated").osthread().run_future(|| 5u32);
        assert_eq!(future.result().wait(), Ok(5));

        system.shutdown();
    }
}
