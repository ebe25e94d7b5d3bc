//! The top-level coordinator: worker pool, global liveness, shutdown.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam::deque::Worker as Deque;
use parking_lot::Mutex;
use rand::Rng;
use tracing::info;

use crate::builder::Builder;
use crate::context;
use crate::event::Event;
use crate::fiber::ControlBlock;
use crate::fiber_ref::FiberRef;
use crate::mailbox::LockfreeMailbox;
use crate::path::Path;
use crate::scheduler::{run_worker, Scheduler, SchedulerId, WorkerParams};

/// State shared by every handle to one system, its workers, and every
/// control block it spawned.
pub(crate) struct SystemShared {
    schedulers: Vec<Scheduler>,
    running: AtomicU64,
    shutting_down: AtomicBool,
    all_finished_path: Path,
    main_ref: OnceLock<FiberRef>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SystemShared {
    pub(crate) fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Places a runnable block on a scheduler queue: the bound one if the
    /// fiber is pinned, else the current one when called from a worker,
    /// else a uniformly random one.
    pub(crate) fn schedule(&self, block: Arc<ControlBlock>, bound: Option<usize>) {
        let index = bound
            .or_else(context::current_scheduler)
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..self.schedulers.len()));
        self.schedulers[index].submit(block);
    }

    /// Initial placement of a freshly spawned block: its bound scheduler if
    /// pinned, else a uniformly random one, which keeps mass spawns spread
    /// across the pool.
    pub(crate) fn schedule_spawn(&self, block: Arc<ControlBlock>, bound: Option<usize>) {
        let index =
            bound.unwrap_or_else(|| rand::thread_rng().gen_range(0..self.schedulers.len()));
        self.schedulers[index].submit(block);
    }

    pub(crate) fn fiber_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the running count; the zero crossing emits the
    /// all-fibers-finished event to the main fiber.
    pub(crate) fn fiber_finished(&self) {
        if self.running.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            if let Some(main) = self.main_ref.get() {
                main.send(&Event::<()>::from_path(self.all_finished_path.clone()), ());
            }
        }
    }
}

/// The runtime: a pool of worker threads multiplexing fibers, plus the
/// global bookkeeping to create, route and retire them.
///
/// Handles are cheap to clone and all refer to the same pool. Creating a
/// system fiberizes the calling thread, which becomes the main fiber.
#[derive(Clone)]
pub struct FiberSystem {
    shared: Arc<SystemShared>,
}

impl FiberSystem {
    /// Starts a system with one worker per available core.
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        FiberSystem::with_workers(workers)
    }

    /// Starts a system with the given number of workers.
    pub fn with_workers(workers: usize) -> Self {
        FiberSystem::start(workers, false)
    }

    /// Starts a system with workers pinned to CPU cores, for cache
    /// locality.
    pub fn with_affinity(workers: usize) -> Self {
        FiberSystem::start(workers, true)
    }

    fn start(workers: usize, pin: bool) -> Self {
        let workers = workers.max(1);

        let mut locals = Vec::with_capacity(workers);
        let mut stealers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let deque = Deque::new_lifo();
            stealers.push(deque.stealer());
            locals.push(deque);
        }

        let schedulers = stealers
            .into_iter()
            .enumerate()
            .map(|(index, stealer)| Scheduler::new(index, stealer))
            .collect();

        let shared = Arc::new(SystemShared {
            schedulers,
            running: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            all_finished_path: Path::unique(),
            main_ref: OnceLock::new(),
            workers: Mutex::new(Vec::new()),
        });

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        // Worker PRNGs are seeded from the thread-local entropy-backed
        // generator.
        let mut seeder = rand::thread_rng();
        let mut handles = Vec::with_capacity(workers);
        for (index, local) in locals.into_iter().enumerate() {
            let params = WorkerParams {
                index,
                shared: shared.clone(),
                local,
                seed: seeder.gen(),
                core_id: core_ids.get(index % core_ids.len().max(1)).copied(),
            };
            let handle = thread::Builder::new()
                .name(format!("filament-worker-{index}"))
                .spawn(move || run_worker(params))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        *shared.workers.lock() = handles;
        info!(workers, "fiber system started");

        let system = FiberSystem { shared };
        let main = system.fiberize();
        let _ = system.shared.main_ref.set(main);
        system
    }

    pub(crate) fn from_shared(shared: Arc<SystemShared>) -> Self {
        FiberSystem { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SystemShared> {
        &self.shared
    }

    /// Starts configuring a fiber to be spawned on this system.
    pub fn fiber(&self) -> Builder {
        Builder::new(self.clone())
    }

    /// Reference to the fiberized thread that created the system.
    pub fn main_fiber(&self) -> FiberRef {
        self.shared
            .main_ref
            .get()
            .cloned()
            .expect("system not fully initialized")
    }

    /// Fires when the running-fiber count reaches zero.
    pub fn all_fibers_finished(&self) -> Event<()> {
        Event::from_path(self.shared.all_finished_path.clone())
    }

    /// Attaches a non-executing control block to the calling thread so it
    /// can send, wait and process events with the same primitives as a
    /// fiber. Idempotent for a thread already fiberized into this system.
    pub fn fiberize(&self) -> FiberRef {
        if let Some(block) = context::try_current() {
            if Arc::ptr_eq(block.system(), &self.shared) {
                return FiberRef::local(block);
            }
        }
        let block = ControlBlock::new_thread(
            Path::unique(),
            Box::new(LockfreeMailbox::new()),
            self.shared.clone(),
        );
        context::set_current(Some(block.clone()));
        FiberRef::local(block)
    }

    /// The schedulers of this system, for [`Builder::pinned_to`].
    pub fn scheduler_ids(&self) -> Vec<SchedulerId> {
        (0..self.shared.schedulers.len()).map(SchedulerId).collect()
    }

    /// Initiates shutdown: new spawns return dead-letter references and
    /// workers drain their queues and exit. Joins the workers unless called
    /// from one of them.
    pub fn shutdown(&self) {
        if !self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            info!("fiber system shutting down");
        }
        for scheduler in self.shared.schedulers() {
            scheduler.wake_all();
        }
        if context::current_scheduler().is_none() {
            let handles = std::mem::take(&mut *self.shared.workers.lock());
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl Default for FiberSystem {
    fn default() -> Self {
        FiberSystem::new()
    }
}
