//! Per-worker schedulers and the work-stealing run loop.
//!
//! Each worker owns a LIFO deque of runnable control blocks and an injector
//! inbox that other threads push wakes into. Idle workers steal from the
//! FIFO end of a uniformly random peer's deque; blocks pinned to another
//! scheduler are forwarded instead of run.

use std::sync::Arc;
use std::time::Duration;

use core_affinity::CoreId;
use crossbeam::deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::context;
use crate::fiber::{ControlBlock, RunOutcome};
use crate::system::SystemShared;

const STEAL_RETRIES: usize = 3;
const PARK_INTERVAL: Duration = Duration::from_millis(10);

/// Identifies one scheduler of a system, for pinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerId(pub(crate) usize);

/// The shared face of one worker: its inbox, the stealable end of its
/// deque, and its parking state.
pub(crate) struct Scheduler {
    index: usize,
    injector: Injector<Arc<ControlBlock>>,
    stealer: Stealer<Arc<ControlBlock>>,
    parked: Mutex<bool>,
    wakeup: Condvar,
}

impl Scheduler {
    pub(crate) fn new(index: usize, stealer: Stealer<Arc<ControlBlock>>) -> Self {
        Scheduler {
            index,
            injector: Injector::new(),
            stealer,
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Queues a runnable block on this scheduler and wakes its worker.
    pub(crate) fn submit(&self, block: Arc<ControlBlock>) {
        trace!(fiber = %block.path(), scheduler = self.index, "scheduled");
        self.injector.push(block);
        // Taking the park lock orders this push against the worker's
        // pre-park re-check, closing the missed-wakeup window.
        let _parked = self.parked.lock();
        self.wakeup.notify_one();
    }

    pub(crate) fn wake_all(&self) {
        let _parked = self.parked.lock();
        self.wakeup.notify_all();
    }
}

/// Parameters handed to a worker thread at startup.
pub(crate) struct WorkerParams {
    pub(crate) index: usize,
    pub(crate) shared: Arc<SystemShared>,
    pub(crate) local: Deque<Arc<ControlBlock>>,
    pub(crate) seed: u64,
    pub(crate) core_id: Option<CoreId>,
}

/// Main loop of one worker thread.
pub(crate) fn run_worker(params: WorkerParams) {
    let WorkerParams {
        index,
        shared,
        local,
        seed,
        core_id,
    } = params;

    if let Some(core_id) = core_id {
        core_affinity::set_for_current(core_id);
    }
    context::set_current_scheduler(Some(index));
    let mut rng = SmallRng::seed_from_u64(seed);

    loop {
        if shared.is_shutting_down() {
            drain_on_shutdown(&shared, index, &local);
            break;
        }

        let block = local
            .pop()
            .or_else(|| pop_inbox(&shared, index, &local))
            .or_else(|| steal(&shared, index, &mut rng));

        match block {
            Some(block) => run_block(&shared, &local, block),
            None => park(&shared, index, &local),
        }
    }

    context::set_current_scheduler(None);
}

/// Moves a batch from this worker's injector inbox into the local deque and
/// pops one block.
fn pop_inbox(
    shared: &SystemShared,
    index: usize,
    local: &Deque<Arc<ControlBlock>>,
) -> Option<Arc<ControlBlock>> {
    let injector = &shared.schedulers()[index].injector;
    let mut retries = 0;
    loop {
        match injector.steal_batch_and_pop(local) {
            Steal::Success(block) => return Some(block),
            Steal::Empty => return None,
            Steal::Retry => {
                retries += 1;
                if retries >= STEAL_RETRIES {
                    return None;
                }
            }
        }
    }
}

/// Attempts to take work from a uniformly random peer, trying the FIFO end
/// of its deque first and its inbox second. Failures are silent; there is
/// no global coordination.
fn steal(
    shared: &SystemShared,
    index: usize,
    rng: &mut SmallRng,
) -> Option<Arc<ControlBlock>> {
    let schedulers = shared.schedulers();
    if schedulers.len() <= 1 {
        return None;
    }
    for _ in 0..STEAL_RETRIES {
        let victim = rng.gen_range(0..schedulers.len());
        if victim == index {
            continue;
        }
        let stolen = match schedulers[victim].stealer.steal() {
            Steal::Success(block) => Some(block),
            Steal::Retry | Steal::Empty => match schedulers[victim].injector.steal() {
                Steal::Success(block) => Some(block),
                Steal::Retry | Steal::Empty => None,
            },
        };
        if let Some(block) = stolen {
            if let Some(bound) = block.bound_index() {
                if bound != index {
                    // Pinned elsewhere: forward instead of running.
                    schedulers[bound].submit(block);
                    continue;
                }
            }
            trace!(victim, thief = index, "stole fiber");
            return Some(block);
        }
    }
    None
}

/// Runs one block through a full resume cycle.
fn run_block(shared: &Arc<SystemShared>, local: &Deque<Arc<ControlBlock>>, block: Arc<ControlBlock>) {
    block.set_running();
    let previous = context::set_current(Some(block.clone()));
    let outcome = block.resume();
    context::set_current(previous);

    match outcome {
        RunOutcome::Rescheduled => {
            block.set_scheduled();
            local.push(block);
        }
        RunOutcome::Suspended => {
            // SAFETY: the fiber switched back with the Suspend command and
            // left its status mutex locked for us; its stack is now fully
            // saved, so wakers may proceed.
            unsafe { block.release_suspend_handoff() };
            // The block stays alive through its mailbox and outstanding
            // references; this worker forgets it.
        }
        RunOutcome::Finished => {
            block.mark_dead();
            shared.fiber_finished();
        }
    }
}

/// Parks until new work is submitted. The wait is timed so the worker
/// periodically retries stealing from busy peers.
fn park(shared: &SystemShared, index: usize, local: &Deque<Arc<ControlBlock>>) {
    let scheduler = &shared.schedulers()[index];
    let mut parked = scheduler.parked.lock();
    if !scheduler.injector.is_empty() || !local.is_empty() || shared.is_shutting_down() {
        return;
    }
    *parked = true;
    let _ = scheduler.wakeup.wait_for(&mut parked, PARK_INTERVAL);
    *parked = false;
}

/// On shutdown, queued fibers never run; they die where they stand.
fn drain_on_shutdown(shared: &Arc<SystemShared>, index: usize, local: &Deque<Arc<ControlBlock>>) {
    while let Some(block) = local.pop() {
        block.mark_dead();
        shared.fiber_finished();
    }
    let injector = &shared.schedulers()[index].injector;
    loop {
        match injector.steal() {
            Steal::Success(block) => {
                block.mark_dead();
                shared.fiber_finished();
            }
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }
}
