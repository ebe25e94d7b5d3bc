use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use filament::FiberSystem;

const FIBERS: usize = 10_000;

#[test]
fn all_fibers_finished_fires_after_mass_spawn() {
    let system = FiberSystem::new();
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..FIBERS {
        let completed = completed.clone();
        system.fiber().run(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    // The running count can cross zero while spawning is still in
    // progress; every crossing re-fires the event, so waiting again is
    // enough.
    let finished = system.all_fibers_finished();
    loop {
        finished.wait();
        if completed.load(Ordering::Relaxed) == FIBERS {
            break;
        }
    }

    assert_eq!(completed.load(Ordering::Relaxed), FIBERS);
    system.shutdown();
}

#[test]
fn pinned_fibers_run_and_finish() {
    let system = FiberSystem::with_workers(4);
    let completed = Arc::new(AtomicUsize::new(0));
    let scheduler = system.scheduler_ids()[0];

    for _ in 0..100 {
        let completed = completed.clone();
        system.fiber().pinned_to(scheduler).run(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    let finished = system.all_fibers_finished();
    loop {
        finished.wait();
        if completed.load(Ordering::Relaxed) == 100 {
            break;
        }
    }
    system.shutdown();
}

#[test]
fn osthread_fibers_complete_alongside_microthreads() {
    let system = FiberSystem::with_workers(2);
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
        let completed = completed.clone();
        let builder = if i % 2 == 0 {
            system.fiber().osthread()
        } else {
            system.fiber().microthread()
        };
        builder.run(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    let finished = system.all_fibers_finished();
    loop {
        finished.wait();
        if completed.load(Ordering::Relaxed) == 20 {
            break;
        }
    }
    system.shutdown();
}
