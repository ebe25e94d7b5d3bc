use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use filament::{FiberSystem, Promise};

#[test]
fn one_fulfillment_resumes_all_awaiters() {
    let system = FiberSystem::with_workers(4);
    let promise: Arc<Promise<u64>> = Arc::new(Promise::new());
    let resumed = Arc::new(AtomicUsize::new(0));

    let mut consumers = Vec::new();
    for _ in 0..100 {
        let promise = promise.clone();
        let resumed = resumed.clone();
        consumers.push(system.fiber().run_future(move || {
            let value = promise.wait().unwrap();
            resumed.fetch_add(1, Ordering::Relaxed);
            value
        }));
    }

    {
        let promise = promise.clone();
        system.fiber().run(move || {
            promise.fulfill(0xfeed);
        });
    }

    for consumer in &consumers {
        assert_eq!(consumer.result().wait(), Ok(0xfeed));
    }
    assert_eq!(resumed.load(Ordering::Relaxed), 100);

    system.shutdown();
}

#[test]
fn late_awaiters_see_the_resolved_value() {
    let system = FiberSystem::with_workers(2);
    let promise: Arc<Promise<&'static str>> = Arc::new(Promise::new());

    promise.fulfill("ready");

    let consumer = {
        let promise = promise.clone();
        system.fiber().run_future(move || promise.wait().unwrap())
    };
    assert_eq!(consumer.result().wait(), Ok("ready"));

    system.shutdown();
}

#[test]
fn promise_wait_from_fiberized_main() {
    let system = FiberSystem::with_workers(2);
    let promise: Arc<Promise<u32>> = Arc::new(Promise::new());

    {
        let promise = promise.clone();
        system.fiber().run(move || promise.fulfill(9));
    }

    // The fiberized main thread awaits through its mailbox like any fiber.
    assert_eq!(promise.wait(), Ok(9));
    system.shutdown();
}
