//! Stresses the suspend/enqueue race: a sender fires exactly when the
//! receiver is about to park. Every trial must complete; a lost wakeup
//! shows up as a hang (and the harness timeout).

use filament::{Event, FiberRef, FiberSystem};

const TRIALS: u32 = 50_000;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn receiver_always_wakes_under_send_race() {
    init_logging();
    let system = FiberSystem::with_workers(4);

    let init = Event::<FiberRef>::new("init");
    let tick = Event::<u32>::new("tick");
    let ack = Event::<u32>::new("ack");

    let receiver = {
        let init = init.clone();
        let tick = tick.clone();
        let ack = ack.clone();
        system.fiber().named("receiver").run_future(move || {
            let peer = init.wait();
            for expected in 0..TRIALS {
                let got = tick.wait();
                assert_eq!(got, expected);
                peer.send(&ack, got);
            }
        })
    };

    let sender = {
        let init = init.clone();
        let tick = tick.clone();
        let ack = ack.clone();
        system.fiber().named("sender").run_future(move || {
            let peer = init.wait();
            for i in 0..TRIALS {
                // The ack keeps both sides in lock-step, so this send lands
                // right around the receiver's next suspension.
                peer.send(&tick, i);
                let _ = ack.wait();
            }
        })
    };

    receiver.send(&init, (*sender).clone());
    sender.send(&init, (*receiver).clone());

    assert_eq!(sender.result().wait(), Ok(()));
    assert_eq!(receiver.result().wait(), Ok(()));

    system.shutdown();
}

#[test]
fn wakeup_survives_sends_from_external_threads() {
    init_logging();
    let system = FiberSystem::with_workers(2);
    let tick = Event::<u32>::new("external-tick");

    let receiver = {
        let tick = tick.clone();
        system.fiber().run_future(move || {
            let mut sum = 0u64;
            for _ in 0..1000 {
                sum += u64::from(tick.wait());
            }
            sum
        })
    };

    let sender = {
        let receiver = (*receiver).clone();
        let tick = tick.clone();
        std::thread::spawn(move || {
            for i in 0..1000 {
                receiver.send(&tick, i);
            }
        })
    };

    sender.join().unwrap();
    let expected: u64 = (0..1000).sum();
    assert_eq!(receiver.result().wait(), Ok(expected));

    system.shutdown();
}
