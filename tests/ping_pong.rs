use filament::{Event, FiberRef, FiberSystem};

const ROUNDS: u32 = 100;

#[test]
fn two_fibers_exchange_events() {
    let system = FiberSystem::with_workers(4);

    let init = Event::<FiberRef>::new("init");
    let ping = Event::<u32>::new("ping");
    let pong = Event::<u32>::new("pong");

    let a = {
        let init = init.clone();
        let ping = ping.clone();
        let pong = pong.clone();
        system.fiber().named("a").run_future(move || {
            let peer = init.wait();
            let mut received = 0;
            for i in 0..ROUNDS {
                peer.send(&ping, i);
                received += pong.wait();
            }
            received
        })
    };

    let b = {
        let init = init.clone();
        let ping = ping.clone();
        let pong = pong.clone();
        system.fiber().named("b").run_future(move || {
            let peer = init.wait();
            let mut received = 0;
            for _ in 0..ROUNDS {
                let i = ping.wait();
                received += i;
                peer.send(&pong, i);
            }
            received
        })
    };

    a.send(&init, (*b).clone());
    b.send(&init, (*a).clone());

    let expected: u32 = (0..ROUNDS).sum();
    assert_eq!(a.result().wait(), Ok(expected));
    assert_eq!(b.result().wait(), Ok(expected));

    system.all_fibers_finished().wait();
    system.shutdown();
}

#[test]
fn per_sender_order_is_preserved() {
    let system = FiberSystem::with_workers(2);
    let value = Event::<u32>::new("value");

    let receiver = {
        let value = value.clone();
        system.fiber().run_future(move || {
            let mut seen = Vec::new();
            for _ in 0..1000 {
                seen.push(value.wait());
            }
            seen
        })
    };

    for i in 0..1000 {
        receiver.send(&value, i);
    }

    let seen = receiver.result().wait().unwrap();
    let expected: Vec<u32> = (0..1000).collect();
    assert_eq!(seen, expected);

    system.shutdown();
}
