// Integration tests for pipe composition: pipe, map, consume, connect
// Run with: cargo test --test compose_test

use std::cell::RefCell;
use std::rc::Rc;

use strand::{Error, Hub, Pair};

fn hub() -> Hub {
    let _ = env_logger::builder().is_test(true).try_init();
    Hub::new().expect("hub construction")
}

/// `map` transforms items in flight.
#[test]
fn map_transforms_items() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let doubled = recver.map(|x| Ok(x * 2));
    h.spawn(async move {
        sender.send(3).await.expect("send");
    });
    let got = h
        .run_until(async move { doubled.recv().await })
        .expect("primary task completed")
        .expect("recv");
    assert_eq!(got, 6);
}

/// `Filter` from a transform drops the item silently.
#[test]
fn map_filter_drops_items() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let odds_doubled = recver.map(|x| {
        if x % 2 == 0 {
            Err(Error::Filter)
        } else {
            Ok(x * 2)
        }
    });
    h.spawn(async move {
        for i in 0..4 {
            sender.send(i).await.expect("send");
        }
    });
    let got = h
        .run_until(async move {
            let first = odds_doubled.recv().await.expect("recv");
            let second = odds_doubled.recv().await.expect("recv");
            (first, second)
        })
        .expect("primary task completed");
    assert_eq!(got, (2, 6));
}

/// A transform error that is not `Filter` arrives downstream as an item.
#[test]
fn map_forwards_transform_errors() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let strict = recver.map(|x| {
        if x == 0 {
            Err(Error::trace("zero is not allowed"))
        } else {
            Ok(x)
        }
    });
    h.spawn(async move {
        sender.send(0).await.expect("send");
    });
    let result = h
        .run_until(async move { strict.recv().await })
        .expect("primary task completed");
    match result {
        Err(Error::Trace { message, .. }) => assert_eq!(message, "zero is not allowed"),
        other => panic!("expected trace item, got {other:?}"),
    }
}

/// A hand-written pipeline can filter and transform arbitrarily.
#[test]
fn pipe_splices_a_transform_task() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let piped = recver.pipe(|upstream, downstream| async move {
        loop {
            match upstream.recv().await {
                Ok(i) if i % 2 == 1 => {
                    if downstream.send(i * 2).await.is_err() {
                        return;
                    }
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    });
    h.spawn(async move {
        for i in 0..10 {
            sender.send(i).await.expect("send");
        }
    });
    let got = h
        .run_until(async move {
            let a = piped.recv().await.expect("recv");
            let b = piped.recv().await.expect("recv");
            (a, b)
        })
        .expect("primary task completed");
    assert_eq!(got, (2, 6));
}

/// Connect linearization: a send on the original sender reaches the
/// connected pair's recver, transformed on the way.
#[test]
fn connect_fuses_chains() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let mapped = recver.map(|x| Ok(x * 2));
    let pair2 = h.pipe::<u32>();
    let tail = pair2.connect(mapped);
    h.spawn(async move {
        sender.send(5).await.expect("send");
    });
    let got = h
        .run_until(async move { tail.recv().await })
        .expect("primary task completed")
        .expect("recv");
    assert_eq!(got, 10);
}

/// Connect while the downstream recver is already parked: its parked
/// state carries over to the fused pipe.
#[test]
fn connect_carries_parked_recver() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let pair2 = h.pipe::<u32>();
    let got: Rc<RefCell<Option<u32>>> = Rc::new(RefCell::new(None));

    let out = Rc::clone(&got);
    let downstream = pair2.recver.clone();
    h.spawn(async move {
        *out.borrow_mut() = Some(downstream.recv().await.expect("recv"));
    });

    let h2 = h.clone();
    h.spawn(async move {
        // Let the downstream recv park first, then fuse and send.
        h2.sleep(1).await.expect("sleep");
        let _tail = pair2.sender.connect(recver);
        sender.send(42).await.expect("send");
    });

    h.run();
    assert_eq!(got.borrow_mut().take(), Some(42));
}

/// Chaining through a queue resolves to the buffered downstream recver.
#[test]
fn connect_through_queue_lands_downstream() {
    let h = hub();
    let q = h.queue::<u32>(4);
    let Pair { sender, recver } = h.pipe::<u32>();
    let tail = q.connect(recver);
    h.spawn(async move {
        sender.send(9).await.expect("send");
    });
    let got = h
        .run_until(async move { tail.recv().await })
        .expect("primary task completed")
        .expect("recv");
    assert_eq!(got, 9);
}

/// `consume` sinks every item into its handler.
#[test]
fn consume_drains_the_pipe() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let seen: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    recver.consume(move |item| {
        sink.borrow_mut().push(item);
        Ok(())
    });
    h.spawn(async move {
        for i in 1..=3 {
            sender.send(i).await.expect("send");
        }
    });
    h.run();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}

/// A halt from the consume handler closes the pipe, stopping the sender.
#[test]
fn consume_halt_closes_upstream() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let seen: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    recver.consume(move |item| {
        sink.borrow_mut().push(item);
        if item >= 2 {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    });
    let send_results: Rc<RefCell<Vec<Result<(), Error>>>> = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&send_results);
    h.spawn(async move {
        for i in 1..=3 {
            out.borrow_mut().push(sender.send(i).await);
        }
    });
    h.run();
    assert_eq!(*seen.borrow(), vec![1, 2]);
    let results = send_results.borrow();
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(
        matches!(results[2], Err(ref e) if e.is_halt()),
        "third send must observe the closed pipe, got {results:?}"
    );
}
