// Integration tests for the rendezvous pipe core
// Run with: cargo test --test pipe_test

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use strand::{Error, Hub, Pair};

fn hub() -> Hub {
    let _ = env_logger::builder().is_test(true).try_init();
    Hub::new().expect("hub construction")
}

/// Spawn a task that sends `1`, then recv it.
#[test]
fn pipe_basic_send_recv() {
    let h = hub();
    let p = h.pipe::<u32>();
    let sender = p.sender.clone();
    h.spawn(async move {
        sender.send(1).await.expect("send");
    });
    let got = h
        .run_until(async move { p.recv().await })
        .expect("primary task completed")
        .expect("recv");
    assert_eq!(got, 1);
}

/// Every recv returns exactly the item of the paired send: nothing is
/// duplicated or lost, and order holds.
#[test]
fn rendezvous_preserves_items_and_order() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    h.spawn(async move {
        for i in 0..5 {
            sender.send(i).await.expect("send");
        }
    });
    let got = h
        .run_until(async move {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(recver.recv().await.expect("recv"));
            }
            out
        })
        .expect("primary task completed");
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
}

/// `close` wakes a parked recver with `Closed` before anything else runs.
#[test]
fn close_wakes_parked_recver() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let observed: Rc<RefCell<Option<Result<u32, Error>>>> = Rc::new(RefCell::new(None));
    let out = Rc::clone(&observed);
    h.spawn(async move {
        *out.borrow_mut() = Some(recver.recv().await);
    });
    h.spawn(async move {
        sender.close();
    });
    h.run();
    let observed = observed.borrow_mut().take().expect("recv task resumed");
    assert!(matches!(observed, Err(Error::Closed)), "got {observed:?}");
}

/// A closed pipe refuses further sends.
#[test]
fn send_on_closed_pipe_fails() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    recver.close();
    let result = h
        .run_until(async move { sender.send(1).await })
        .expect("primary task completed");
    assert!(matches!(result, Err(Error::Closed)), "got {result:?}");
}

/// Dropping the sender while holding only the recver: recv reports
/// abandonment.
#[test]
fn abandoned_sender_is_observable() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    drop(sender);
    let result = h
        .run_until(async move { recver.recv().await })
        .expect("primary task completed");
    assert!(matches!(result, Err(Error::Abandoned)), "got {result:?}");
}

/// Dropping the sender while a task is parked in recv delivers exactly
/// one `Abandoned` into it.
#[test]
fn abandonment_wakes_parked_recver() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let observed: Rc<RefCell<Vec<Result<u32, Error>>>> = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&observed);
    h.spawn(async move {
        out.borrow_mut().push(recver.recv().await);
    });
    h.spawn(async move {
        drop(sender);
    });
    h.run();
    let observed = observed.borrow();
    assert_eq!(observed.len(), 1, "exactly one delivery expected");
    assert!(matches!(observed[0], Err(Error::Abandoned)), "got {observed:?}");
}

/// A send with no reader times out; the item is gone with it.
#[test]
fn send_timeout_elapses() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let started = Instant::now();
    let result = h
        .run_until(async move { sender.send_timeout(1, 20).await })
        .expect("primary task completed");
    assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
    assert!(started.elapsed() >= Duration::from_millis(20));
    drop(recver);
}

/// A recv with no writer times out.
#[test]
fn recv_timeout_elapses() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let result = h
        .run_until(async move { recver.recv_timeout(20).await })
        .expect("primary task completed");
    assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
    drop(sender);
}

/// Errors sent as items are raised on the receive side.
#[test]
fn error_items_are_raised_on_recv() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    h.spawn(async move {
        sender.throw("upstream exploded").await.expect("throw");
    });
    let result = h
        .run_until(async move { recver.recv().await })
        .expect("primary task completed");
    match result {
        Err(Error::Trace { message, .. }) => assert_eq!(message, "upstream exploded"),
        other => panic!("expected preserved trace, got {other:?}"),
    }
}

/// Stream iteration yields until the sender goes away, then ends.
#[test]
fn stream_iteration_ends_on_halt() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    h.spawn(async move {
        for i in 1..=3 {
            sender.send(i).await.expect("send");
        }
        // Task exit drops the sender; iteration sees abandonment as a
        // clean end.
    });
    let got = h
        .run_until(async move {
            let mut recver = recver;
            let mut out = Vec::new();
            while let Some(item) = recver.next().await {
                out.push(item.expect("stream item"));
            }
            out
        })
        .expect("primary task completed");
    assert_eq!(got, vec![1, 2, 3]);
}

/// The sender resumes only after the recver has taken the item, and the
/// recver runs first at the handoff.
#[test]
fn handoff_lets_recver_run_first() {
    let h = hub();
    let Pair { sender, recver } = h.pipe::<u32>();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let recv_log = Rc::clone(&order);
    h.spawn(async move {
        recver.recv().await.expect("recv");
        recv_log.borrow_mut().push("recver");
    });

    let send_log = Rc::clone(&order);
    h.spawn(async move {
        sender.send(9).await.expect("send");
        send_log.borrow_mut().push("sender");
    });

    h.run();
    assert_eq!(*order.borrow(), vec!["recver", "sender"]);
}
