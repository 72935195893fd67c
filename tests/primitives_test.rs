// Integration tests for queues, dealers, routers, broadcasts, events,
// gates and values
// Run with: cargo test --test primitives_test

use std::cell::RefCell;
use std::rc::Rc;

use strand::{Error, Hub, Pair};

fn hub() -> Hub {
    let _ = env_logger::builder().is_test(true).try_init();
    Hub::new().expect("hub construction")
}

/// Queue of size 1: the first send completes unread, the second blocks
/// until a reader drains the buffer.
#[test]
fn queue_blocks_past_capacity() {
    let h = hub();
    let Pair { sender, recver } = h.queue::<u32>(1);
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let send_log = Rc::clone(&log);
    h.spawn(async move {
        sender.send(1).await.expect("send a");
        send_log.borrow_mut().push("sent-a");
        sender.send(2).await.expect("send b");
        send_log.borrow_mut().push("sent-b");
    });

    let h2 = h.clone();
    let read_log = Rc::clone(&log);
    let got = h
        .run_until(async move {
            // Give the sender room to run: only the first send completes.
            h2.sleep(10).await.expect("sleep");
            assert_eq!(*read_log.borrow(), vec!["sent-a"], "second send must block");

            let a = recver.recv().await.expect("recv a");
            // Draining one slot unblocks the parked sender.
            h2.sleep(10).await.expect("sleep");
            assert_eq!(*read_log.borrow(), vec!["sent-a", "sent-b"]);

            let b = recver.recv().await.expect("recv b");
            (a, b)
        })
        .expect("primary task completed");
    assert_eq!(got, (1, 2));
}

/// A queue buffers up to its capacity and never more.
#[test]
fn queue_capacity_bounds_unread_sends() {
    let h = hub();
    let Pair { sender, recver } = h.queue::<u32>(2);
    let completed: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let send_log = Rc::clone(&completed);
    h.spawn(async move {
        for i in 0..5 {
            sender.send(i).await.expect("send");
            send_log.borrow_mut().push(i);
        }
    });

    let h2 = h.clone();
    let observer = Rc::clone(&completed);
    let got = h
        .run_until(async move {
            h2.sleep(10).await.expect("sleep");
            // Only the two buffered sends completed; the rest are blocked.
            assert_eq!(*observer.borrow(), vec![0, 1]);
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(recver.recv().await.expect("recv"));
            }
            out
        })
        .expect("primary task completed");
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
}

/// Dealer: parked recvers are served in the order they parked.
#[test]
fn dealer_serves_recvers_in_select_order() {
    let h = hub();
    let Pair { sender, recver } = h.dealer::<u32>();
    let log: Rc<RefCell<Vec<(u32, u32)>>> = Rc::new(RefCell::new(Vec::new()));

    for worker in 0..3 {
        let r = recver.clone();
        let out = Rc::clone(&log);
        h.spawn(async move {
            let item = r.recv().await.expect("recv");
            out.borrow_mut().push((worker, item));
        });
    }

    let h2 = h.clone();
    h.spawn(async move {
        // Let every worker park first.
        h2.sleep(5).await.expect("sleep");
        for item in [10, 20, 30] {
            sender.send(item).await.expect("send");
        }
    });

    h.run();
    assert_eq!(*log.borrow(), vec![(0, 10), (1, 20), (2, 30)]);
}

/// Dropping a dealer's sender wakes every parked recver with `Abandoned`.
#[test]
fn dealer_abandonment_reaches_all_recvers() {
    let h = hub();
    let Pair { sender, recver } = h.dealer::<u32>();
    let log: Rc<RefCell<Vec<Result<u32, Error>>>> = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..3 {
        let r = recver.clone();
        let out = Rc::clone(&log);
        h.spawn(async move {
            let item = r.recv().await;
            out.borrow_mut().push(item);
        });
    }

    let h2 = h.clone();
    h.spawn(async move {
        h2.sleep(5).await.expect("sleep");
        drop(sender);
    });

    h.run();
    let log = log.borrow();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|r| matches!(r, Err(Error::Abandoned))), "got {log:?}");
}

/// Router: parked senders are drained first-come-first-served.
#[test]
fn router_accepts_sends_in_order() {
    let h = hub();
    let Pair { sender, recver } = h.router::<u32>();
    for item in [3, 2, 1] {
        let s = sender.clone();
        h.spawn(async move {
            s.send(item).await.expect("send");
        });
    }
    drop(sender);
    let got = h
        .run_until(async move {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(recver.recv().await.expect("recv"));
            }
            out
        })
        .expect("primary task completed");
    assert_eq!(got, vec![3, 2, 1]);
}

/// Broadcast: every ready subscriber gets the item, in subscription
/// order.
#[test]
fn broadcast_reaches_ready_subscribers() {
    let h = hub();
    let b = h.broadcast::<u32>();
    let log: Rc<RefCell<Vec<(u32, u32)>>> = Rc::new(RefCell::new(Vec::new()));

    for sub in 0..2 {
        let r = b.subscribe();
        let out = Rc::clone(&log);
        h.spawn(async move {
            let item = r.recv().await.expect("recv");
            out.borrow_mut().push((sub, item));
        });
    }

    let h2 = h.clone();
    h.spawn(async move {
        h2.sleep(5).await.expect("sleep");
        b.send(7).await;
    });

    h.run();
    assert_eq!(*log.borrow(), vec![(0, 7), (1, 7)]);
}

/// A subscriber that is not parked at send time misses the item.
#[test]
fn broadcast_is_best_effort() {
    let h = hub();
    let b = h.broadcast::<u32>();
    let lazy = b.subscribe();
    let b2 = b.clone();
    h.spawn(async move {
        b2.send(1).await;
    });
    let result = h
        .run_until(async move { lazy.recv_timeout(20).await })
        .expect("primary task completed");
    assert!(matches!(result, Err(Error::Timeout)), "missed item cannot arrive late: {result:?}");
}

/// Event: set wakes the waiting batch in insertion order; wait after set
/// returns immediately.
#[test]
fn event_wakes_waiters_in_order() {
    let h = hub();
    let e = h.event();
    let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    for i in 0..3 {
        let e2 = e.clone();
        let out = Rc::clone(&log);
        h.spawn(async move {
            e2.wait().await.expect("wait");
            out.borrow_mut().push(i);
        });
    }

    let h2 = h.clone();
    let e3 = e.clone();
    h.spawn(async move {
        h2.sleep(5).await.expect("sleep");
        e3.set();
    });

    h.run();
    assert_eq!(*log.borrow(), vec![0, 1, 2]);
    assert!(e.fired());
}

/// Event: clear isolates the already-waiting batch from a later set.
#[test]
fn event_clear_isolates_waiting_batch() {
    let h = hub();
    let e = h.event();
    let woke = Rc::new(RefCell::new(false));

    let e2 = e.clone();
    let out = Rc::clone(&woke);
    h.spawn(async move {
        let _ = e2.wait().await;
        *out.borrow_mut() = true;
    });

    let h2 = h.clone();
    let e3 = e.clone();
    h.spawn(async move {
        h2.sleep(5).await.expect("sleep");
        // Swap the batch out, then fire: the parked waiter must not wake.
        e3.clear().set();
    });

    h.run();
    assert!(!*woke.borrow(), "isolated batch must not observe the set");
}

/// Gate: sticky state means trigger-then-wait never blocks.
#[test]
fn gate_state_is_sticky() {
    let h = hub();
    let g = h.gate();
    let got = h
        .run_until(async move {
            g.trigger().await.expect("trigger");
            g.wait().await.expect("wait");
            g.clear();
            assert!(!g.triggered());
            // After clear the gate blocks again.
            g.wait_timeout(10).await
        })
        .expect("primary task completed");
    assert!(matches!(got, Err(Error::Timeout)), "got {got:?}");
}

/// Gate: a parked waiter is woken by trigger.
#[test]
fn gate_trigger_wakes_parked_waiter() {
    let h = hub();
    let g = h.gate();
    let woke = Rc::new(RefCell::new(false));

    let g2 = g.clone();
    let out = Rc::clone(&woke);
    h.spawn(async move {
        g2.wait().await.expect("wait");
        *out.borrow_mut() = true;
    });

    let h2 = h.clone();
    h.spawn(async move {
        h2.sleep(5).await.expect("sleep");
        g.trigger().await.expect("trigger");
    });

    h.run();
    assert!(*woke.borrow());
}

/// Value: waiters park until the first send, later recvs are immediate,
/// clear resets.
#[test]
fn value_latches_and_clears() {
    let h = hub();
    let v = h.value::<u32>();
    let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..2 {
        let v2 = v.clone();
        let out = Rc::clone(&log);
        h.spawn(async move {
            let item = v2.recv().await.expect("recv");
            out.borrow_mut().push(item);
        });
    }

    let h2 = h.clone();
    let v3 = v.clone();
    h.spawn(async move {
        h2.sleep(5).await.expect("sleep");
        v3.send(11);
        assert!(v3.ready());
    });

    h.run();
    assert_eq!(*log.borrow(), vec![11, 11]);

    // Memoized: a fresh recv is immediate.
    let v4 = v.clone();
    let got = h
        .run_until(async move { v4.recv().await })
        .expect("primary task completed")
        .expect("recv");
    assert_eq!(got, 11);

    v.clear();
    assert!(!v.ready());
}
