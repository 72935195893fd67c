// Integration tests for signal ingestion
// Run with: cargo test --test signal_test
//
// Each test uses a different signal number: handlers are process-global
// and the test harness runs tests concurrently.

use std::rc::Rc;

use strand::Hub;

fn hub() -> Hub {
    let _ = env_logger::builder().is_test(true).try_init();
    Hub::new().expect("hub construction")
}

fn raise(sig: i32) {
    // SAFETY: raising a signal we have a handler installed for.
    unsafe {
        libc::raise(sig);
    }
}

/// A raised signal arrives as its number on the subscribed channel.
#[test]
fn subscribe_delivers_signal_number() {
    let h = hub();
    let ch = h.subscribe_signals(&[libc::SIGUSR1]).expect("subscribe");
    let h2 = h.clone();
    let reader = ch.clone();
    let got = h
        .run_until(async move {
            // The reader task parks on the self-pipe first.
            h2.sleep(5).await.expect("sleep");
            raise(libc::SIGUSR1);
            reader.recv().await
        })
        .expect("primary task completed")
        .expect("recv");
    assert_eq!(got, libc::SIGUSR1);
    h.unsubscribe_signals(&ch);
}

/// Every subscriber to a signal gets its own delivery.
#[test]
fn multiple_subscribers_each_get_a_delivery() {
    let h = hub();
    let a = h.subscribe_signals(&[libc::SIGUSR2]).expect("subscribe a");
    let b = h.subscribe_signals(&[libc::SIGUSR2]).expect("subscribe b");
    let h2 = h.clone();
    let (ra, rb) = (a.clone(), b.clone());
    let got = h
        .run_until(async move {
            h2.sleep(5).await.expect("sleep");
            raise(libc::SIGUSR2);
            let first = ra.recv().await.expect("recv a");
            let second = rb.recv().await.expect("recv b");
            (first, second)
        })
        .expect("primary task completed");
    assert_eq!(got, (libc::SIGUSR2, libc::SIGUSR2));
    h.unsubscribe_signals(&a);
    h.unsubscribe_signals(&b);
}

/// Unsubscribing the last channel tears the routing down: the fd leaves
/// the multiplexer and the hub can wind down on its own.
#[test]
fn unsubscribe_tears_down_routing() {
    let h = hub();
    let ch = h.subscribe_signals(&[libc::SIGWINCH]).expect("subscribe");
    h.unsubscribe_signals(&ch);
    // With the self-pipe unregistered nothing is left to wait on: the
    // hub deadlocks and stops instead of blocking in the multiplexer.
    h.run();
    assert!(h.stopped().fired());
}

/// `stop_on_term` shuts the hub down when SIGTERM arrives.
#[test]
fn stop_on_term_stops_on_sigterm() {
    let h = hub();

    let h2 = h.clone();
    h.spawn(async move {
        let _ = h2.stop_on_term().await;
    });

    let h3 = h.clone();
    h.spawn(async move {
        // Give stop_on_term time to install its subscription.
        h3.sleep(5).await.expect("sleep");
        raise(libc::SIGTERM);
    });

    let done = Rc::new(std::cell::Cell::new(false));
    let out = Rc::clone(&done);
    let h4 = h.clone();
    h.spawn(async move {
        let _ = h4.stopped().wait().await;
        out.set(true);
    });

    h.run();
    assert!(h.stopped().fired());
    assert!(done.get());
}
