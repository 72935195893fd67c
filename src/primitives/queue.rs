//! Queue: a bounded buffer between two pipes.
//!
//! ```text
//!              +----------+
//!     send --> |  Queue   |
//!              | (buffer) | --> recv
//!              +----------+
//! ```
//!
//! The exposed sender feeds an internal upstream pipe and the exposed
//! recver drains an internal downstream pipe; a middle task shuttles
//! items across, watching whichever ends are actionable. Sends only block
//! once the buffer is full.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::hub::Hub;
use crate::pipe::{Fired, Pair, Recver, Sender, Watch};

/// Build a queue of capacity *size*.
pub(crate) fn queue<T: 'static>(hub: &Hub, size: usize) -> Pair<T> {
    assert!(size > 0, "queue size must be at least 1");

    let up = hub.pipe::<T>();
    let down = hub.pipe::<T>();

    // Chain link: connects through this queue resolve to the buffered
    // downstream recver.
    *up.recver.inner.downstream.borrow_mut() = Some(Rc::clone(&down.sender.inner));

    let task_hub = hub.clone();
    let upstream = up.recver;
    let downstream = down.sender;
    hub.spawn(async move {
        run(task_hub, upstream, downstream, size).await;
    });

    Pair {
        sender: up.sender,
        recver: down.recver,
    }
}

/// The middle task: buffer between upstream and downstream.
async fn run<T: 'static>(hub: Hub, upstream: Recver<T>, downstream: Sender<T>, size: usize) {
    let mut buffer: VecDeque<T> = VecDeque::new();

    loop {
        // Nobody downstream: shut the intake and wind down.
        if downstream.halted() {
            upstream.close();
            return;
        }

        let mut watch: Vec<Watch<'_, T>> = Vec::with_capacity(2);
        if !buffer.is_empty() {
            watch.push(Watch::Send(&downstream));
        } else if upstream.halted() {
            // Empty buffer and nobody upstream: flush is done.
            downstream.close();
            return;
        }
        if !upstream.halted() && buffer.len() < size {
            watch.push(Watch::Recv(&upstream));
        }

        match hub.select(&watch).await {
            Ok(Fired::Recv(_, item)) => buffer.push_back(item),
            Ok(Fired::Send(_)) => {
                let Some(item) = buffer.pop_front() else { continue };
                if let Err(err) = downstream.send(item).await {
                    if !err.is_halt() {
                        log::error!("queue forward failed: {err}");
                        return;
                    }
                }
            }
            // A halted end mid-wait: loop and re-evaluate which ends
            // remain actionable.
            Err(err) if err.is_halt() => continue,
            Err(err) => {
                log::error!("queue wait failed: {err}");
                return;
            }
        }
    }
}
