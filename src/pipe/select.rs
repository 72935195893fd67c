//! Multi-end readiness selection.
//!
//! `hub.select(watch)` parks the current task on every watched end at once
//! and resumes when the first becomes ready. Watching a recver consumes
//! the arriving item; watching a sender reports readiness (a recv parked
//! on the far side) without sending — the caller follows up with the
//! actual send, which completes immediately.
//!
//! This is the queue's engine: watch upstream for items while the buffer
//! has room, watch downstream for readiness while the buffer has stock.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Error;
use crate::hub::state::Slot;
use crate::hub::Hub;

use super::{Recver, RecvWaiter, Sender, SendWaiter};

/// One watched end.
#[derive(Debug)]
pub enum Watch<'a, T: 'static> {
    /// Fire when an item can be received from this end.
    Recv(&'a Recver<T>),
    /// Fire when a send on this end would complete immediately.
    Send(&'a Sender<T>),
}

/// Which end fired, by position in the watch list.
#[derive(Debug)]
pub enum Fired<T> {
    /// The watched recver produced an item.
    Recv(usize, T),
    /// The watched sender is ready; a send will complete immediately.
    Send(usize),
}

enum CaseWait<T> {
    Recv(Slot<T>),
    Send(Slot<()>),
}

impl Hub {
    /// Wait until any watched end is ready.
    ///
    /// # Errors
    ///
    /// Halt-class errors surface as soon as any watched end closes or is
    /// abandoned; error items arriving on a watched recver are raised
    /// here.
    pub async fn select<T: 'static>(&self, watch: &[Watch<'_, T>]) -> Result<Fired<T>, Error> {
        SelectFut {
            hub: self.clone(),
            watch,
            parked: None,
        }
        .await
    }
}

struct SelectFut<'a, 'b, T: 'static> {
    hub: Hub,
    watch: &'a [Watch<'b, T>],
    parked: Option<Vec<CaseWait<T>>>,
}

impl<T: 'static> SelectFut<'_, '_, T> {
    /// Remove every watcher this select parked on the watched ends.
    fn unpark_all(&mut self) {
        let Some(waits) = self.parked.take() else {
            return;
        };
        for (case, wait) in self.watch.iter().zip(waits.iter()) {
            match (case, wait) {
                (Watch::Recv(r), CaseWait::Recv(slot)) => {
                    let m = r.inner.middle();
                    m.recv_half
                        .borrow_mut()
                        .waiters
                        .retain(|w| !w.slot.same(slot));
                }
                (Watch::Send(s), CaseWait::Send(slot)) => {
                    let m = s.inner.middle();
                    m.send_half
                        .borrow_mut()
                        .waiters
                        .retain(|w| !w.slot.same(slot));
                }
                _ => {}
            }
        }
    }
}

impl<T: 'static> SelectFut<'_, '_, T> {
    /// Check every case for immediate readiness, consuming for recvs.
    fn poll_immediate(&mut self) -> Option<Poll<Result<Fired<T>, Error>>> {
        for (i, case) in self.watch.iter().enumerate() {
            match case {
                Watch::Recv(r) => {
                    let m = r.inner.middle();
                    if m.closed.get() {
                        return Some(Poll::Ready(Err(Error::Closed)));
                    }
                    // Consume a parked sender's item, skipping stale
                    // waiters. Head-of-queue select watchers stay put:
                    // two selects never complete each other.
                    loop {
                        let waiter = {
                            let mut half = m.send_half.borrow_mut();
                            match half.waiters.front() {
                                Some(w) if w.item.is_some() => half.waiters.pop_front(),
                                _ => None,
                            }
                        };
                        let Some(mut w) = waiter else { break };
                        let Some(item) = w.item.take() else { continue };
                        if w.slot.deliver(Ok(())).is_none() {
                            m.hub.schedule(w.task);
                            return Some(Poll::Ready(match item {
                                Ok(value) => Ok(Fired::Recv(i, value)),
                                Err(err) => {
                                    err.log_trace();
                                    Err(err)
                                }
                            }));
                        }
                    }
                    if m.sender_end.borrow().upgrade().is_none() {
                        return Some(Poll::Ready(Err(Error::Abandoned)));
                    }
                }
                Watch::Send(s) => {
                    let m = s.inner.middle();
                    if m.closed.get() {
                        return Some(Poll::Ready(Err(Error::Closed)));
                    }
                    if m.recver_end.borrow().upgrade().is_none() {
                        return Some(Poll::Ready(Err(Error::Abandoned)));
                    }
                    if !m.recv_half.borrow().waiters.is_empty() {
                        return Some(Poll::Ready(Ok(Fired::Send(i))));
                    }
                }
            }
        }
        None
    }
}

impl<T: 'static> Future for SelectFut<'_, '_, T> {
    type Output = Result<Fired<T>, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waits) = &this.parked {
            // Scan for a delivered case in watch order.
            let mut resolved = None;
            for (i, wait) in waits.iter().enumerate() {
                match wait {
                    CaseWait::Recv(slot) => {
                        if let Some(resume) = slot.take() {
                            resolved = Some(match resume {
                                Ok(value) => Ok(Fired::Recv(i, value)),
                                Err(err) => Err(err),
                            });
                            break;
                        }
                    }
                    CaseWait::Send(slot) => {
                        if let Some(resume) = slot.take() {
                            resolved = Some(match resume {
                                Ok(()) => Ok(Fired::Send(i)),
                                Err(err) => Err(err),
                            });
                            break;
                        }
                    }
                }
            }
            let Some(resolved) = resolved else {
                return Poll::Pending;
            };
            this.unpark_all();
            let resolved = match resolved {
                Ok(fired) => this.hub.stop_override(Ok(fired)),
                Err(err) => {
                    err.log_trace();
                    Err(err)
                }
            };
            return Poll::Ready(resolved);
        }

        if let Some(ready) = this.poll_immediate() {
            return ready;
        }

        // Nothing ready: park a watcher on every case.
        let current = this.hub.current_task();
        let mut waits = Vec::with_capacity(this.watch.len());
        for case in this.watch {
            match case {
                Watch::Recv(r) => {
                    let m = r.inner.middle();
                    let slot: Slot<T> = Slot::new();
                    let mut half = m.recv_half.borrow_mut();
                    assert!(
                        half.multi || half.waiters.is_empty(),
                        "pipe already has a parked recver"
                    );
                    half.waiters.push_back(RecvWaiter {
                        task: current,
                        slot: slot.clone(),
                    });
                    waits.push(CaseWait::Recv(slot));
                }
                Watch::Send(s) => {
                    let m = s.inner.middle();
                    let slot: Slot<()> = Slot::new();
                    let mut half = m.send_half.borrow_mut();
                    assert!(
                        half.multi || half.waiters.is_empty(),
                        "pipe already has a parked sender"
                    );
                    half.waiters.push_back(SendWaiter {
                        task: current,
                        item: None,
                        slot: slot.clone(),
                    });
                    waits.push(CaseWait::Send(slot));
                }
            }
        }
        this.parked = Some(waits);
        Poll::Pending
    }
}

impl<T: 'static> Drop for SelectFut<'_, '_, T> {
    fn drop(&mut self) {
        self.unpark_all();
    }
}
