//! Hub event loop implementation.
//!
//! One loop round: drain the ready queue (polling each task to its next
//! suspension point), fire overdue timers, then block — in a plain sleep
//! when only timers remain, in `epoll_wait` when fds are registered. A
//! hub with nothing scheduled and nothing registered has deadlocked: the
//! loop sets `stopped` and returns, which is termination rather than an
//! error.
//!
//! The loop never holds the state borrow across a task poll or a timer
//! ring: tasks re-enter the hub freely (spawning, parking, closing pipes)
//! while they run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::error::Error;
use crate::timer::TimerKind;

use super::state::TaskId;
use super::Hub;

/// Resets the running flag even when the loop unwinds.
struct RunGuard<'a>(&'a std::cell::Cell<bool>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Hub {
    /// Drive the loop until the hub stops.
    ///
    /// Returns after [`Hub::stop`] completes or after deadlock detection —
    /// nothing left scheduled or registered — sets `stopped`.
    ///
    /// # Panics
    ///
    /// Panics when called re-entrantly from within a hub task.
    pub fn run(&self) {
        self.run_loop(|| true);
    }

    /// Spawn *fut* as the primary task and drive the loop until it
    /// completes, returning its output.
    ///
    /// The hub keeps servicing every other task meanwhile and remains
    /// usable afterwards.
    ///
    /// # Errors
    ///
    /// `Closed` when the hub stops before the primary task finishes.
    pub fn run_until<T, F>(&self, fut: F) -> Result<T, Error>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let out: Rc<std::cell::RefCell<Option<T>>> = Rc::new(std::cell::RefCell::new(None));
        let slot = Rc::clone(&out);
        self.spawn(async move {
            *slot.borrow_mut() = Some(fut.await);
        });
        self.run_loop(|| out.borrow().is_none());
        let value = out.borrow_mut().take();
        value.ok_or(Error::Closed)
    }

    /// The scheduler: run while `keep_going` holds.
    fn run_loop(&self, mut keep_going: impl FnMut() -> bool) {
        assert!(
            !self.inner.running.replace(true),
            "hub loop is already running (nested run)"
        );
        let _guard = RunGuard(&self.inner.running);

        loop {
            self.drain_ready();

            if !keep_going() {
                return;
            }

            let now = Instant::now();
            let (next_due, idle) = {
                let mut state = self.inner.state.borrow_mut();
                (state.scheduled.next_due(), state.registered.is_empty())
            };

            if let Some(due) = next_due {
                // Run overdue timers immediately.
                if due <= now {
                    self.fire_next_timer();
                    continue;
                }
                // Nothing registered: just sleep until the next timer.
                if idle {
                    std::thread::sleep(due - now);
                    self.fire_next_timer();
                    continue;
                }
            } else if idle {
                // Nothing scheduled and nothing registered: deadlock.
                // Terminate, letting stopped-waiters observe the event.
                log::debug!("hub deadlocked; stopping");
                self.set_stopped();
                self.drain_ready();
                return;
            }

            let timeout = next_due.map(|due| due.saturating_duration_since(now));
            let events = match self.inner.poller.wait(timeout) {
                Ok(events) => events,
                Err(err) => {
                    log::error!("readiness wait failed: {err}");
                    self.set_stopped();
                    self.drain_ready();
                    return;
                }
            };

            if events.is_empty() {
                // epoll timed out: the earliest timer is due.
                self.fire_next_timer();
                continue;
            }

            for (fd, mask) in events {
                // Re-checked per event: an earlier handler may have
                // unregistered this fd.
                let ch = self.inner.state.borrow().registered.get(&fd).cloned();
                if let Some(ch) = ch {
                    let _ = ch.send((fd, mask));
                    // Run the woken task now, before the next delivery, so
                    // readiness is handled in arrival order.
                    self.drain_ready();
                }
            }
        }
    }

    /// Pop and poll ready tasks until the queue is empty.
    fn drain_ready(&self) {
        loop {
            let id = {
                let mut state = self.inner.state.borrow_mut();
                state.drain_wakes();
                state.pop_ready()
            };
            match id {
                Some(id) => self.poll_task(id),
                None => return,
            }
        }
    }

    /// Poll one task to its next suspension point.
    ///
    /// A panic inside the task is caught, logged, and terminates only that
    /// task.
    fn poll_task(&self, id: TaskId) {
        let Some((mut fut, waker)) = self.inner.state.borrow_mut().begin_poll(id) else {
            // Stale id: the task already finished.
            return;
        };
        let mut cx = Context::from_waker(&waker);
        let polled = std::panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));
        match polled {
            Ok(Poll::Pending) => {
                self.inner.state.borrow_mut().end_poll_pending(id, fut);
            }
            Ok(Poll::Ready(())) => {
                self.inner.state.borrow_mut().end_poll_done(id);
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                log::error!("task panicked: {message}");
                self.inner.state.borrow_mut().end_poll_done(id);
            }
        }
    }

    /// Fire the earliest live timer, if any.
    fn fire_next_timer(&self) {
        let kind = self.inner.state.borrow_mut().scheduled.pop();
        match kind {
            None => {}
            Some(TimerKind::Wake(ring)) => ring(None),
            Some(TimerKind::Spawn(fut)) => {
                let mut state = self.inner.state.borrow_mut();
                let id = state.insert(fut);
                // Timer starts run ahead of already-queued tasks, matching
                // the immediate dispatch of fired timers.
                state.push_ready_front(id);
            }
        }
    }
}
