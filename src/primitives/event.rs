//! Event: a settable flag with a FIFO of waiters.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Error;
use crate::hub::state::{Park, ParkTimer, Slot, TaskId};
use crate::hub::Hub;

/// A flag that tasks can wait on.
///
/// `wait` returns immediately once the flag is set; `set` wakes the
/// current batch of waiters in insertion order; `clear` resets the flag
/// *and* isolates the batch already waiting, so a later `set` only fires
/// tasks that parked after the clear.
pub struct Event {
    hub: Hub,
    inner: Rc<RefCell<EventInner>>,
}

struct EventInner {
    fired: bool,
    waiters: VecDeque<(TaskId, Slot<()>)>,
}

impl Clone for Event {
    fn clone(&self) -> Self {
        Event {
            hub: self.hub.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Event")
            .field("fired", &inner.fired)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl Event {
    pub(crate) fn new(hub: &Hub) -> Event {
        Event {
            hub: hub.clone(),
            inner: Rc::new(RefCell::new(EventInner {
                fired: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// True once `set` has run without a later `clear`.
    pub fn fired(&self) -> bool {
        self.inner.borrow().fired
    }

    /// Block until the flag is set. Returns immediately if it already is.
    ///
    /// # Errors
    ///
    /// `Closed` when resumed after the hub stopped.
    pub async fn wait(&self) -> Result<(), Error> {
        if self.inner.borrow().fired {
            return Ok(());
        }
        let slot = Slot::new();
        let task = self.hub.current_task();
        self.inner.borrow_mut().waiters.push_back((task, slot.clone()));
        Park::new(&self.hub, slot, ParkTimer::None).await
    }

    /// Like [`Event::wait`] with a deadline.
    pub async fn wait_timeout(&self, ms: u64) -> Result<(), Error> {
        if self.inner.borrow().fired {
            return Ok(());
        }
        let slot = Slot::new();
        let task = self.hub.current_task();
        self.inner.borrow_mut().waiters.push_back((task, slot.clone()));
        Park::new(
            &self.hub,
            slot,
            ParkTimer::Timeout(std::time::Duration::from_millis(ms)),
        )
        .await
    }

    /// Set the flag and wake the waiting batch in insertion order.
    pub fn set(&self) {
        let batch = {
            let mut inner = self.inner.borrow_mut();
            inner.fired = true;
            std::mem::take(&mut inner.waiters)
        };
        for (task, slot) in batch {
            if slot.deliver(Ok(())).is_none() {
                self.hub.schedule(task);
            }
        }
    }

    /// Reset the flag, isolating the batch already waiting: those tasks
    /// only resume on a `set` of *their* batch, which can no longer come.
    pub fn clear(&self) -> &Event {
        let mut inner = self.inner.borrow_mut();
        inner.fired = false;
        inner.waiters = VecDeque::new();
        self
    }
}
