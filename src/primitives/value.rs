//! Value: a write-once-observable-many latch.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Error;
use crate::hub::state::{Park, ParkTimer, Slot, TaskId};
use crate::hub::Hub;

/// A latch holding a memoized payload.
///
/// `send` records the value and wakes every parked waiter; `recv` returns
/// the memoized value immediately once one is present. `clear` forgets
/// the value so the next `recv` parks again.
pub struct Value<T> {
    hub: Hub,
    inner: Rc<RefCell<ValueInner<T>>>,
}

struct ValueInner<T> {
    value: Option<T>,
    waiters: VecDeque<(TaskId, Slot<()>)>,
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Value {
            hub: self.hub.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Value")
            .field("ready", &inner.value.is_some())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl<T: Clone + 'static> Value<T> {
    pub(crate) fn new(hub: &Hub) -> Value<T> {
        Value {
            hub: hub.clone(),
            inner: Rc::new(RefCell::new(ValueInner {
                value: None,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Record *item* and wake every parked waiter in insertion order.
    ///
    /// Sending again overwrites the memoized value.
    pub fn send(&self, item: T) {
        let batch = {
            let mut inner = self.inner.borrow_mut();
            inner.value = Some(item);
            std::mem::take(&mut inner.waiters)
        };
        for (task, slot) in batch {
            if slot.deliver(Ok(())).is_none() {
                self.hub.schedule(task);
            }
        }
    }

    /// Return the memoized value, parking until one is recorded.
    pub async fn recv(&self) -> Result<T, Error> {
        loop {
            if let Some(value) = self.inner.borrow().value.clone() {
                return Ok(value);
            }
            let slot = Slot::new();
            let task = self.hub.current_task();
            self.inner.borrow_mut().waiters.push_back((task, slot.clone()));
            Park::new(&self.hub, slot, ParkTimer::None).await?;
            // Re-check: the value may have been cleared again before this
            // task got to run.
        }
    }

    /// Like [`Value::recv`] with a deadline.
    pub async fn recv_timeout(&self, ms: u64) -> Result<T, Error> {
        loop {
            if let Some(value) = self.inner.borrow().value.clone() {
                return Ok(value);
            }
            let slot = Slot::new();
            let task = self.hub.current_task();
            self.inner.borrow_mut().waiters.push_back((task, slot.clone()));
            Park::new(
                &self.hub,
                slot,
                ParkTimer::Timeout(std::time::Duration::from_millis(ms)),
            )
            .await?;
        }
    }

    /// True while a value is memoized.
    pub fn ready(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// Forget the memoized value.
    pub fn clear(&self) {
        self.inner.borrow_mut().value = None;
    }
}
