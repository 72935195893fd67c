//! Gate: a sticky "push once, observe later" barrier.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::Error;
use crate::hub::Hub;
use crate::pipe::Pair;

/// A single-slot barrier with sticky state.
///
/// `trigger` sets the state and, if a task is already parked in `wait`,
/// delivers through the internal pipe; `wait` returns immediately while
/// the state is set. `clear` resets the state so the next `wait` parks
/// again.
pub struct Gate {
    inner: Rc<GateInner>,
}

struct GateInner {
    state: Cell<bool>,
    pipe: Pair<()>,
}

impl Clone for Gate {
    fn clone(&self) -> Self {
        Gate {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Gate {
    pub(crate) fn new(hub: &Hub) -> Gate {
        Gate {
            inner: Rc::new(GateInner {
                state: Cell::new(false),
                pipe: hub.pipe(),
            }),
        }
    }

    /// Set the sticky state and wake a parked waiter, if any.
    pub async fn trigger(&self) -> Result<(), Error> {
        self.inner.state.set(true);
        if self.inner.pipe.sender.ready() {
            self.inner.pipe.send(()).await?;
        }
        Ok(())
    }

    /// Block until triggered. Returns immediately while the state is set.
    pub async fn wait(&self) -> Result<(), Error> {
        if !self.inner.state.get() {
            self.inner.pipe.recv().await?;
        }
        Ok(())
    }

    /// Like [`Gate::wait`] with a deadline.
    pub async fn wait_timeout(&self, ms: u64) -> Result<(), Error> {
        if !self.inner.state.get() {
            self.inner.pipe.recv_timeout(ms).await?;
        }
        Ok(())
    }

    /// Reset the sticky state.
    pub fn clear(&self) {
        self.inner.state.set(false);
    }

    /// Current sticky state.
    pub fn triggered(&self) -> bool {
        self.inner.state.get()
    }
}
