//! Buffered channels: non-blocking send, blocking recv.
//!
//! Where a pipe is a rendezvous, a channel is a mailbox: `send` is a plain
//! synchronous call that either hands the item straight to a parked
//! recver or buffers it on an unbounded deque. That makes channels the
//! delivery vehicle for contexts that cannot suspend — the main loop
//! dispatching fd readiness, signal fan-out, shutdown sentinels.
//!
//! `close` enqueues the `Closed` error *behind* anything already
//! buffered, so items sent before the close still drain in order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::Error;
use crate::hub::state::Slot;
use crate::hub::Hub;
use crate::pipe::RecvWaiter;
use crate::timer::{TimerId, TimerKind};

type Item<T> = Result<T, Error>;

/// A buffered channel handle. Clones share the channel.
pub struct Channel<T> {
    inner: Rc<ChannelInner<T>>,
}

struct ChannelInner<T> {
    hub: Hub,
    closed: Cell<bool>,
    items: RefCell<VecDeque<Item<T>>>,
    waiters: RefCell<VecDeque<RecvWaiter<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.inner.closed.get())
            .field("buffered", &self.inner.items.borrow().len())
            .field("parked", &self.inner.waiters.borrow().len())
            .finish()
    }
}

impl<T: 'static> Channel<T> {
    pub(crate) fn new(hub: &Hub) -> Channel<T> {
        Channel {
            inner: Rc::new(ChannelInner {
                hub: hub.clone(),
                closed: Cell::new(false),
                items: RefCell::new(VecDeque::new()),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Send without blocking: deliver to a parked recver or buffer.
    ///
    /// # Errors
    ///
    /// `Closed` once the channel has been closed.
    pub fn send(&self, item: T) -> Result<(), Error> {
        self.push(Ok(item))
    }

    /// Push an error; the recv side raises it in order.
    pub fn send_err(&self, err: Error) -> Result<(), Error> {
        self.push(Err(err))
    }

    /// Capture the current stack and send it as a preserved error.
    pub fn throw(&self, message: impl Into<String>) -> Result<(), Error> {
        self.push(Err(Error::trace(message)))
    }

    fn push(&self, item: Item<T>) -> Result<(), Error> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        let mut item = item;
        loop {
            let waiter = self.inner.waiters.borrow_mut().pop_front();
            match waiter {
                None => {
                    self.inner.items.borrow_mut().push_back(item);
                    return Ok(());
                }
                Some(w) => match w.slot.deliver(item) {
                    None => {
                        self.inner.hub.schedule_front(w.task);
                        return Ok(());
                    }
                    // Stale waiter (timed out): reclaim the item and try
                    // the next one.
                    Some(rejected) => item = rejected,
                },
            }
        }
    }

    /// Close the channel.
    ///
    /// Buffered items still drain; after them every recv raises `Closed`.
    /// A task already parked in recv is woken with `Closed` immediately.
    pub fn close(&self) {
        if self.inner.closed.get() {
            return;
        }
        let _ = self.push(Err(Error::Closed));
        self.inner.closed.set(true);
    }

    /// Receive the next item, blocking while the buffer is empty.
    pub async fn recv(&self) -> Result<T, Error> {
        ChannelRecv {
            ch: self,
            timeout: None,
            wait: None,
        }
        .await
    }

    /// Receive with a deadline: exactly one of a value and `Timeout` wins.
    pub async fn recv_timeout(&self, ms: u64) -> Result<T, Error> {
        ChannelRecv {
            ch: self,
            timeout: Some(Duration::from_millis(ms)),
            wait: None,
        }
        .await
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.items.borrow().is_empty()
    }

    /// Identity comparison between handles (used for unsubscription).
    pub(crate) fn same(&self, other: &Channel<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

struct ChanWait<T> {
    slot: Slot<T>,
    timer: Option<TimerId>,
}

struct ChannelRecv<'a, T> {
    ch: &'a Channel<T>,
    timeout: Option<Duration>,
    wait: Option<ChanWait<T>>,
}

impl<T: 'static> Future for ChannelRecv<'_, T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = &this.ch.inner;

        if let Some(pending) = this.wait.as_mut() {
            return match pending.slot.take() {
                None => Poll::Pending,
                Some(resume) => {
                    if let Some(id) = pending.timer.take() {
                        if !matches!(resume, Err(Error::Timeout)) {
                            inner.hub.scheduled_remove(id);
                        }
                    }
                    this.wait = None;
                    let resume = inner.hub.stop_override(resume);
                    if let Err(err) = &resume {
                        err.log_trace();
                    }
                    Poll::Ready(resume)
                }
            };
        }

        if let Some(item) = inner.items.borrow_mut().pop_front() {
            if let Err(err) = &item {
                err.log_trace();
            }
            return Poll::Ready(item);
        }
        if inner.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }

        let current = inner.hub.current_task();
        let slot = Slot::new();
        inner.waiters.borrow_mut().push_back(RecvWaiter {
            task: current,
            slot: slot.clone(),
        });
        let timer = this.timeout.map(|delay| {
            let ring_slot = slot.clone();
            let ring_hub = inner.hub.clone();
            let ring_ch = Rc::downgrade(inner);
            let ring = Box::new(move |thrown: Option<Error>| {
                let _ = ring_slot.deliver(Err(thrown.unwrap_or(Error::Timeout)));
                if let Some(ch) = ring_ch.upgrade() {
                    ch.waiters
                        .borrow_mut()
                        .retain(|w| !w.slot.same(&ring_slot));
                }
                ring_hub.schedule_front(current);
            });
            inner.hub.scheduled_add(delay, TimerKind::Wake(ring))
        });
        this.wait = Some(ChanWait { slot, timer });
        Poll::Pending
    }
}

impl<T> Drop for ChannelRecv<'_, T> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait.take() {
            self.ch
                .inner
                .waiters
                .borrow_mut()
                .retain(|w| !w.slot.same(&wait.slot));
            if let Some(id) = wait.timer {
                self.ch.inner.hub.scheduled_remove(id);
            }
        }
    }
}
