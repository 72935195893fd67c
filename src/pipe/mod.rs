//! Rendezvous pipes: the unbuffered core primitive.
//!
//! ```text
//!              +------+
//!     send --> | Pipe | --> recv
//!              +------+
//! ```
//!
//! A pipe has exactly one sender and one recver and no buffer: `send` and
//! `recv` block until the other side is ready and the item changes hands in
//! a direct rendezvous. The shared *middle* tracks a `closed` flag and the
//! tasks parked on each side; it holds only weak references back to the
//! ends, so dropping the last handle on one end is observable from the
//! other as *abandonment*.
//!
//! Dealers and routers reuse the same middle with one side tagged
//! multi-waiter: the parked-task slot becomes a FIFO deque and sends (or
//! recvs) are served head-first.
//!
//! Items travel as `Result<T, Error>` internally — an error pushed by the
//! sender is raised on the recv side, which is how close, abandonment and
//! preserved errors all reach a parked peer.
//!
//! Composition (`pipe`, `map`, `consume`, `connect`) lives in
//! [`compose`]; multi-end readiness selection lives in [`select`].

pub(crate) mod compose;
pub(crate) mod select;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::Stream;

use crate::error::Error;
use crate::hub::state::{Slot, TaskId};
use crate::hub::Hub;
use crate::timer::{TimerId, TimerKind};

pub use select::{Fired, Watch};

/// What actually traverses a pipe: a value or a raised error.
pub(crate) type Item<T> = Result<T, Error>;

/// Which side of the middle an end handle sits on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Side {
    Sender,
    Recver,
}

/// A task parked in `recv`, waiting for an item.
pub(crate) struct RecvWaiter<T> {
    pub(crate) task: TaskId,
    pub(crate) slot: Slot<T>,
}

/// A task parked in `send` (carrying its item), or a select watcher
/// (`item == None`) waiting for the far side to become ready.
pub(crate) struct SendWaiter<T> {
    pub(crate) task: TaskId,
    pub(crate) item: Option<Item<T>>,
    pub(crate) slot: Slot<()>,
}

pub(crate) struct RecvHalf<T> {
    /// FIFO of parked tasks when true (dealer); single slot otherwise.
    pub(crate) multi: bool,
    pub(crate) waiters: VecDeque<RecvWaiter<T>>,
}

pub(crate) struct SendHalf<T> {
    /// FIFO of parked tasks when true (router); single slot otherwise.
    pub(crate) multi: bool,
    pub(crate) waiters: VecDeque<SendWaiter<T>>,
}

/// The shared middle of a pipe.
pub(crate) struct Middle<T> {
    pub(crate) hub: Hub,
    pub(crate) closed: Cell<bool>,
    pub(crate) send_half: RefCell<SendHalf<T>>,
    pub(crate) recv_half: RefCell<RecvHalf<T>>,
    pub(crate) sender_end: RefCell<Weak<EndInner<T>>>,
    pub(crate) recver_end: RefCell<Weak<EndInner<T>>>,
}

/// Shared state of one end handle (and its clones).
pub(crate) struct EndInner<T> {
    side: Side,
    /// Swappable so `connect` can retarget a live end onto another middle.
    pub(crate) middle: RefCell<Rc<Middle<T>>>,
    /// Set when the end is consumed by `connect`; suppresses the
    /// abandonment hook on drop.
    detached: Cell<bool>,
    /// Link to the next section of a composed chain (installed by queues),
    /// followed by `connect` to find the chain tail.
    pub(crate) downstream: RefCell<Option<Rc<EndInner<T>>>>,
}

impl<T> EndInner<T> {
    fn new(side: Side, middle: &Rc<Middle<T>>) -> Rc<EndInner<T>> {
        Rc::new(EndInner {
            side,
            middle: RefCell::new(Rc::clone(middle)),
            detached: Cell::new(false),
            downstream: RefCell::new(None),
        })
    }

    pub(crate) fn middle(&self) -> Rc<Middle<T>> {
        Rc::clone(&self.middle.borrow())
    }

    pub(crate) fn hub(&self) -> Hub {
        self.middle().hub.clone()
    }

    pub(crate) fn detach(&self) {
        self.detached.set(true);
    }
}

/// Create a pipe, optionally tagging a side as multi-waiter.
pub(crate) fn pair<T: 'static>(hub: &Hub, multi_send: bool, multi_recv: bool) -> Pair<T> {
    let middle = Rc::new(Middle {
        hub: hub.clone(),
        closed: Cell::new(false),
        send_half: RefCell::new(SendHalf {
            multi: multi_send,
            waiters: VecDeque::new(),
        }),
        recv_half: RefCell::new(RecvHalf {
            multi: multi_recv,
            waiters: VecDeque::new(),
        }),
        sender_end: RefCell::new(Weak::new()),
        recver_end: RefCell::new(Weak::new()),
    });
    let sender = Sender {
        inner: EndInner::new(Side::Sender, &middle),
    };
    let recver = Recver {
        inner: EndInner::new(Side::Recver, &middle),
        stream: RefCell::new(None),
    };
    *middle.sender_end.borrow_mut() = Rc::downgrade(&sender.inner);
    *middle.recver_end.borrow_mut() = Rc::downgrade(&recver.inner);
    Pair { sender, recver }
}

// ---------------------------------------------------------------------
// Drop / abandonment
// ---------------------------------------------------------------------

/// Drop hook shared by both end types.
///
/// Runs only for the last live handle of a non-detached end. The only
/// action taken here is enqueueing a hub task; the actual `Abandoned`
/// delivery happens once execution is back under the loop.
fn end_dropped<T: 'static>(inner: &Rc<EndInner<T>>) {
    if inner.detached.get() {
        return;
    }
    if Rc::strong_count(inner) > 1 {
        return;
    }
    let middle = inner.middle();
    let dropped = inner.side;
    let other_alive = match dropped {
        Side::Sender => middle.recver_end.borrow().upgrade().is_some(),
        Side::Recver => middle.sender_end.borrow().upgrade().is_some(),
    };
    if !other_alive {
        return;
    }
    let hub = middle.hub.clone();
    hub.spawn(async move {
        // Front-scheduling in reverse keeps the waiters' FIFO order.
        match dropped {
            Side::Sender => {
                let waiters: Vec<RecvWaiter<T>> =
                    middle.recv_half.borrow_mut().waiters.drain(..).collect();
                for w in waiters.into_iter().rev() {
                    if w.slot.deliver(Err(Error::Abandoned)).is_none() {
                        middle.hub.schedule_front(w.task);
                    }
                }
            }
            Side::Recver => {
                let waiters: Vec<SendWaiter<T>> =
                    middle.send_half.borrow_mut().waiters.drain(..).collect();
                for w in waiters.into_iter().rev() {
                    if w.slot.deliver(Err(Error::Abandoned)).is_none() {
                        middle.hub.schedule_front(w.task);
                    }
                }
            }
        }
    });
}

// ---------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------

/// The sending end of a pipe.
///
/// Clones share the end: cloning is how a router sender is handed to many
/// producer tasks. The end counts as abandoned when the last clone drops.
pub struct Sender<T: 'static> {
    pub(crate) inner: Rc<EndInner<T>>,
}

impl<T: 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        end_dropped(&self.inner);
    }
}

impl<T: 'static> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.inner.middle();
        let parked = m.send_half.borrow().waiters.len();
        f.debug_struct("Sender")
            .field("closed", &m.closed.get())
            .field("parked", &parked)
            .finish()
    }
}

impl<T: 'static> Sender<T> {
    pub(crate) fn from_inner(inner: Rc<EndInner<T>>) -> Sender<T> {
        Sender { inner }
    }

    /// Send *item*, blocking until a recver takes it.
    ///
    /// # Errors
    ///
    /// `Closed` if the pipe is closed, `Abandoned` if the recver was
    /// dropped.
    pub async fn send(&self, item: T) -> Result<(), Error> {
        SendFut::new(self, Ok(item), None).await
    }

    /// Send with a deadline: exactly one of delivery and `Timeout` wins.
    pub async fn send_timeout(&self, item: T, ms: u64) -> Result<(), Error> {
        SendFut::new(self, Ok(item), Some(Duration::from_millis(ms))).await
    }

    /// Push an error down the pipe; the recver raises it.
    pub async fn send_err(&self, err: Error) -> Result<(), Error> {
        SendFut::new(self, Err(err), None).await
    }

    /// Capture the current stack and send it as a preserved error.
    pub async fn throw(&self, message: impl Into<String>) -> Result<(), Error> {
        self.send_err(Error::trace(message)).await
    }

    /// True when a recv is parked and a send would complete immediately.
    pub fn ready(&self) -> bool {
        let m = self.inner.middle();
        !m.closed.get()
            && m.recver_end.borrow().upgrade().is_some()
            && !m.recv_half.borrow().waiters.is_empty()
    }

    /// True when the pipe is closed or the recver has been dropped.
    pub fn halted(&self) -> bool {
        let m = self.inner.middle();
        m.closed.get() || m.recver_end.borrow().upgrade().is_none()
    }

    /// Close the pipe. A task parked in `recv` is woken with `Closed`
    /// before anything else runs.
    pub fn close(&self) {
        let m = self.inner.middle();
        m.closed.set(true);
        let waiters: Vec<RecvWaiter<T>> = m.recv_half.borrow_mut().waiters.drain(..).collect();
        for w in waiters.into_iter().rev() {
            if w.slot.deliver(Err(Error::Closed)).is_none() {
                m.hub.schedule_front(w.task);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Recver
// ---------------------------------------------------------------------

/// The receiving end of a pipe.
///
/// Clones share the end: cloning is how a dealer recver is handed to many
/// consumer tasks. The end counts as abandoned when the last clone drops.
///
/// A recver is also a [`Stream`] of `Result<T, Error>` items that ends
/// cleanly on close or abandonment.
pub struct Recver<T: 'static> {
    pub(crate) inner: Rc<EndInner<T>>,
    /// Parked bookkeeping for the `Stream` impl.
    stream: RefCell<Option<RecvWait<T>>>,
}

impl<T: 'static> Clone for Recver<T> {
    fn clone(&self) -> Self {
        Recver {
            inner: Rc::clone(&self.inner),
            stream: RefCell::new(None),
        }
    }
}

impl<T: 'static> Drop for Recver<T> {
    fn drop(&mut self) {
        end_dropped(&self.inner);
    }
}

impl<T: 'static> std::fmt::Debug for Recver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.inner.middle();
        let parked = m.recv_half.borrow().waiters.len();
        f.debug_struct("Recver")
            .field("closed", &m.closed.get())
            .field("parked", &parked)
            .finish()
    }
}

impl<T: 'static> Recver<T> {
    pub(crate) fn from_inner(inner: Rc<EndInner<T>>) -> Recver<T> {
        Recver {
            inner,
            stream: RefCell::new(None),
        }
    }

    /// Receive the next item, blocking until a sender provides one.
    ///
    /// # Errors
    ///
    /// `Closed`, `Abandoned`, or whatever error the sender pushed as an
    /// item.
    pub async fn recv(&self) -> Result<T, Error> {
        RecvFut {
            end: self,
            timeout: None,
            wait: None,
        }
        .await
    }

    /// Receive with a deadline: exactly one of a value and `Timeout` wins.
    pub async fn recv_timeout(&self, ms: u64) -> Result<T, Error> {
        RecvFut {
            end: self,
            timeout: Some(Duration::from_millis(ms)),
            wait: None,
        }
        .await
    }

    /// True when a send is parked and a recv would complete immediately.
    pub fn ready(&self) -> bool {
        let m = self.inner.middle();
        !m.closed.get()
            && m.sender_end.borrow().upgrade().is_some()
            && !m.send_half.borrow().waiters.is_empty()
    }

    /// True when the pipe is closed or the sender has been dropped.
    pub fn halted(&self) -> bool {
        let m = self.inner.middle();
        m.closed.get() || m.sender_end.borrow().upgrade().is_none()
    }

    /// Close the pipe. A task parked in `send` is woken with `Closed`
    /// before anything else runs.
    pub fn close(&self) {
        let m = self.inner.middle();
        m.closed.set(true);
        let waiters: Vec<SendWaiter<T>> = m.send_half.borrow_mut().waiters.drain(..).collect();
        for w in waiters.into_iter().rev() {
            if w.slot.deliver(Err(Error::Closed)).is_none() {
                m.hub.schedule_front(w.task);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Pair
// ---------------------------------------------------------------------

/// Both ends of a pipe, as returned by the hub factories.
///
/// Convenience methods forward to the ends; a common pattern is splitting
/// the pair and moving each end into its own task. The sender and recver
/// item types diverge once a transform is spliced on (`pipe`, `map`).
#[derive(Debug)]
pub struct Pair<S: 'static, R: 'static = S> {
    /// The sending end.
    pub sender: Sender<S>,
    /// The receiving end.
    pub recver: Recver<R>,
}

impl<S: 'static, R: 'static> Pair<S, R> {
    /// Send on this pair's sender.
    pub async fn send(&self, item: S) -> Result<(), Error> {
        self.sender.send(item).await
    }

    /// Timed send on this pair's sender.
    pub async fn send_timeout(&self, item: S, ms: u64) -> Result<(), Error> {
        self.sender.send_timeout(item, ms).await
    }

    /// Receive from this pair's recver.
    pub async fn recv(&self) -> Result<R, Error> {
        self.recver.recv().await
    }

    /// Timed receive from this pair's recver.
    pub async fn recv_timeout(&self, ms: u64) -> Result<R, Error> {
        self.recver.recv_timeout(ms).await
    }

    /// Close both ends.
    pub fn close(&self) {
        self.sender.close();
        self.recver.close();
    }
}

// ---------------------------------------------------------------------
// Send future
// ---------------------------------------------------------------------

struct SendWait<T: 'static> {
    slot: Slot<()>,
    timer: Option<TimerId>,
    middle: Rc<Middle<T>>,
}

enum SendState<T: 'static> {
    Init(Option<Item<T>>),
    Parked,
    /// Delivered straight into a parked recver; yield once so the recver
    /// runs first, then complete.
    Flushed,
    Done,
}

struct SendFut<'a, T: 'static> {
    end: &'a Sender<T>,
    state: SendState<T>,
    timeout: Option<Duration>,
    wait: Option<SendWait<T>>,
}

impl<'a, T: 'static> SendFut<'a, T> {
    fn new(end: &'a Sender<T>, item: Item<T>, timeout: Option<Duration>) -> SendFut<'a, T> {
        SendFut {
            end,
            state: SendState::Init(Some(item)),
            timeout,
            wait: None,
        }
    }
}

// Nothing here is structurally pinned; the pending item is plain state.
impl<T: 'static> Unpin for SendFut<'_, T> {}

impl<T: 'static> Future for SendFut<'_, T> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            SendState::Init(item) => {
                let Some(mut item) = item.take() else {
                    panic!("send future polled twice in init state");
                };
                let m = this.end.inner.middle();
                let hub = m.hub.clone();
                if m.closed.get() {
                    this.state = SendState::Done;
                    return Poll::Ready(Err(Error::Closed));
                }
                if m.recver_end.borrow().upgrade().is_none() {
                    this.state = SendState::Done;
                    return Poll::Ready(Err(Error::Abandoned));
                }
                let current = hub.current_task();

                // Hand off to a parked recver if there is one. Waiters whose
                // slot is already occupied timed out; skip past them.
                loop {
                    let waiter = m.recv_half.borrow_mut().waiters.pop_front();
                    let Some(w) = waiter else { break };
                    match w.slot.deliver(item) {
                        None => {
                            // Receiver runs first; we re-queue at the tail,
                            // preserving the switch ordering contract.
                            hub.schedule_front(w.task);
                            hub.schedule(current);
                            this.state = SendState::Flushed;
                            return Poll::Pending;
                        }
                        Some(rejected) => item = rejected,
                    }
                }

                // Nobody waiting: park with the item until a recv takes it.
                {
                    let mut half = m.send_half.borrow_mut();
                    assert!(
                        half.multi || half.waiters.is_empty(),
                        "pipe already has a parked sender"
                    );
                    let slot = Slot::new();
                    half.waiters.push_back(SendWaiter {
                        task: current,
                        item: Some(item),
                        slot: slot.clone(),
                    });
                    let timer = this.timeout.map(|delay| {
                        let ring_slot = slot.clone();
                        let ring_hub = hub.clone();
                        let ring_end = Rc::downgrade(&this.end.inner);
                        let ring = Box::new(move |thrown: Option<Error>| {
                            let _ = ring_slot.deliver(Err(thrown.unwrap_or(Error::Timeout)));
                            if let Some(inner) = ring_end.upgrade() {
                                unpark_sender(&inner.middle(), &ring_slot);
                            }
                            ring_hub.schedule_front(current);
                        });
                        hub.scheduled_add(delay, TimerKind::Wake(ring))
                    });
                    this.wait = Some(SendWait {
                        slot,
                        timer,
                        middle: Rc::clone(&m),
                    });
                }
                this.state = SendState::Parked;
                Poll::Pending
            }
            SendState::Parked => {
                let wait = this.wait.as_mut().expect("parked send carries wait state");
                match wait.slot.take() {
                    None => Poll::Pending,
                    Some(resume) => {
                        if let Some(id) = wait.timer.take() {
                            if !matches!(resume, Err(Error::Timeout)) {
                                this.end.inner.hub().scheduled_remove(id);
                            }
                        }
                        this.wait = None;
                        this.state = SendState::Done;
                        let hub = this.end.inner.hub();
                        Poll::Ready(hub.stop_override(resume))
                    }
                }
            }
            SendState::Flushed => {
                this.state = SendState::Done;
                Poll::Ready(Ok(()))
            }
            SendState::Done => panic!("send future polled after completion"),
        }
    }
}

impl<T: 'static> Drop for SendFut<'_, T> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait.take() {
            unpark_sender(&wait.middle, &wait.slot);
            if let Some(id) = wait.timer {
                wait.middle.hub.scheduled_remove(id);
            }
        }
    }
}

fn unpark_sender<T>(middle: &Middle<T>, slot: &Slot<()>) {
    middle
        .send_half
        .borrow_mut()
        .waiters
        .retain(|w| !w.slot.same(slot));
}

fn unpark_recver<T>(middle: &Middle<T>, slot: &Slot<T>) {
    middle
        .recv_half
        .borrow_mut()
        .waiters
        .retain(|w| !w.slot.same(slot));
}

// ---------------------------------------------------------------------
// Recv future
// ---------------------------------------------------------------------

pub(crate) struct RecvWait<T: 'static> {
    slot: Slot<T>,
    timer: Option<TimerId>,
}

struct RecvFut<'a, T: 'static> {
    end: &'a Recver<T>,
    timeout: Option<Duration>,
    wait: Option<RecvWait<T>>,
}

/// Shared poll logic for `recv`, `recv_timeout` and the `Stream` impl.
fn poll_recv<T: 'static>(
    inner: &Rc<EndInner<T>>,
    wait: &mut Option<RecvWait<T>>,
    timeout: Option<Duration>,
) -> Poll<Result<T, Error>> {
    if let Some(pending) = wait.as_mut() {
        return match pending.slot.take() {
            None => Poll::Pending,
            Some(resume) => {
                if let Some(id) = pending.timer.take() {
                    if !matches!(resume, Err(Error::Timeout)) {
                        inner.hub().scheduled_remove(id);
                    }
                }
                *wait = None;
                let resume = inner.hub().stop_override(resume);
                if let Err(err) = &resume {
                    err.log_trace();
                }
                Poll::Ready(resume)
            }
        };
    }

    let m = inner.middle();
    let hub = m.hub.clone();
    if m.closed.get() {
        return Poll::Ready(Err(Error::Closed));
    }
    let current = hub.current_task();

    // Direct path: a sender is parked with its item — take it and resume
    // the sender at the ready tail; we continue without suspending. A
    // select watcher (no item) at the head is fired instead: the selecting
    // task will complete the rendezvous with an actual send once we park.
    // Waiters whose slot is already occupied timed out; skip past them.
    let mut fired_watcher = false;
    loop {
        let waiter = m.send_half.borrow_mut().waiters.pop_front();
        let Some(mut w) = waiter else { break };
        match w.item.take() {
            Some(item) => {
                if w.slot.deliver(Ok(())).is_none() {
                    hub.schedule(w.task);
                    if let Err(err) = &item {
                        err.log_trace();
                    }
                    return Poll::Ready(item);
                }
            }
            None => {
                if w.slot.deliver(Ok(())).is_none() {
                    hub.schedule_front(w.task);
                    fired_watcher = true;
                    break;
                }
            }
        }
    }

    if !fired_watcher && m.sender_end.borrow().upgrade().is_none() {
        return Poll::Ready(Err(Error::Abandoned));
    }

    // Park until a sender delivers.
    let slot = Slot::new();
    {
        let mut half = m.recv_half.borrow_mut();
        assert!(
            half.multi || half.waiters.is_empty(),
            "pipe already has a parked recver"
        );
        half.waiters.push_back(RecvWaiter {
            task: current,
            slot: slot.clone(),
        });
    }
    let timer = timeout.map(|delay| {
        let ring_slot = slot.clone();
        let ring_hub = hub.clone();
        let ring_end = Rc::downgrade(inner);
        let ring = Box::new(move |thrown: Option<Error>| {
            let _ = ring_slot.deliver(Err(thrown.unwrap_or(Error::Timeout)));
            if let Some(end) = ring_end.upgrade() {
                unpark_recver(&end.middle(), &ring_slot);
            }
            ring_hub.schedule_front(current);
        });
        hub.scheduled_add(delay, TimerKind::Wake(ring))
    });
    *wait = Some(RecvWait { slot, timer });
    Poll::Pending
}

impl<T: 'static> Future for RecvFut<'_, T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = Rc::clone(&this.end.inner);
        poll_recv(&inner, &mut this.wait, this.timeout)
    }
}

impl<T: 'static> Drop for RecvFut<'_, T> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait.take() {
            unpark_recver(&self.end.inner.middle(), &wait.slot);
            if let Some(id) = wait.timer {
                self.end.inner.middle().hub.scheduled_remove(id);
            }
        }
    }
}

impl<T: 'static> Stream for Recver<T> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let inner = Rc::clone(&this.inner);
        match poll_recv(&inner, this.stream.get_mut(), None) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Err(err)) if err.is_halt() => Poll::Ready(None),
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
        }
    }
}
