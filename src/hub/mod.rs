//! Hub — the event loop and scheduler for one thread of cooperative tasks.
//!
//! The Hub owns everything that decides what runs next: the FIFO ready
//! queue, the timer heap, and the epoll registration table. Tasks are
//! ordinary futures spawned onto the hub; they communicate exclusively
//! through the runtime's primitives, each of which parks the current task
//! here and hands control back to the loop.
//!
//! # Architecture
//!
//! ```text
//!                    ┌─────────────────────┐
//!                    │         Hub         │
//!                    │  ready ── timers    │
//!                    │     └── epoll ──┐   │
//!                    └───────┬─────────┼───┘
//!                            │         │
//!              ┌─────────────┼─────────┼────────────┐
//!              ▼             ▼         ▼            ▼
//!           tasks       pipes/queues  fd channels  signals
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let hub = Hub::new()?;
//! let p = hub.pipe::<u32>();
//! let sender = p.sender.clone();
//! hub.spawn(async move {
//!     let _ = sender.send(1).await;
//! });
//! let one = hub.run_until(async move { p.recv().await })??;
//! ```
//!
//! # Module Structure
//!
//! - `state`: task arena, ready queue, parking slots
//! - `run`: the main loop (drain ready → timers → epoll)

pub(crate) mod run;
pub(crate) mod state;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::Error;
use crate::pipe::{self, Pair};
use crate::poller::{Mask, Poller};
use crate::primitives::broadcast::Broadcast;
use crate::primitives::event::Event;
use crate::primitives::gate::Gate;
use crate::primitives::queue;
use crate::primitives::value::Value;
use crate::signal::Signal;
use crate::timer::{TimerId, TimerKind};

use state::{FdEvent, Park, ParkTimer, Slot, State, TaskId};

/// Handle on the event loop and scheduler.
///
/// Cheap to clone; every clone refers to the same loop. All suspending
/// operations must be awaited from within a task spawned on this hub.
pub struct Hub {
    inner: Rc<HubInner>,
}

struct HubInner {
    state: RefCell<State>,
    poller: Poller,
    /// Set when the loop terminates; `None` only mid-construction.
    stopped: RefCell<Option<Event>>,
    signal: RefCell<Signal>,
    running: Cell<bool>,
}

impl Clone for Hub {
    fn clone(&self) -> Self {
        Hub {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Hub {
    /// Create a hub with an empty scheduler and a fresh epoll instance.
    pub fn new() -> Result<Hub, Error> {
        let hub = Hub {
            inner: Rc::new(HubInner {
                state: RefCell::new(State::new()),
                poller: Poller::new()?,
                stopped: RefCell::new(None),
                signal: RefCell::new(Signal::new()),
                running: Cell::new(false),
            }),
        };
        let stopped = Event::new(&hub);
        *hub.inner.stopped.borrow_mut() = Some(stopped);
        Ok(hub)
    }

    // ------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------

    /// Create an unbuffered rendezvous pipe.
    pub fn pipe<T: 'static>(&self) -> Pair<T> {
        pipe::pair(self, false, false)
    }

    /// Create a buffered channel whose sends never block.
    pub fn channel<T: 'static>(&self) -> Channel<T> {
        Channel::new(self)
    }

    /// Create a bounded queue with room for *size* items.
    ///
    /// # Panics
    ///
    /// Panics if *size* is zero.
    pub fn queue<T: 'static>(&self, size: usize) -> Pair<T> {
        queue::queue(self, size)
    }

    /// Create a dealer: one sender fanned out to many recvers, served
    /// first-come-first-served. Clone the recver once per consumer.
    pub fn dealer<T: 'static>(&self) -> Pair<T> {
        pipe::pair(self, false, true)
    }

    /// Create a router: many senders funneled into one recver, accepted
    /// first-come-first-served. Clone the sender once per producer.
    pub fn router<T: 'static>(&self) -> Pair<T> {
        pipe::pair(self, true, false)
    }

    /// Create a best-effort pub/sub fan-out.
    pub fn broadcast<T: Clone + 'static>(&self) -> Broadcast<T> {
        Broadcast::new(self)
    }

    /// Create an unfired event.
    pub fn event(&self) -> Event {
        Event::new(self)
    }

    /// Create a gate (sticky single-slot barrier).
    pub fn gate(&self) -> Gate {
        Gate::new(self)
    }

    /// Create a write-once-observable-many value latch.
    pub fn value<T: Clone + 'static>(&self) -> Value<T> {
        Value::new(self)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Enqueue a fresh task at the tail of the ready queue.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let mut state = self.inner.state.borrow_mut();
        let id = state.insert(Box::pin(fut));
        state.push_ready(id);
    }

    /// Start *fut* as a task after *delay_ms* milliseconds.
    pub fn spawn_later<F>(&self, delay_ms: u64, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.state.borrow_mut().scheduled.add(
            Duration::from_millis(delay_ms),
            TimerKind::Spawn(Box::pin(fut)),
        );
    }

    /// Park the current task for *ms* milliseconds.
    ///
    /// # Errors
    ///
    /// `Stop` when the hub shuts down while sleeping; `Closed` when the
    /// hub stopped before the task was resumed.
    pub async fn sleep(&self, ms: u64) -> Result<(), Error> {
        Park::new(self, Slot::new(), ParkTimer::Fire(Duration::from_millis(ms))).await
    }

    /// Yield to the loop until something resumes this task.
    ///
    /// Nothing inside the runtime resumes a bare pause, so this parks until
    /// hub shutdown unless application plumbing delivers into the task.
    pub async fn pause(&self) -> Result<(), Error> {
        Park::new(self, Slot::new(), ParkTimer::None).await
    }

    /// Yield to the loop, resuming with `Timeout` after *ms* milliseconds
    /// unless a value is delivered first.
    pub async fn pause_timeout(&self, ms: u64) -> Result<(), Error> {
        Park::new(
            self,
            Slot::new(),
            ParkTimer::Timeout(Duration::from_millis(ms)),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Readiness registration
    // ------------------------------------------------------------------

    /// Register *fd* with the multiplexer.
    ///
    /// Readiness is delivered as `(fd, events)` items on the returned
    /// channel; with no task waiting, events buffer on the channel.
    pub fn register(&self, fd: RawFd, mask: Mask) -> Result<Channel<(RawFd, Mask)>, Error> {
        let ch = self.channel::<FdEvent>();
        self.inner.poller.add(fd, mask)?;
        self.inner
            .state
            .borrow_mut()
            .registered
            .insert(fd, ch.clone());
        Ok(ch)
    }

    /// Remove *fd* from the multiplexer.
    ///
    /// The delivery channel is closed first (waking any waiter with
    /// `Closed`), then the OS registration is dropped. Unknown fds are a
    /// no-op.
    pub fn unregister(&self, fd: RawFd) -> Result<(), Error> {
        let ch = self.inner.state.borrow_mut().registered.remove(&fd);
        if let Some(ch) = ch {
            ch.close();
            self.inner.poller.delete(fd)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// The event set when the loop terminates.
    pub fn stopped(&self) -> Event {
        self.inner
            .stopped
            .borrow()
            .clone()
            .expect("stopped event is initialized at construction")
    }

    /// Orderly shutdown.
    ///
    /// Sleeps one tick to let pending sends flush, delivers a `Stop`
    /// sentinel on every registered fd channel, throws `Stop` into every
    /// scheduled timer task (unstarted `spawn_later` bodies are discarded),
    /// then waits for the loop to wind down.
    pub async fn stop(&self) {
        let _ = self.sleep(1).await;

        let channels: Vec<Channel<FdEvent>> = self
            .inner
            .state
            .borrow()
            .registered
            .values()
            .cloned()
            .collect();
        for ch in channels {
            let _ = ch.send_err(Error::Stop);
        }

        let drained = self.inner.state.borrow_mut().scheduled.drain();
        for kind in drained {
            match kind {
                TimerKind::Wake(ring) => ring(Some(Error::Stop)),
                TimerKind::Spawn(fut) => drop(fut),
            }
        }

        let _ = self.stopped().wait().await;
    }

    /// Wait for SIGINT or SIGTERM, then [`Hub::stop`].
    pub async fn stop_on_term(&self) -> Result<(), Error> {
        let done = self.subscribe_signals(&[libc::SIGINT, libc::SIGTERM])?;
        done.recv().await?;
        self.stop().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Subscribe to the given signal numbers.
    ///
    /// The returned channel yields a signal number per delivery. Multiple
    /// subscribers to the same signal each get their own delivery.
    pub fn subscribe_signals(&self, signals: &[i32]) -> Result<Channel<i32>, Error> {
        Signal::subscribe(self, signals)
    }

    /// Drop a signal subscription.
    ///
    /// When a signal loses its last subscriber its handler is unregistered
    /// and the backing self-pipe is torn down.
    pub fn unsubscribe_signals(&self, ch: &Channel<i32>) {
        Signal::unsubscribe(self, ch);
    }

    // ------------------------------------------------------------------
    // Internal scheduler surface
    // ------------------------------------------------------------------

    pub(crate) fn with_signal<R>(&self, f: impl FnOnce(&mut Signal) -> R) -> R {
        f(&mut self.inner.signal.borrow_mut())
    }

    /// Identity of the task being polled right now.
    ///
    /// # Panics
    ///
    /// Panics when called outside a hub task; suspending operations are
    /// only legal from within one.
    pub(crate) fn current_task(&self) -> TaskId {
        self.inner
            .state
            .borrow()
            .current()
            .expect("this operation must be awaited from within a hub task")
    }

    /// Append a task to the ready tail.
    pub(crate) fn schedule(&self, id: TaskId) {
        self.inner.state.borrow_mut().push_ready(id);
    }

    /// Prepend a task to the ready head — the direct-switch equivalent:
    /// the task runs before anything else already queued.
    pub(crate) fn schedule_front(&self, id: TaskId) {
        self.inner.state.borrow_mut().push_ready_front(id);
    }

    pub(crate) fn scheduled_add(&self, delay: Duration, kind: TimerKind) -> TimerId {
        self.inner.state.borrow_mut().scheduled.add(delay, kind)
    }

    pub(crate) fn scheduled_remove(&self, id: TimerId) {
        self.inner.state.borrow_mut().scheduled.remove(id);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.inner.state.borrow().stopped
    }

    /// Once the hub has stopped, even a successful resume reads as
    /// `Closed`. Thrown errors pass through unchanged, so `Timeout` wins
    /// over the stopped flag.
    pub(crate) fn stop_override<T>(&self, resume: Result<T, Error>) -> Result<T, Error> {
        match resume {
            Ok(value) if self.is_stopped() => {
                drop(value);
                Err(Error::Closed)
            }
            other => other,
        }
    }

    fn set_stopped(&self) {
        self.inner.state.borrow_mut().stopped = true;
        self.stopped().set();
    }
}
