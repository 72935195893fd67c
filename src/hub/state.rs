//! Scheduler bookkeeping: the task arena, ready queue and parking slots.
//!
//! Tasks are plain `Future<Output = ()>` values stored in a slab. A task's
//! identity is its slab slot plus a generation counter, so a stale wakeup
//! aimed at a finished task cannot touch the slot's next occupant.
//!
//! Resume *values* never travel through the ready queue. A parked task
//! shares a [`Slot`] with whoever will wake it; the waking side writes the
//! value (or the thrown error) into the slot and schedules the task, and
//! the task reads the slot when it is next polled. This is the ownership
//! rendition of switching into a coroutine with arguments.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake};

use slab::Slab;

use crate::error::Error;
use crate::timer::{Scheduler, TaskFuture, TimerId};

use super::Hub;

/// Identity of a spawned task: slab slot plus generation tag.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct TaskId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

struct Task {
    generation: u64,
    /// Taken out of the slot while the task is being polled.
    fut: Option<TaskFuture>,
}

/// Cross-thread wake requests, drained into the ready queue each loop round.
///
/// All real scheduling happens on the hub thread; this queue exists to give
/// out `Waker`s that satisfy the `Send + Sync` contract, e.g. when hub
/// futures are nested inside combinators.
pub(crate) struct WakeQueue {
    pending: Mutex<Vec<TaskId>>,
}

impl WakeQueue {
    fn push(&self, id: TaskId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(id);
        }
    }

    fn drain(&self) -> Vec<TaskId> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }
}

struct TaskWaker {
    id: TaskId,
    wakes: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wakes.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wakes.push(self.id);
    }
}

/// Mutable scheduler state behind the hub handle.
pub(crate) struct State {
    tasks: Slab<Task>,
    next_generation: u64,
    ready: VecDeque<TaskId>,
    pub(crate) scheduled: Scheduler,
    /// fd → delivery channel, owned by the multiplexer.
    pub(crate) registered:
        std::collections::HashMap<std::os::unix::io::RawFd, crate::channel::Channel<FdEvent>>,
    /// Set once the loop detects deadlock or orderly stop completes.
    pub(crate) stopped: bool,
    current: Option<TaskId>,
    wakes: Arc<WakeQueue>,
}

/// Items delivered on fd readiness channels.
pub(crate) type FdEvent = (std::os::unix::io::RawFd, crate::poller::Mask);

impl State {
    pub(crate) fn new() -> State {
        State {
            tasks: Slab::new(),
            next_generation: 0,
            ready: VecDeque::new(),
            scheduled: Scheduler::new(),
            registered: std::collections::HashMap::new(),
            stopped: false,
            current: None,
            wakes: Arc::new(WakeQueue {
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Store a task body and hand back its identity. Does not schedule it.
    pub(crate) fn insert(&mut self, fut: TaskFuture) -> TaskId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.tasks.insert(Task {
            generation,
            fut: Some(fut),
        });
        TaskId { index, generation }
    }

    pub(crate) fn push_ready(&mut self, id: TaskId) {
        self.ready.push_back(id);
    }

    pub(crate) fn push_ready_front(&mut self, id: TaskId) {
        self.ready.push_front(id);
    }

    pub(crate) fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    pub(crate) fn drain_wakes(&mut self) {
        for id in self.wakes.drain() {
            self.ready.push_back(id);
        }
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Take the task body out for polling. `None` when the id is stale.
    pub(crate) fn begin_poll(&mut self, id: TaskId) -> Option<(TaskFuture, std::task::Waker)> {
        let task = self.tasks.get_mut(id.index)?;
        if task.generation != id.generation {
            return None;
        }
        let fut = task.fut.take()?;
        self.current = Some(id);
        let waker = std::task::Waker::from(Arc::new(TaskWaker {
            id,
            wakes: Arc::clone(&self.wakes),
        }));
        Some((fut, waker))
    }

    /// Park the body back in its slot after a pending poll.
    pub(crate) fn end_poll_pending(&mut self, id: TaskId, fut: TaskFuture) {
        self.current = None;
        if let Some(task) = self.tasks.get_mut(id.index) {
            if task.generation == id.generation {
                task.fut = Some(fut);
            }
        }
    }

    /// Drop the task after completion or a poll panic.
    pub(crate) fn end_poll_done(&mut self, id: TaskId) {
        self.current = None;
        if self
            .tasks
            .get(id.index)
            .is_some_and(|task| task.generation == id.generation)
        {
            self.tasks.remove(id.index);
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .field("scheduled", &self.scheduled)
            .field("registered", &self.registered.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// One-shot resume slot shared between a parked task and its waker.
///
/// Delivery is first-write-wins: a timeout ring and a value delivery can
/// race across loop rounds, and whichever lands first decides the resume.
pub(crate) struct Slot<T>(std::rc::Rc<std::cell::RefCell<Option<Result<T, Error>>>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot(std::rc::Rc::clone(&self.0))
    }
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Slot<T> {
        Slot(std::rc::Rc::new(std::cell::RefCell::new(None)))
    }

    /// Write the resume value unless one is already pending.
    ///
    /// Returns `None` when the write landed and hands the value back when
    /// the slot was already occupied — a waiter that timed out can still be
    /// sitting in a queue, and the racing deliverer needs its item back to
    /// try the next waiter.
    pub(crate) fn deliver(&self, value: Result<T, Error>) -> Option<Result<T, Error>> {
        let mut inner = self.0.borrow_mut();
        if inner.is_some() {
            return Some(value);
        }
        *inner = Some(value);
        None
    }

    pub(crate) fn take(&self) -> Option<Result<T, Error>> {
        self.0.borrow_mut().take()
    }

    /// Pointer identity, used to find and remove a parked waiter.
    pub(crate) fn same(&self, other: &Slot<T>) -> bool {
        std::rc::Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.0.borrow().is_some() {
            "delivered"
        } else {
            "empty"
        };
        f.write_str(state)
    }
}

/// Timer behavior for a [`Park`].
#[derive(Copy, Clone, Debug)]
pub(crate) enum ParkTimer {
    /// Park until somebody delivers into the slot.
    None,
    /// Arm a timer that throws `Timeout` if nothing arrives first.
    Timeout(std::time::Duration),
    /// Arm a timer that resumes with `Ok(())` — the sleep shape.
    Fire(std::time::Duration),
}

/// Future that parks the current task until its slot is delivered.
///
/// The caller registers the slot with whatever will wake it (an event's
/// waiter list, a pipe half, nothing at all for a bare pause) before
/// awaiting. The timer, if any, is armed on first poll so that building
/// the future does not start the clock.
///
/// Resume semantics: a thrown error is returned as-is, `Timeout` wins
/// over the stopped flag, and a *successful* resume after the hub has
/// stopped still returns `Closed`.
pub(crate) struct Park {
    hub: Hub,
    slot: Slot<()>,
    arm: Option<ParkTimer>,
    timer: Option<TimerId>,
}

impl Park {
    pub(crate) fn new(hub: &Hub, slot: Slot<()>, arm: ParkTimer) -> Park {
        Park {
            hub: hub.clone(),
            slot,
            arm: Some(arm),
            timer: None,
        }
    }
}

impl Future for Park {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(arm) = self.arm.take() {
            if let Some(resume) = self.slot.take() {
                // Delivered before we ever parked; no timer needed.
                return Poll::Ready(self.hub.stop_override(resume));
            }
            let task = self.hub.current_task();
            let slot = self.slot.clone();
            let hub = self.hub.clone();
            match arm {
                ParkTimer::None => {}
                ParkTimer::Timeout(delay) => {
                    let ring = Box::new(move |thrown: Option<Error>| {
                        let _ = slot.deliver(Err(thrown.unwrap_or(Error::Timeout)));
                        hub.schedule_front(task);
                    });
                    let id = self.hub.scheduled_add(delay, crate::timer::TimerKind::Wake(ring));
                    self.timer = Some(id);
                }
                ParkTimer::Fire(delay) => {
                    let ring = Box::new(move |thrown: Option<Error>| {
                        let resume = match thrown {
                            None => Ok(()),
                            Some(err) => Err(err),
                        };
                        let _ = slot.deliver(resume);
                        hub.schedule_front(task);
                    });
                    let id = self.hub.scheduled_add(delay, crate::timer::TimerKind::Wake(ring));
                    self.timer = Some(id);
                }
            }
            return Poll::Pending;
        }

        match self.slot.take() {
            None => Poll::Pending,
            Some(resume) => {
                if let Some(id) = self.timer.take() {
                    // The timer only fired if it is what delivered; anything
                    // else means a value won the race and the timer must be
                    // tombstoned.
                    if !matches!(resume, Err(Error::Timeout)) {
                        self.hub.scheduled_remove(id);
                    }
                }
                Poll::Ready(self.hub.stop_override(resume))
            }
        }
    }
}

impl Drop for Park {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            self.hub.scheduled_remove(id);
        }
    }
}

impl std::fmt::Debug for Park {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Park")
            .field("slot", &self.slot)
            .field("armed", &self.timer.is_some())
            .finish()
    }
}
