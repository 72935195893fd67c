//! Pipe composition: `pipe`, `map`, `consume`, `connect`.
//!
//! Chains are explicit under ownership: splicing a transform consumes the
//! recver and hands it, together with a fresh sender, to a spawned task
//! that owns both for the life of the chain. `connect` is the one true
//! rewiring operation — it fuses two pipes into one by retargeting a live
//! recver onto the upstream middle, parked waiters and all.
//!
//! ```text
//!   r.pipe(f):    s1 ─ m1 ─ r1            s1 ─ m1 ─[ f ]─ m2 ─ r2
//!                               becomes
//!   s2.connect(r1):  s1 ─ m1 ─ r1 ⋯ s2 ─ m2 ─ r2   becomes   s1 ─ m1 ─ r2
//! ```

use std::future::Future;
use std::rc::Rc;

use crate::error::Error;

use super::{EndInner, Pair, Recver, Sender};

impl<T: 'static> Recver<T> {
    /// Splice a transform between this recver and its sender.
    ///
    /// *f* receives this recver as its upstream and a fresh sender as its
    /// downstream and runs as a new task; the returned recver yields
    /// whatever the transform sends. The task owns both intermediate ends,
    /// which is what keeps a long chain alive end to end.
    ///
    /// ```ignore
    /// let doubled = p.recver.pipe(|r, s| async move {
    ///     while let Ok(n) = r.recv().await {
    ///         if s.send(n * 2).await.is_err() {
    ///             return;
    ///         }
    ///     }
    /// });
    /// ```
    pub fn pipe<U, F, Fut>(self, f: F) -> Recver<U>
    where
        U: 'static,
        F: FnOnce(Recver<T>, Sender<U>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let hub = self.inner.hub();
        let next = hub.pipe::<U>();
        hub.spawn(f(self, next.sender));
        next.recver
    }

    /// Transform every item with *f*.
    ///
    /// `Err(Filter)` from *f* drops the item silently; any other error is
    /// forwarded downstream as an item. Errors arriving from upstream are
    /// forwarded the same way, and the transform winds down on halt.
    pub fn map<U, F>(self, mut f: F) -> Recver<U>
    where
        U: 'static,
        F: FnMut(T) -> Result<U, Error> + 'static,
    {
        self.pipe(|r, s| async move {
            loop {
                let forward = match r.recv().await {
                    Ok(item) => match f(item) {
                        Ok(mapped) => s.send(mapped).await,
                        Err(Error::Filter) => continue,
                        Err(err) => s.send_err(err).await,
                    },
                    Err(err) if err.is_halt() => return,
                    Err(err) => s.send_err(err).await,
                };
                if forward.is_err() {
                    return;
                }
            }
        })
    }

    /// Feed this recver into *sender*'s pipe — the target-is-a-sender
    /// flavor of piping. Equivalent to `sender.connect(self)`; returns the
    /// tail recver of the resulting chain.
    pub fn pipe_into(self, sender: Sender<T>) -> Recver<T> {
        sender.connect(self)
    }

    /// Terminate the chain with a sink that feeds every item to *f*.
    ///
    /// A halt-class error returned by *f* closes the recver and stops the
    /// sink; any other error terminates the sink with a logged diagnostic,
    /// mirroring an uncaught failure in a task.
    pub fn consume<F>(self, mut f: F)
    where
        F: FnMut(T) -> Result<(), Error> + 'static,
    {
        let hub = self.inner.hub();
        hub.spawn(async move {
            loop {
                match self.recv().await {
                    Ok(item) => match f(item) {
                        Ok(()) => {}
                        Err(err) if err.is_halt() => {
                            self.close();
                            return;
                        }
                        Err(err) => {
                            log::error!("consume handler failed: {err}");
                            return;
                        }
                    },
                    Err(err) => {
                        if !err.is_halt() {
                            log::error!("consume terminated by error: {err}");
                        }
                        return;
                    }
                }
            }
        });
    }
}

impl<T: 'static> Sender<T> {
    /// Feed *recver*'s items into this sender's pipe.
    ///
    /// For a plain sender this fuses the two pipes: the counterpart recver
    /// of this sender takes over *recver*'s middle (bringing its parked
    /// task along), the now-redundant middle is discarded, and both
    /// consumed ends detach without firing abandonment. Returns the tail
    /// recver of the resulting chain, following any downstream links so
    /// chained connects collapse into one linear graph.
    ///
    /// On a router sender (fan-in), the attach spawns a forwarding
    /// consumer instead and returns the router's own recver.
    ///
    /// # Panics
    ///
    /// Panics if the counterpart recver of this pipe has already been
    /// dropped — there is nothing left to rewire onto.
    pub fn connect(self, recver: Recver<T>) -> Recver<T> {
        if self.inner.middle().send_half.borrow().multi {
            return self.connect_fan_in(recver);
        }

        let m1 = recver.inner.middle();
        let m2 = self.inner.middle();
        let r2 = m2
            .recver_end
            .borrow()
            .upgrade()
            .expect("connect: counterpart recver was dropped");

        // r2 takes over m1's recver seat, parked waiters and all.
        {
            let mut from = m2.recv_half.borrow_mut();
            let mut to = m1.recv_half.borrow_mut();
            to.multi = from.multi;
            to.waiters = std::mem::take(&mut from.waiters);
        }
        *r2.middle.borrow_mut() = Rc::clone(&m1);
        *m1.recver_end.borrow_mut() = Rc::downgrade(&r2);

        // m2 is discarded; the consumed ends detach without abandonment.
        *m2.sender_end.borrow_mut() = std::rc::Weak::new();
        *m2.recver_end.borrow_mut() = std::rc::Weak::new();
        self.inner.detach();
        recver.inner.detach();

        Recver::from_inner(follow_downstream(r2))
    }

    /// Router attach: consume *recver* into this fan-in sender.
    fn connect_fan_in(&self, recver: Recver<T>) -> Recver<T> {
        let hub = self.inner.hub();
        let fan_in = self.clone();
        hub.spawn(async move {
            loop {
                match recver.recv().await {
                    Ok(item) => {
                        if fan_in.send(item).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        let out = self
            .inner
            .middle()
            .recver_end
            .borrow()
            .upgrade()
            .expect("connect: router recver was dropped");
        Recver::from_inner(out)
    }
}

/// Walk downstream links to the tail recver of a chain.
///
/// Links are installed where a primitive owns both sides of a junction
/// (the queue's internal bridge); a link whose target is gone ends the
/// walk.
fn follow_downstream<T: 'static>(start: Rc<EndInner<T>>) -> Rc<EndInner<T>> {
    let mut cur = start;
    loop {
        let next = cur.downstream.borrow().clone();
        let Some(link) = next else { break };
        let target = link.middle().recver_end.borrow().upgrade();
        match target {
            Some(tail) => cur = tail,
            None => break,
        }
    }
    cur
}

impl<S: 'static, R: 'static> Pair<S, R> {
    /// Splice a transform onto this pair's recver; see [`Recver::pipe`].
    ///
    /// Returns the pair rebuilt around the transform's output.
    pub fn pipe<U, F, Fut>(self, f: F) -> Pair<S, U>
    where
        U: 'static,
        F: FnOnce(Recver<R>, Sender<U>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        Pair {
            sender: self.sender,
            recver: self.recver.pipe(f),
        }
    }

    /// Map this pair's recver; see [`Recver::map`].
    pub fn map<U, F>(self, f: F) -> Pair<S, U>
    where
        U: 'static,
        F: FnMut(R) -> Result<U, Error> + 'static,
    {
        Pair {
            sender: self.sender,
            recver: self.recver.map(f),
        }
    }

    /// Consume this pair's recver; see [`Recver::consume`]. Returns the
    /// sender, the only end left to interact with.
    pub fn consume<F>(self, f: F) -> Sender<S>
    where
        F: FnMut(R) -> Result<(), Error> + 'static,
    {
        self.recver.consume(f);
        self.sender
    }

    /// Connect this pair's sender to *recver*; see [`Sender::connect`].
    ///
    /// Returns only the resulting tail recver, not a rebuilt pair.
    pub fn connect(self, recver: Recver<S>) -> Recver<S> {
        let Pair {
            sender,
            recver: own,
        } = self;
        let tail = sender.connect(recver);
        drop(own);
        tail
    }
}
