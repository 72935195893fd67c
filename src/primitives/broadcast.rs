//! Broadcast: best-effort pub/sub fan-out.

use std::cell::RefCell;
use std::rc::Rc;

use crate::hub::Hub;
use crate::pipe::{Recver, Sender};

/// Fan an item out to every currently-ready subscriber.
///
/// No buffering: a subscriber that is not parked in `recv` at send time
/// misses the item. Subscribers are visited in subscription order, and a
/// subscriber whose pipe has halted is dropped from the set.
pub struct Broadcast<T: 'static> {
    hub: Hub,
    subscribers: Rc<RefCell<Vec<Sender<T>>>>,
}

impl<T: 'static> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Broadcast {
            hub: self.hub.clone(),
            subscribers: Rc::clone(&self.subscribers),
        }
    }
}

impl<T: 'static> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast")
            .field("subscribers", &self.subscribers.borrow().len())
            .finish()
    }
}

impl<T: Clone + 'static> Broadcast<T> {
    pub(crate) fn new(hub: &Hub) -> Broadcast<T> {
        Broadcast {
            hub: hub.clone(),
            subscribers: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Attach a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Recver<T> {
        let pair = self.hub.pipe();
        self.subscribers.borrow_mut().push(pair.sender);
        pair.recver
    }

    /// Deliver *item* to every ready subscriber, pruning halted ones.
    pub async fn send(&self, item: T) {
        let snapshot: Vec<Sender<T>> = self.subscribers.borrow().to_vec();
        let mut halted: Vec<Sender<T>> = Vec::new();
        for sub in &snapshot {
            if !sub.ready() {
                continue;
            }
            if let Err(err) = sub.send(item.clone()).await {
                if err.is_halt() {
                    halted.push(sub.clone());
                }
            }
        }
        if !halted.is_empty() {
            self.subscribers.borrow_mut().retain(|sub| {
                !halted
                    .iter()
                    .any(|dead| Rc::ptr_eq(&dead.inner, &sub.inner))
            });
        }
    }

    /// Feed every item arriving on *recver* into this broadcast.
    pub fn connect(&self, recver: Recver<T>) {
        let fan_out = self.clone();
        self.hub.spawn(async move {
            loop {
                match recver.recv().await {
                    Ok(item) => fan_out.send(item).await,
                    Err(_) => return,
                }
            }
        });
    }
}
