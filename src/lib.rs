//! Single-threaded cooperative runtime: an event-loop hub plus typed
//! rendezvous primitives that compose into dataflow graphs.
//!
//! Tasks are plain futures spawned onto a [`Hub`]; they talk to each other
//! exclusively through pipes, channels, queues and their relatives, and
//! the hub decides what runs next. One OS thread, no preemption, FIFO
//! scheduling — a task runs until it awaits a runtime primitive.
//!
//! ```ignore
//! let hub = Hub::new()?;
//! let p = hub.pipe::<u32>();
//! let sender = p.sender.clone();
//! hub.spawn(async move {
//!     let _ = sender.send(1).await;
//! });
//! let got = hub.run_until(async move { p.recv().await })?;
//! assert_eq!(got?, 1);
//! ```

// Library modules
mod channel;
mod error;
mod hub;
mod pipe;
mod poller;
mod primitives;
mod signal;
mod timer;

// Re-export the public surface
pub use channel::Channel;
pub use error::Error;
pub use hub::Hub;
pub use pipe::{Fired, Pair, Recver, Sender, Watch};
pub use poller::Mask;
pub use primitives::broadcast::Broadcast;
pub use primitives::event::Event;
pub use primitives::gate::Gate;
pub use primitives::value::Value;
