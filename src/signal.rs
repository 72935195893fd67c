//! Signal ingestion: OS signals as channel items.
//!
//! Each subscribed signal gets its own self-pipe: the write end is handed
//! to a signal-safe handler (which writes one byte per delivery), the
//! read end registers with the hub's multiplexer, and a hub task drains
//! the bytes and fans the signal number out to every subscribed channel.
//! Everything interesting therefore happens on the loop thread; the
//! handler itself does nothing but write.
//!
//! When a signal loses its last subscriber the handler is unregistered
//! and the self-pipe is torn down.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use signal_hook::SigId;

use crate::channel::Channel;
use crate::error::Error;
use crate::hub::Hub;
use crate::poller::Mask;

/// Signal routing state hung off the hub.
pub(crate) struct Signal {
    entries: HashMap<i32, SigEntry>,
    subs: Vec<Sub>,
}

struct SigEntry {
    read_fd: RawFd,
    write_fd: RawFd,
    sig_id: SigId,
}

struct Sub {
    ch: Channel<i32>,
    signals: Vec<i32>,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("signals", &self.entries.keys().collect::<Vec<_>>())
            .field("subscribers", &self.subs.len())
            .finish()
    }
}

impl Signal {
    pub(crate) fn new() -> Signal {
        Signal {
            entries: HashMap::new(),
            subs: Vec::new(),
        }
    }

    /// Subscribe a fresh channel to *signals*, installing handlers for
    /// any signal not yet routed.
    pub(crate) fn subscribe(hub: &Hub, signals: &[i32]) -> Result<Channel<i32>, Error> {
        for &sig in signals {
            let installed = hub.with_signal(|state| state.entries.contains_key(&sig));
            if !installed {
                Signal::start(hub, sig)?;
            }
        }
        let out = hub.channel::<i32>();
        hub.with_signal(|state| {
            state.subs.push(Sub {
                ch: out.clone(),
                signals: signals.to_vec(),
            });
        });
        Ok(out)
    }

    /// Remove a subscription; tear down routing for orphaned signals.
    pub(crate) fn unsubscribe(hub: &Hub, ch: &Channel<i32>) {
        let removed = hub.with_signal(|state| {
            let position = state.subs.iter().position(|sub| sub.ch.same(ch));
            position.map(|i| state.subs.remove(i))
        });
        let Some(sub) = removed else { return };
        for sig in sub.signals {
            let orphaned = hub.with_signal(|state| {
                !state
                    .subs
                    .iter()
                    .any(|other| other.signals.contains(&sig))
            });
            if orphaned {
                Signal::stop(hub, sig);
            }
        }
    }

    /// Install the self-pipe and handler for one signal and spawn its
    /// reader task.
    fn start(hub: &Hub, sig: i32) -> Result<(), Error> {
        let (read_fd, write_fd) = self_pipe()?;
        let sig_id = match signal_hook::low_level::pipe::register_raw(sig, write_fd) {
            Ok(id) => id,
            Err(err) => {
                close_fds(read_fd, write_fd);
                return Err(Error::Io(err));
            }
        };
        let ready = match hub.register(read_fd, Mask::READABLE) {
            Ok(ch) => ch,
            Err(err) => {
                signal_hook::low_level::unregister(sig_id);
                close_fds(read_fd, write_fd);
                return Err(err);
            }
        };
        hub.with_signal(|state| {
            state.entries.insert(
                sig,
                SigEntry {
                    read_fd,
                    write_fd,
                    sig_id,
                },
            );
        });

        let task_hub = hub.clone();
        hub.spawn(async move {
            reader(task_hub, sig, ready).await;
        });
        Ok(())
    }

    /// Tear down routing for one signal. Idempotent.
    fn stop(hub: &Hub, sig: i32) {
        let entry = hub.with_signal(|state| state.entries.remove(&sig));
        let Some(entry) = entry else { return };
        signal_hook::low_level::unregister(entry.sig_id);
        let _ = hub.unregister(entry.read_fd);
        close_fds(entry.read_fd, entry.write_fd);
    }
}

/// Drain the self-pipe and fan deliveries out to subscribers.
async fn reader(hub: Hub, sig: i32, ready: Channel<(RawFd, Mask)>) {
    loop {
        match ready.recv().await {
            Ok((fd, _events)) => {
                let count = drain(fd);
                if count == 0 {
                    continue;
                }
                let targets: Vec<Channel<i32>> = hub.with_signal(|state| {
                    state
                        .subs
                        .iter()
                        .filter(|sub| sub.signals.contains(&sig))
                        .map(|sub| sub.ch.clone())
                        .collect()
                });
                for _ in 0..count {
                    for ch in &targets {
                        let _ = ch.send(sig);
                    }
                }
            }
            // Closed on unsubscribe teardown, Stop on hub shutdown;
            // either way this signal's routing is done.
            Err(_) => {
                Signal::stop(&hub, sig);
                return;
            }
        }
    }
}

/// Count the bytes pending on the self-pipe, one per signal delivery.
fn drain(fd: RawFd) -> usize {
    let mut total = 0;
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: buf is a live 64-byte buffer; read writes at most that.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            total += n as usize;
            continue;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
        }
        return total;
    }
}

/// A non-blocking close-on-exec pipe.
fn self_pipe() -> Result<(RawFd, RawFd), Error> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: fds is a live two-element array for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

fn close_fds(read_fd: RawFd, write_fd: RawFd) {
    // SAFETY: both fds were returned by pipe2 and are owned here.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
