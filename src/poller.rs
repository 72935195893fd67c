//! Readiness multiplexer over epoll.
//!
//! The hub registers raw file descriptors here and the main loop blocks in
//! [`Poller::wait`] between scheduling rounds. Readiness is reported as
//! `(fd, Mask)` tuples which the hub forwards onto per-fd delivery channels.
//!
//! The wrapper is deliberately thin: interest masks are a newtype over the
//! epoll bits the runtime actually uses (readable, hangup, error), and the
//! wait call owns the retry-on-`EINTR` loop so callers never see spurious
//! signal wakeups.

use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Interest and event mask for a registered file descriptor.
///
/// A thin newtype over the epoll bits. Combine with `|`:
///
/// ```ignore
/// let events = hub.register(fd, Mask::READABLE | Mask::HUP | Mask::ERR)?;
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Mask(u32);

impl Mask {
    /// The descriptor is readable (`EPOLLIN`).
    pub const READABLE: Mask = Mask(libc::EPOLLIN as u32);
    /// The peer hung up (`EPOLLHUP`).
    pub const HUP: Mask = Mask(libc::EPOLLHUP as u32);
    /// An error condition is pending (`EPOLLERR`).
    pub const ERR: Mask = Mask(libc::EPOLLERR as u32);

    /// True if every bit of *other* is set in `self`.
    pub fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of *other* is set in `self`.
    pub fn intersects(self, other: Mask) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw epoll bits.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

/// How many readiness events a single wait round can surface.
const WAIT_BATCH: usize = 64;

/// Wrapper around an epoll instance.
pub(crate) struct Poller {
    epfd: RawFd,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("epfd", &self.epfd).finish()
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        // SAFETY: epoll_create1 takes no pointers; the returned fd is owned
        // by this struct and closed on drop.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    /// Start watching *fd* for the interest bits in *mask*.
    pub(crate) fn add(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask.0,
            u64: fd as u64,
        };
        // SAFETY: event points at a live epoll_event for the duration of
        // the call; the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stop watching *fd*.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: EPOLL_CTL_DEL ignores the event argument on modern
        // kernels; passing null is the documented form.
        let rc =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until readiness fires or *timeout* elapses.
    ///
    /// `None` blocks indefinitely. Returns the ready `(fd, events)` pairs;
    /// an empty result means the timeout elapsed. Interrupted waits
    /// (`EINTR`) are retried internally.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Mask)>> {
        let ms: i32 = match timeout {
            None => -1,
            // Round up so a sub-millisecond deadline still sleeps instead
            // of spinning.
            Some(d) => {
                let ms = d.as_secs() * 1_000 + u64::from(d.subsec_nanos().div_ceil(1_000_000));
                ms.min(i32::MAX as u64) as i32
            }
        };

        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; WAIT_BATCH];
        loop {
            // SAFETY: buf is a live array of WAIT_BATCH epoll_events; the
            // kernel writes at most that many entries.
            let n = unsafe {
                libc::epoll_wait(self.epfd, buf.as_mut_ptr(), WAIT_BATCH as i32, ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let events = buf[..n as usize]
                .iter()
                .map(|ev| (ev.u64 as RawFd, Mask(ev.events)))
                .collect();
            return Ok(events);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: epfd is a valid fd owned by this struct.
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_combination() {
        let mask = Mask::READABLE | Mask::HUP;
        assert!(mask.contains(Mask::READABLE));
        assert!(mask.contains(Mask::HUP));
        assert!(!mask.contains(Mask::ERR));
        assert!(mask.intersects(Mask::READABLE | Mask::ERR));
        assert!(!mask.intersects(Mask::ERR));
    }

    #[test]
    fn wait_times_out_with_no_registrations() {
        let poller = Poller::new().expect("epoll_create");
        let events = poller
            .wait(Some(Duration::from_millis(1)))
            .expect("epoll_wait");
        assert!(events.is_empty());
    }
}
