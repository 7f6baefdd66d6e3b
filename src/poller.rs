//! The socket poll set.
//!
//! One zero-timeout readiness poll per scheduler iteration; long sleeps are
//! driven by the timeout events coroutines register themselves. Each fd
//! keeps a FIFO of read waiters and a FIFO of write waiters; a ready
//! direction wakes one waiter, an error wakes both directions.
//!
//! mio delivers edge-triggered readiness, so interests are dropped as soon
//! as a direction has no waiters left; the next registration then re-arms
//! the edge (registering an already-ready fd reports it again).

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::{trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::list::{WaitList, Waiter};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

#[derive(Default)]
struct FdEntry {
    read_waiters: WaitList,
    write_waiters: WaitList,
    /// What the fd is currently registered for, if anything.
    interests: Option<Interest>,
}

impl FdEntry {
    fn wanted(&self) -> Option<Interest> {
        let mut wanted = None;
        if !self.read_waiters.is_empty() {
            wanted = Some(Interest::READABLE);
        }
        if !self.write_waiters.is_empty() {
            wanted = Some(match wanted {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        wanted
    }
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    fds: HashMap<RawFd, FdEntry>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            fds: HashMap::new(),
        })
    }

    pub fn add(&mut self, fd: RawFd, dir: Dir, w: Waiter) {
        let registry = self.poll.registry();
        let entry = self.fds.entry(fd).or_default();
        match dir {
            Dir::Read => entry.read_waiters.append(w),
            Dir::Write => entry.write_waiters.append(w),
        }
        let wanted = entry.wanted();
        if wanted == entry.interests {
            return;
        }
        let res = match (entry.interests, wanted) {
            (None, Some(i)) => registry.register(&mut SourceFd(&fd), Token(fd as usize), i),
            (Some(_), Some(i)) => registry.reregister(&mut SourceFd(&fd), Token(fd as usize), i),
            // `add` only ever widens the subscription.
            _ => Ok(()),
        };
        match res {
            Ok(()) => {
                trace!("fd {}: subscribed {:?}", fd, wanted);
                entry.interests = wanted;
            }
            Err(e) => warn!("fd {}: poll registration failed: {}", fd, e),
        }
    }

    pub fn del(&mut self, fd: RawFd, dir: Dir, w: Waiter) {
        let registry = self.poll.registry();
        let Some(entry) = self.fds.get_mut(&fd) else {
            return;
        };
        match dir {
            Dir::Read => entry.read_waiters.detach(w),
            Dir::Write => entry.write_waiters.detach(w),
        };
        let wanted = entry.wanted();
        if wanted != entry.interests {
            let res = match wanted {
                Some(i) => registry.reregister(&mut SourceFd(&fd), Token(fd as usize), i),
                None => registry.deregister(&mut SourceFd(&fd)),
            };
            if let Err(e) = res {
                // The fd may already be closed; epoll drops it by itself.
                trace!("fd {}: poll deregistration failed: {}", fd, e);
            }
            entry.interests = wanted;
        }
        if entry.read_waiters.is_empty() && entry.write_waiters.is_empty() {
            self.fds.remove(&fd);
        }
    }

    /// One non-blocking poll; detach and return the waiters to wake.
    pub fn collect_ready(&mut self) -> Vec<Waiter> {
        let mut woken = Vec::new();
        if self.fds.is_empty() {
            return woken;
        }
        if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("socket poll failed: {}", e);
            }
            return woken;
        }
        for ev in self.events.iter() {
            let fd = ev.token().0 as RawFd;
            let Some(entry) = self.fds.get_mut(&fd) else {
                continue;
            };
            let failed = ev.is_error();
            if failed {
                trace!("fd {}: error readiness", fd);
            }
            if ev.is_readable() || ev.is_read_closed() || failed {
                if let Some(w) = entry.read_waiters.detach_first() {
                    woken.push(w);
                }
            }
            if ev.is_writable() || ev.is_write_closed() || failed {
                if let Some(w) = entry.write_waiters.detach_first() {
                    woken.push(w);
                }
            }
        }
        woken
    }
}
