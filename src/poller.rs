// Event-driven file descriptor I/O with lock-free SPSC stream buffers.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Edge-triggered readiness polling.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::RawFd;

pub(crate) const EV_READ: u32 = libc::EPOLLIN as u32;
pub(crate) const EV_WRITE: u32 = libc::EPOLLOUT as u32;
pub(crate) const EV_ERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EV_HUP: u32 = libc::EPOLLHUP as u32;
const EV_EDGE: u32 = libc::EPOLLET as u32;

/// All event bits a device handler can be dispatched for.
pub(crate) const EV_ALL: u32 = EV_READ | EV_WRITE | EV_ERR | EV_HUP;

/// Readiness interest of one registered fd: which of the two directions
/// the device currently wants events for. Derived from the device's
/// active flags on every registration update.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    fn events(self) -> u32 {
        let mut events = EV_EDGE;
        if self.read {
            events |= EV_READ;
        }
        if self.write {
            events |= EV_WRITE;
        }
        events
    }
}

impl Display for Interest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("read-write"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Thin wrapper around an epoll instance in edge-triggered mode.
///
/// Every registration stores an opaque cookie (a device pointer) which
/// comes back verbatim with each event. All methods are safe to call from
/// any thread; the kernel serializes interest-set updates.
pub(crate) struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epoll_fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, cookie: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.events(),
            u64: cookie,
        };
        let res = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, interest: Interest, cookie: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, cookie)
    }

    /// Update the interest set. Also used to re-arm a registration:
    /// a modification makes the kernel re-evaluate readiness and deliver a
    /// fresh edge when it is still pending.
    pub(crate) fn modify(&self, fd: RawFd, interest: Interest, cookie: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, cookie)
    }

    pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
        let res =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until events arrive, with `sigmask` installed for the
    /// duration of the wait (the wakeup signal must be unblocked there and
    /// only there).
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        sigmask: &libc::sigset_t,
    ) -> io::Result<usize> {
        let nfds = unsafe {
            libc::epoll_pwait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                -1,
                sigmask,
            )
        };
        if nfds == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(nfds as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_event_mapping() {
        let both = Interest {
            read: true,
            write: true,
        };
        assert_eq!(both.events(), EV_READ | EV_WRITE | EV_EDGE);
        assert_eq!(both.to_string(), "read-write");
        let idle = Interest {
            read: false,
            write: false,
        };
        assert_eq!(idle.events(), EV_EDGE, "an idle registration stays armed");
        assert_eq!(idle.to_string(), "none");
    }

    #[test]
    fn poller_register_and_wake() {
        let poller = Poller::new().expect("epoll instance");
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        let read_only = Interest {
            read: true,
            write: false,
        };
        poller.add(rd, read_only, 0xC0FFEE).expect("register");

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) }, 1);
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let mut empty: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe { libc::sigemptyset(&mut empty) };
        let n = poller.wait(&mut events, &empty).expect("wait");
        assert_eq!(n, 1);
        let ev0_u64 = events[0].u64;
        let ev0_events = events[0].events;
        assert_eq!(ev0_u64, 0xC0FFEE);
        assert_ne!(ev0_events & EV_READ, 0);

        poller.remove(rd).expect("unregister");
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
