// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
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

//! Edge-triggered epoll wrapper.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::poller::{IoEvent, IoType};
use crate::status::{self, Error, Result};
use crate::time::{Delta, Time};

/// Blocking demultiplexer over a fixed-size event batch.
///
/// All registrations are edge-triggered (`EPOLLET`): a watcher is notified
/// once per level transition and is expected to fully drain the readable or
/// writable state before coming back to the poller.
pub struct Poller {
    epoll_fd: OwnedFd,
    max_poll_size: usize,
}

impl Poller {
    pub fn new(max_poll_size: usize) -> Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(status::from_errno(status::last_errno()));
        }
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Poller { epoll_fd, max_poll_size })
    }

    /// Registers `fd` with the given interest mask and opaque token.
    /// Registering the same descriptor twice is an error.
    pub fn add(&self, fd: RawFd, mode: IoType, token: u64) -> Result<()> {
        self.control(libc::EPOLL_CTL_ADD, fd, mode, token)
    }

    /// Replaces the interest mask and token of an existing registration.
    pub fn update(&self, fd: RawFd, mode: IoType, token: u64) -> Result<()> {
        self.control(libc::EPOLL_CTL_MOD, fd, mode, token)
    }

    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.control(libc::EPOLL_CTL_DEL, fd, IoType::none(), 0)
    }

    /// Blocks up to `timeout` (infinite blocks indefinitely) and fills
    /// `events` with the ready descriptors. Returns a `Timeout` error when
    /// nothing became ready; `EINTR` is retried with the elapsed time
    /// deducted from the remaining timeout.
    pub fn poll(&self, timeout: Delta, events: &mut Vec<IoEvent>) -> Result<()> {
        events.clear();
        let mut remaining = timeout;
        let mut batch =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.max_poll_size];
        let ready = loop {
            let timeout_ms: libc::c_int = if remaining.is_infinite() {
                -1
            } else {
                remaining.to_millis().clamp(0, libc::c_int::MAX as i64) as libc::c_int
            };
            let start = Time::now();
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.as_raw_fd(),
                    batch.as_mut_ptr(),
                    self.max_poll_size as libc::c_int,
                    timeout_ms,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let errno = status::last_errno();
            if errno != libc::EINTR {
                return Err(status::from_errno(errno));
            }
            if !remaining.is_infinite() {
                let waited = Time::now() - start;
                if waited >= remaining {
                    return Err(Error::timeout("epoll_wait timeout"));
                }
                remaining = remaining - waited;
            }
        };
        if ready == 0 {
            return Err(Error::timeout("epoll_wait timeout"));
        }

        for raw in &batch[..ready] {
            let bits = raw.events as libc::c_int;
            let exceptional = libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLPRI;
            let ready = IoType {
                read: bits & (libc::EPOLLIN | exceptional) != 0,
                write: bits & (libc::EPOLLOUT | exceptional) != 0,
            };
            if !ready.is_none() {
                events.push(IoEvent { token: raw.u64, ready });
            }
        }
        Ok(())
    }

    fn control(&self, op: libc::c_int, fd: RawFd, mode: IoType, token: u64) -> Result<()> {
        let mut bits = libc::EPOLLET;
        if mode.read {
            bits |= libc::EPOLLIN;
        }
        if mode.write {
            bits |= libc::EPOLLOUT;
        }
        let mut event = libc::epoll_event { events: bits as u32, u64: token };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } == -1 {
            return Err(status::from_errno(status::last_errno()));
        }
        Ok(())
    }
}
