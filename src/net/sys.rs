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

//! Thin syscall wrappers mapping errno into the crate error taxonomy.
//!
//! Calls the original interfaces retry on `EINTR`; everything else is
//! reported to the caller. All sockets this crate creates are `SOCK_STREAM`.

use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use crate::net::addr::SockaddrStorage;
use crate::status::{self, Result};

/// Runs a syscall until it stops failing with `EINTR`.
macro_rules! retry_eintr {
    ($call:expr) => {{
        loop {
            let rc = $call;
            if rc != -1 || status::last_errno() != libc::EINTR {
                break rc;
            }
        }
    }};
}

pub(crate) fn socket(family: libc::c_int) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn bind(fd: RawFd, addr: &SockaddrStorage) -> Result<()> {
    if unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn connect(fd: RawFd, addr: &SockaddrStorage) -> Result<()> {
    if retry_eintr!(unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) }) == -1 {
        return Err(status::from_connect_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> Result<()> {
    if unsafe { libc::listen(fd, backlog) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn accept(fd: RawFd) -> Result<(OwnedFd, SockaddrStorage)> {
    let mut addr = SockaddrStorage::zeroed();
    let (ptr, len) = addr.as_mut_parts();
    let accepted = retry_eintr!(unsafe { libc::accept(fd, ptr, len) });
    if accepted == -1 {
        return Err(status::from_accept_errno(status::last_errno()));
    }
    Ok((unsafe { OwnedFd::from_raw_fd(accepted) }, addr))
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<usize> {
    let rc = retry_eintr!(unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) as isize
    });
    if rc == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(rc as usize)
}

pub(crate) fn shutdown(fd: RawFd, how: libc::c_int) -> Result<()> {
    if unsafe { libc::shutdown(fd, how) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn getsockname(fd: RawFd) -> Result<SockaddrStorage> {
    let mut addr = SockaddrStorage::zeroed();
    let (ptr, len) = addr.as_mut_parts();
    if unsafe { libc::getsockname(fd, ptr, len) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(addr)
}

pub(crate) fn getpeername(fd: RawFd) -> Result<SockaddrStorage> {
    let mut addr = SockaddrStorage::zeroed();
    let (ptr, len) = addr.as_mut_parts();
    if unsafe { libc::getpeername(fd, ptr, len) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(addr)
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: T) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn set_nodelay(fd: RawFd, enable: bool) -> Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
}

pub(crate) fn set_reuse_addr(fd: RawFd, enable: bool) -> Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable as libc::c_int)
}

/// Enables keep-alive probing with `delay` seconds both before the first
/// probe and between probes.
pub(crate) fn set_keep_alive(fd: RawFd, enable: bool, delay: libc::c_int) -> Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable as libc::c_int)?;
    setsockopt(fd, libc::SOL_TCP, libc::TCP_KEEPIDLE, delay)?;
    setsockopt(fd, libc::SOL_TCP, libc::TCP_KEEPINTVL, delay)
}

pub(crate) fn set_receive_buffer_size(fd: RawFd, size: libc::c_int) -> Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)
}

pub(crate) fn set_send_buffer_size(fd: RawFd, size: libc::c_int) -> Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size)
}

/// Reads and clears `SO_ERROR`; the way an asynchronous connect reports its
/// resolution.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    if err != 0 {
        return Err(status::from_connect_errno(err));
    }
    Ok(())
}

pub(crate) fn set_non_blocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn set_close_exec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    if flags & libc::FD_CLOEXEC != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(())
}

pub(crate) fn eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn eventfd_read(fd: RawFd) -> Result<u64> {
    let mut value = [0u8; 8];
    let n = read(fd, &mut value)?;
    debug_assert_eq!(n, value.len());
    Ok(u64::from_ne_bytes(value))
}

pub(crate) fn eventfd_write(fd: RawFd, value: u64) -> Result<()> {
    write(fd, &value.to_ne_bytes()).map(|_| ())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let rc = retry_eintr!(unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize
    });
    if rc == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(rc as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let rc = retry_eintr!(unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize
    });
    if rc == -1 {
        return Err(status::from_errno(status::last_errno()));
    }
    Ok(rc as usize)
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    fn eventfd_round_trip() {
        let efd = eventfd().unwrap();
        eventfd_write(efd.as_raw_fd(), 3).unwrap();
        eventfd_write(efd.as_raw_fd(), 4).unwrap();
        assert_eq!(eventfd_read(efd.as_raw_fd()).unwrap(), 7);
        // drained: the non-blocking eventfd now reports TryAgain
        assert!(eventfd_read(efd.as_raw_fd()).unwrap_err().is_try_again());
    }

    #[test]
    fn nonblocking_and_cloexec_are_idempotent() {
        let efd = eventfd().unwrap();
        set_non_blocking(efd.as_raw_fd()).unwrap();
        set_non_blocking(efd.as_raw_fd()).unwrap();
        set_close_exec(efd.as_raw_fd()).unwrap();
        set_close_exec(efd.as_raw_fd()).unwrap();
    }

    #[test]
    fn shutdown_of_an_unconnected_socket_reports_io_error() {
        let sock = socket(libc::AF_INET).unwrap();
        let err = shutdown(sock.as_raw_fd(), libc::SHUT_WR).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IoError);
    }

    #[test]
    fn socket_options_apply() {
        let sock = socket(libc::AF_INET).unwrap();
        let fd = sock.as_raw_fd();
        set_nodelay(fd, true).unwrap();
        set_reuse_addr(fd, true).unwrap();
        set_keep_alive(fd, true, 30).unwrap();
        set_receive_buffer_size(fd, 64 * 1024).unwrap();
        set_send_buffer_size(fd, 64 * 1024).unwrap();
        assert!(take_socket_error(fd).is_ok());
    }
}
