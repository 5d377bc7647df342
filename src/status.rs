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

//! Tagged error values returned by every fallible operation, plus the
//! errno-to-kind mapping used by the syscall wrappers.

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::result;

/// The closed set of error categories.
///
/// [`ErrorKind::TryAgain`] is not an application error: it is the promise
/// that the callback supplied alongside the operation will be invoked once
/// the operation becomes actionable.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(Debug)]
pub enum ErrorKind {
    Ok,
    Unknown,
    InvalidArg,
    NotFound,
    NotSupported,
    Corruption,
    IoError,
    TryAgain,
    Unimplemented,
    NoPermission,
    OutOfMemory,
    OutOfRange,
    InUse,
    Timeout,
    Internal,
}

/// An error kind with a human-readable message.
///
/// The textual form is `"<Kind>: <msg>"`, or `"<Kind>: <msg>: <msg2>"` when
/// a second message was supplied at construction.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

/// Crate-wide result alias.
pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error { kind, message: message.into() }
    }

    pub fn with_detail(
        kind: ErrorKind,
        message: impl Into<String>,
        detail: impl Display,
    ) -> Error {
        Error { kind, message: format!("{}: {}", message.into(), detail) }
    }

    pub fn unknown(message: impl Into<String>) -> Error { Error::new(ErrorKind::Unknown, message) }

    pub fn invalid_arg(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidArg, message)
    }

    pub fn not_found(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::NotSupported, message)
    }

    pub fn corruption(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Corruption, message)
    }

    pub fn io_error(message: impl Into<String>) -> Error { Error::new(ErrorKind::IoError, message) }

    pub fn try_again(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::TryAgain, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Unimplemented, message)
    }

    pub fn no_permission(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::NoPermission, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::OutOfMemory, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::OutOfRange, message)
    }

    pub fn in_use(message: impl Into<String>) -> Error { Error::new(ErrorKind::InUse, message) }

    pub fn timeout(message: impl Into<String>) -> Error { Error::new(ErrorKind::Timeout, message) }

    pub fn internal(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind { self.kind }

    pub fn message(&self) -> &str { &self.message }

    pub fn is_try_again(&self) -> bool { self.kind == ErrorKind::TryAgain }

    pub fn is_timeout(&self) -> bool { self.kind == ErrorKind::Timeout }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.kind == ErrorKind::Ok {
            f.write_str("OK")
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl error::Error for Error {}

pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn os_message(errno: i32) -> String { io::Error::from_raw_os_error(errno).to_string() }

/// Maps an errno value onto the error taxonomy. The IO family covers every
/// transport-level failure a socket can report; anything unlisted is
/// [`ErrorKind::Unknown`].
pub fn from_errno(errno: i32) -> Error {
    debug_assert_ne!(errno, 0);
    let kind = match errno {
        libc::EPERM => ErrorKind::NoPermission,
        libc::ENOENT
        | libc::EIO
        | libc::EBADFD
        | libc::EADDRNOTAVAIL
        | libc::ENETDOWN
        | libc::ENETUNREACH
        | libc::ENETRESET
        | libc::ECONNABORTED
        | libc::ECONNRESET
        | libc::ENOBUFS
        | libc::ECONNREFUSED
        | libc::EISCONN
        | libc::ENOTCONN
        | libc::ESHUTDOWN
        | libc::EHOSTDOWN
        | libc::EHOSTUNREACH => ErrorKind::IoError,
        libc::E2BIG | libc::EINVAL => ErrorKind::InvalidArg,
        // EWOULDBLOCK aliases EAGAIN on Linux
        libc::EAGAIN => ErrorKind::TryAgain,
        libc::ENOPROTOOPT | libc::EPFNOSUPPORT | libc::EAFNOSUPPORT => ErrorKind::Unimplemented,
        libc::EADDRINUSE => ErrorKind::InUse,
        libc::ETIMEDOUT => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    };
    Error::new(kind, os_message(errno))
}

/// `connect` refinement: an in-progress connect is a pending operation, not
/// a failure.
pub(crate) fn from_connect_errno(errno: i32) -> Error {
    match errno {
        libc::EINPROGRESS => Error::with_detail(ErrorKind::TryAgain, "connect pending", os_message(errno)),
        libc::EACCES => Error::with_detail(ErrorKind::NoPermission, "network access denied", os_message(errno)),
        libc::ETIMEDOUT => Error::with_detail(ErrorKind::Timeout, "connection timeout", os_message(errno)),
        _ => from_errno(errno),
    }
}

/// `accept` refinement: the peer hanging up between the queue enqueue and
/// our accept is retriable.
pub(crate) fn from_accept_errno(errno: i32) -> Error {
    match errno {
        libc::ECONNABORTED => Error::with_detail(ErrorKind::TryAgain, "accept pending", os_message(errno)),
        _ => from_errno(errno),
    }
}
