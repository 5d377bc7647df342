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

pub mod epoll;

use std::fmt::{self, Display, Formatter};
use std::ops;

pub use epoll::Poller;

/// I/O interests a descriptor can be watched for, and the readiness a poll
/// reports back.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether the I/O source has data to read.
    pub read: bool,
    /// Specifies whether the I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::BitOr for IoType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            read: self.read | rhs.read,
            write: self.write | rhs.write,
        }
    }
}

impl ops::BitAnd for IoType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self {
            read: self.read & rhs.read,
            write: self.write & rhs.write,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else {
            f.write_str("write")
        }
    }
}

/// One readiness notification: the opaque token supplied at registration
/// plus the ready directions.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct IoEvent {
    pub token: u64,
    pub ready: IoType,
}
