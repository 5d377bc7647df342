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

//! Callback-driven I/O multiplexer for Linux: many TCP connections and
//! timers on a small, fixed set of threads.
//!
//! Three tightly-coupled pieces form the scheduler substrate:
//!
//! - [`IoManager`]: an edge-triggered epoll loop on its own thread which
//!   demultiplexes descriptor readiness into per-watcher callbacks;
//! - [`TaskRunner`]: a fixed worker pool executing those callbacks (and
//!   anything else posted to it) with per-task cancellation;
//! - [`TimerManager`]: a sharded delay queue firing closures at or after
//!   their deadlines and driving the poll loop's blocking timeout.
//!
//! On top of them, [`net::TcpClient`] and [`net::TcpServer`] translate
//! non-blocking socket syscalls plus readiness notifications into the
//! callback contract: every operation either completes synchronously or
//! returns [`ErrorKind::TryAgain`], which is not an error but the promise
//! that the supplied callback will be invoked exactly once when the
//! operation has resolved.
//!
//! All three managers are process-wide singletons constructed on first
//! use; user code typically touches them only through [`IoController`],
//! [`TimerController`] and the `net` types.

#[macro_use]
extern crate amplify;

mod buffer;
pub mod net;
pub mod poller;
mod reactor;
mod status;
mod sync;
mod task;
#[cfg(test)]
mod testutil;
mod time;
pub mod timer;
mod watcher;

pub use buffer::{Buffer, DrainableBuffer, GrowableBuffer};
pub use reactor::IoManager;
pub use status::{from_errno, Error, ErrorKind, Result};
pub use sync::Notification;
pub use task::{Closure, TaskHandle, TaskRunner};
pub use time::{Delta, Time, WallTime};
pub use timer::{TimerController, TimerManager};
pub use watcher::{IoController, IoWatcher};
