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

//! File-descriptor watchers and the scoped handles binding them to the
//! [`IoManager`](crate::IoManager).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::poller::IoType;
use crate::reactor::IoManager;
use crate::task::TaskHandle;

/// Receiver of readiness notifications for a watched descriptor.
///
/// Callbacks run on worker threads, one readiness task per controller at a
/// time. The manager holds the watcher weakly: once the implementing object
/// is dropped, no further callbacks are delivered.
pub trait IoWatcher: Send + Sync {
    fn on_readable(&self, fd: RawFd);
    fn on_writable(&self, fd: RawFd);
}

pub(crate) const UNBOUND_FD: RawFd = -1;

/// Registration state shared between a controller and the manager registry.
pub(crate) struct ControllerState {
    pub(crate) fd: AtomicI32,
    pub(crate) mode: Mutex<IoType>,
    pub(crate) watcher: Mutex<Option<Weak<dyn IoWatcher>>>,
    /// Most recent readiness task posted for this controller; the task
    /// `stop_watching` must cancel and wait for.
    pub(crate) task: Mutex<Option<TaskHandle>>,
}

impl ControllerState {
    pub(crate) fn reset(&self) {
        self.fd.store(UNBOUND_FD, Ordering::Release);
        *self.mode.lock().expect("controller mutex poisoned") = IoType::none();
        *self.watcher.lock().expect("controller mutex poisoned") = None;
        *self.task.lock().expect("controller mutex poisoned") = None;
    }
}

/// A scoped handle binding one watcher interest to one file descriptor.
///
/// The controller is typically embedded in the object issuing the watch. It
/// may be bound to at most one descriptor at a time; several controllers may
/// watch the same descriptor, each with its own interest subset. Dropping a
/// controller stops the watch, which is a no-op for already-torn state.
pub struct IoController {
    pub(crate) state: Arc<ControllerState>,
}

impl Default for IoController {
    fn default() -> Self { IoController::new() }
}

impl IoController {
    pub fn new() -> IoController {
        IoController {
            state: Arc::new(ControllerState {
                fd: AtomicI32::new(UNBOUND_FD),
                mode: Mutex::new(IoType::none()),
                watcher: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Unbinds this controller from its descriptor. Idempotent; returns
    /// true on success including the not-bound no-op.
    pub fn stop_watching(&self) -> bool { IoManager::get().stop_watching(self) }

    pub(crate) fn bound_fd(&self) -> RawFd { self.state.fd.load(Ordering::Acquire) }
}

impl Drop for IoController {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
