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

//! The process-wide I/O manager: an edge-triggered poll loop on a dedicated
//! thread, demultiplexing descriptor readiness into per-watcher tasks.

use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use crate::net::sys;
use crate::poller::{IoEvent, IoType, Poller};
use crate::task::{TaskHandle, TaskRunner};
use crate::time::Delta;
use crate::timer::TimerManager;
use crate::watcher::{ControllerState, IoController, IoWatcher, UNBOUND_FD};

/// Upper bound on events returned by one poll.
const MAX_POLL_EVENTS: usize = 100;

/// One watched descriptor: the union of all controller interests plus the
/// controllers themselves.
struct FdEntry {
    mode: IoType,
    controllers: Vec<Arc<ControllerState>>,
}

impl FdEntry {
    fn new() -> FdEntry {
        FdEntry {
            mode: IoType::none(),
            controllers: empty!(),
        }
    }
}

struct Inner {
    poller: Poller,
    registry: Mutex<BTreeMap<RawFd, FdEntry>>,
    wakeup_fd: OwnedFd,
    stopped: AtomicBool,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide registry of descriptor watchers and owner of the polling
/// thread. Constructed on first use via [`IoManager::get`].
pub struct IoManager {
    inner: Arc<Inner>,
    // Keeps the waker registration alive for the life of the manager.
    _wakeup_watcher: Arc<WakeupWatcher>,
    _wakeup_controller: IoController,
}

/// Drains the wakeup eventfd when the controller pokes the poll loop.
struct WakeupWatcher;

impl IoWatcher for WakeupWatcher {
    fn on_readable(&self, fd: RawFd) {
        while sys::eventfd_read(fd).is_ok() {}
    }

    fn on_writable(&self, _fd: RawFd) {
        debug_assert!(false, "wakeup descriptor is never watched for write");
    }
}

static IOMGR: OnceLock<IoManager> = OnceLock::new();

impl IoManager {
    pub fn get() -> &'static IoManager { IOMGR.get_or_init(IoManager::new) }

    fn new() -> IoManager {
        let poller = Poller::new(MAX_POLL_EVENTS).expect("failed to create epoll instance");
        let wakeup_fd = sys::eventfd().expect("failed to create wakeup eventfd");
        let inner = Arc::new(Inner {
            poller,
            registry: Mutex::new(empty!()),
            wakeup_fd,
            stopped: AtomicBool::new(false),
            poll_thread: Mutex::new(None),
        });

        let wakeup_watcher = Arc::new(WakeupWatcher);
        let wakeup_controller = IoController::new();
        let manager = IoManager {
            inner,
            _wakeup_watcher: wakeup_watcher.clone(),
            _wakeup_controller: wakeup_controller,
        };
        let bound = manager.watch(
            manager.inner.wakeup_fd.as_raw_fd(),
            IoType::read_only(),
            Arc::downgrade(&wakeup_watcher) as Weak<dyn IoWatcher>,
            &manager._wakeup_controller,
        );
        debug_assert!(bound, "failed to watch the wakeup descriptor");

        let run_inner = manager.inner.clone();
        let handle = thread::Builder::new()
            .name("iomux-poll".into())
            .spawn(move || Inner::run(&run_inner))
            .expect("failed to spawn the polling thread");
        *manager.inner.poll_thread.lock().expect("io manager mutex poisoned") = Some(handle);
        manager
    }

    /// Registers `controller` to receive `mode` readiness for `fd` on
    /// `watcher`. Returns false when the controller is already bound to a
    /// different descriptor or the poller rejects the registration. An
    /// existing binding of the same controller is replaced.
    pub fn watch(
        &self,
        fd: RawFd,
        mode: IoType,
        watcher: Weak<dyn IoWatcher>,
        controller: &IoController,
    ) -> bool {
        debug_assert!(fd >= 0);
        debug_assert!(!mode.is_none());

        let bound = controller.bound_fd();
        if bound != UNBOUND_FD && bound != fd {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Controller already bound to fd {bound}, not {fd}");
            return false;
        }
        // Replace a previous binding of this controller, if any.
        self.stop_watching(controller);

        let state = &controller.state;
        let mut registry = self.inner.registry.lock().expect("io manager mutex poisoned");
        let entry = registry.entry(fd).or_insert_with(FdEntry::new);
        let result = if entry.mode.is_none() {
            self.inner.poller.add(fd, mode, fd as u64)
        } else {
            self.inner.poller.update(fd, entry.mode | mode, fd as u64)
        };
        if let Err(_err) = result {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Failed to register fd {fd} with the poller: {_err}");
            if entry.controllers.is_empty() {
                registry.remove(&fd);
            }
            return false;
        }

        state.fd.store(fd, Ordering::Release);
        *state.mode.lock().expect("controller mutex poisoned") = mode;
        *state.watcher.lock().expect("controller mutex poisoned") = Some(watcher);
        entry.mode = entry.mode | mode;
        entry.controllers.push(state.clone());

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Watching fd {fd} for {mode}");
        true
    }

    /// Unbinds `controller` from its descriptor: removes it from the fd
    /// record, recomputes the aggregated interest, updates or removes the
    /// poller registration, and cancels the controller's outstanding
    /// readiness task, waiting for it unless called from the task's own
    /// worker thread. Idempotent.
    pub fn stop_watching(&self, controller: &IoController) -> bool {
        let state = &controller.state;
        let task = {
            let mut registry = self.inner.registry.lock().expect("io manager mutex poisoned");
            let fd = state.fd.load(Ordering::Acquire);
            let task: Option<TaskHandle> =
                state.task.lock().expect("controller mutex poisoned").take();
            if fd == UNBOUND_FD {
                return true;
            }
            if let Some(task) = &task {
                task.cancel();
            }

            let Some(entry) = registry.get_mut(&fd) else {
                debug_assert!(false, "controller bound to an untracked fd");
                return true;
            };
            entry.controllers.retain(|candidate| !Arc::ptr_eq(candidate, state));
            let mut aggregated = IoType::none();
            for remaining in &entry.controllers {
                aggregated =
                    aggregated | *remaining.mode.lock().expect("controller mutex poisoned");
            }
            entry.mode = aggregated;
            let result = if aggregated.is_none() {
                registry.remove(&fd);
                self.inner.poller.remove(fd)
            } else {
                self.inner.poller.update(fd, aggregated, fd as u64)
            };
            if let Err(_err) = result {
                #[cfg(feature = "log")]
                log::error!(target: "reactor", "Failed to deregister fd {fd}: {_err}");
                return false;
            }
            state.reset();
            task
        };
        // Wait outside the registry lock so the running task can finish.
        if let Some(task) = task {
            task.wait_if_running();
        }
        true
    }

    /// Pokes the poll loop out of its current wait; used by the timer
    /// manager when the next deadline shrinks.
    pub fn wakeup(&self) {
        if let Err(_err) = sys::eventfd_write(self.inner.wakeup_fd.as_raw_fd(), 1) {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Failed to wake the poll loop: {_err}");
        }
    }

    /// Stops the polling thread. Watches left behind stay registered but no
    /// further readiness is delivered; intended for process teardown.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.wakeup();
        let handle = self.inner.poll_thread.lock().expect("io manager mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn run(inner: &Arc<Inner>) {
        let mut events: Vec<IoEvent> = Vec::with_capacity(MAX_POLL_EVENTS);
        loop {
            let mut timeout = TimerManager::get().check();
            if !timeout.is_infinite() {
                if timeout < Delta::zero() {
                    timeout = Delta::zero();
                } else if timeout < Delta::from_millis(1) {
                    // epoll_wait rounds down to milliseconds; a shorter
                    // wait would spin.
                    timeout = Delta::from_millis(1);
                }
            }

            match inner.poller.poll(timeout, &mut events) {
                Ok(()) => {}
                Err(err) if err.is_timeout() => {}
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Poll failed, stopping: {_err}");
                    return;
                }
            }

            let runner = TaskRunner::get();
            for event in &events {
                let fd = event.token as RawFd;
                let registry = inner.registry.lock().expect("io manager mutex poisoned");
                let Some(entry) = registry.get(&fd) else {
                    continue;
                };
                for state in &entry.controllers {
                    let interest =
                        *state.mode.lock().expect("controller mutex poisoned") & event.ready;
                    if interest.is_none() {
                        continue;
                    }
                    let watcher = state
                        .watcher
                        .lock()
                        .expect("controller mutex poisoned")
                        .as_ref()
                        .and_then(Weak::upgrade);
                    let Some(watcher) = watcher else {
                        continue;
                    };
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Dispatching {interest} for fd {fd}");
                    let task = runner.post(Box::new(move || handle_io(fd, &*watcher, interest)));
                    *state.task.lock().expect("controller mutex poisoned") = Some(task);
                }
            }

            if inner.stopped.load(Ordering::Acquire) {
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Poll loop stopped");
                return;
            }
        }
    }
}

/// Runs on a worker thread: write side first, then read, matching the order
/// a connect completion wants.
fn handle_io(fd: RawFd, watcher: &dyn IoWatcher, ready: IoType) {
    debug_assert!(fd >= 0);
    debug_assert!(!ready.is_none());

    if ready.write {
        watcher.on_writable(fd);
    }
    if ready.read {
        watcher.on_readable(fd);
    }
}
