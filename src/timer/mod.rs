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

//! Delayed one-shot closures and the scoped controllers owning them.

mod heap;
mod manager;
mod stats;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub use manager::TimerManager;

use crate::task::{Closure, TaskHandle};
use crate::time::{Delta, Time};

/// Sentinel for "not stored in the urgent heap": the timer sits in its
/// shard's overflow list (or nowhere at all).
pub(crate) const INVALID_INDEX: usize = usize::MAX;

/// One scheduled deadline. An entry is created per `start` call and owned by
/// the shard structures plus the controller; the back-edge to the controller
/// is weak, so a dropped controller never keeps itself alive through its own
/// closure.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Time,
    pub(crate) pending: AtomicBool,
    pub(crate) heap_index: AtomicUsize,
    pub(crate) list_index: AtomicUsize,
    pub(crate) closure: Mutex<Option<Closure>>,
    pub(crate) controller: Weak<ControllerCore>,
}

impl TimerEntry {
    fn new(deadline: Time, closure: Closure, controller: Weak<ControllerCore>) -> Arc<TimerEntry> {
        Arc::new(TimerEntry {
            deadline,
            pending: AtomicBool::new(true),
            heap_index: AtomicUsize::new(INVALID_INDEX),
            list_index: AtomicUsize::new(INVALID_INDEX),
            closure: Mutex::new(Some(closure)),
            controller,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(deadline: Time) -> Arc<TimerEntry> {
        TimerEntry::new(deadline, Box::new(|| {}), Weak::new())
    }
}

pub(crate) struct ControllerCore {
    /// The entry of the most recent `start`.
    pub(crate) timer: Mutex<Option<Arc<TimerEntry>>>,
    /// Handle of the task posted when the timer fired, until completion or
    /// cancellation.
    pub(crate) scheduled: Mutex<Option<TaskHandle>>,
}

/// Scoped handle for one timer: starting schedules a closure after a delay
/// on the process-wide [`TimerManager`], cancelling guarantees the closure
/// will not run (and reaps a fired-but-unfinished task). Dropping the
/// controller cancels.
pub struct TimerController {
    pub(crate) core: Arc<ControllerCore>,
}

impl Default for TimerController {
    fn default() -> Self { TimerController::new() }
}

impl TimerController {
    pub fn new() -> TimerController {
        TimerController {
            core: Arc::new(ControllerCore {
                timer: Mutex::new(None),
                scheduled: Mutex::new(None),
            }),
        }
    }

    /// Schedules `closure` to run at or after `delay` from now. Starting
    /// while a previous start is still pending is a programming bug.
    pub fn start(&self, delay: Delta, closure: impl FnOnce() + Send + 'static) {
        TimerManager::get().start(delay, Box::new(closure), self);
    }

    /// Cancels the pending timer, if any. Idempotent, and commutes with
    /// firing: whichever happens first wins.
    pub fn cancel(&self) { TimerManager::get().cancel(self); }

    /// Deadline of the most recently started timer.
    pub fn deadline(&self) -> Option<Time> {
        self.core.timer.lock().expect("timer mutex poisoned").as_ref().map(|t| t.deadline)
    }

    /// Whether the timer is scheduled and has neither fired nor been
    /// cancelled.
    pub fn is_pending(&self) -> bool {
        self.core
            .timer
            .lock()
            .expect("timer mutex poisoned")
            .as_ref()
            .map(|t| t.pending.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn has_scheduled_task(&self) -> bool {
        self.core.scheduled.lock().expect("timer mutex poisoned").is_some()
    }
}

impl Drop for TimerController {
    fn drop(&mut self) {
        self.cancel();
    }
}
