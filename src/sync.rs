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

//! One-shot cross-thread notification.

use std::sync::{Condvar, Mutex};

/// A latch which can be notified exactly once and waited on any number of
/// times. Used for task completion signalling and by tests to rendezvous
/// with callbacks.
#[derive(Debug, Default)]
pub struct Notification {
    notified: Mutex<bool>,
    completed: Condvar,
}

impl Notification {
    pub fn new() -> Notification { Notification::default() }

    pub fn notify(&self) {
        let mut notified = self.notified.lock().expect("notification mutex poisoned");
        debug_assert!(!*notified, "notification raised twice");
        *notified = true;
        self.completed.notify_all();
    }

    pub fn has_been_notified(&self) -> bool {
        *self.notified.lock().expect("notification mutex poisoned")
    }

    pub fn wait_for_notification(&self) {
        let mut notified = self.notified.lock().expect("notification mutex poisoned");
        while !*notified {
            notified = self.completed.wait(notified).expect("notification mutex poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn starts_unnotified() {
        let n = Notification::new();
        assert!(!n.has_been_notified());
    }

    #[test]
    fn notify_then_wait_returns_immediately() {
        let n = Notification::new();
        n.notify();
        assert!(n.has_been_notified());
        n.wait_for_notification();
    }

    #[test]
    fn wait_across_threads() {
        let n = Arc::new(Notification::new());
        let signaller = n.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.notify();
        });
        n.wait_for_notification();
        assert!(n.has_been_notified());
        handle.join().unwrap();
    }
}
