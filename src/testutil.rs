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

//! Test-only rendezvous between asynchronous callbacks and test threads.

use std::sync::{Arc, Mutex};

use crate::sync::Notification;
use crate::status;

struct Slot<T> {
    result: Mutex<Option<T>>,
    fired: Notification,
}

/// A one-shot result mailbox: hand [`AsyncResult::callback`] to an
/// asynchronous operation, then [`AsyncResult::wait`] for the value, or
/// use [`AsyncResult::get_result`] to transparently fall through when the
/// operation completed synchronously.
pub(crate) struct AsyncResult<T> {
    slot: Arc<Slot<T>>,
}

impl<T: Send + 'static> AsyncResult<T> {
    pub(crate) fn new() -> AsyncResult<T> {
        AsyncResult {
            slot: Arc::new(Slot {
                result: Mutex::new(None),
                fired: Notification::new(),
            }),
        }
    }

    pub(crate) fn callback(&self) -> Box<dyn FnOnce(T) + Send> {
        let slot = self.slot.clone();
        Box::new(move |value| {
            *slot.result.lock().unwrap() = Some(value);
            slot.fired.notify();
        })
    }

    pub(crate) fn wait(&self) -> T {
        self.slot.fired.wait_for_notification();
        self.slot.result.lock().unwrap().take().expect("callback stored a result")
    }

    pub(crate) fn has_fired(&self) -> bool { self.slot.fired.has_been_notified() }
}

impl<U: Send + 'static> AsyncResult<status::Result<U>> {
    /// `TryAgain` means "the callback will fire": wait for it. Anything
    /// else already is the final result.
    pub(crate) fn get_result(&self, sync: status::Result<U>) -> status::Result<U> {
        match sync {
            Err(err) if err.is_try_again() => self.wait(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::status::Error;

    #[test]
    fn synchronous_results_pass_through() {
        let result: AsyncResult<crate::Result<usize>> = AsyncResult::new();
        assert_eq!(result.get_result(Ok(3)).unwrap(), 3);
        assert!(!result.has_fired());
    }

    #[test]
    fn try_again_waits_for_the_callback() {
        let result: AsyncResult<crate::Result<usize>> = AsyncResult::new();
        let callback = result.callback();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            callback(Ok(7));
        });
        assert_eq!(result.get_result(Err(Error::try_again("pending"))).unwrap(), 7);
        assert!(result.has_fired());
    }
}
