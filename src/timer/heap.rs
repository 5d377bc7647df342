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

//! Binary min-heap of timers keyed by deadline, with the entry's position
//! stored on the entry for O(log n) removal.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::timer::TimerEntry;

const SHRINK_MIN_ELEMS: usize = 8;
const SHRINK_FULLNESS_FACTOR: usize = 2;

#[derive(Default)]
pub(crate) struct TimerHeap {
    timers: Vec<Arc<TimerEntry>>,
}

impl TimerHeap {
    pub(crate) fn new() -> TimerHeap { TimerHeap { timers: empty!() } }

    /// Returns true iff the new timer became the heap root.
    pub(crate) fn add(&mut self, timer: Arc<TimerEntry>) -> bool {
        timer.heap_index.store(self.timers.len(), Ordering::Relaxed);
        self.timers.push(timer.clone());
        self.adjust_upwards(self.timers.len() - 1);
        timer.heap_index.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn remove(&mut self, timer: &Arc<TimerEntry>) {
        let i = timer.heap_index.load(Ordering::Relaxed);
        debug_assert!(i < self.timers.len(), "timer not in this heap");
        debug_assert!(Arc::ptr_eq(&self.timers[i], timer), "stored heap index is stale");
        if i == self.timers.len() - 1 {
            self.timers.pop();
        } else {
            let last = self.timers.pop().expect("heap is non-empty");
            last.heap_index.store(i, Ordering::Relaxed);
            self.timers[i] = last;
            let parent = i.saturating_sub(1) / 2;
            if self.timers[parent].deadline > self.timers[i].deadline {
                self.adjust_upwards(i);
            } else {
                self.adjust_downwards(i);
            }
        }
        self.maybe_shrink();
    }

    pub(crate) fn top(&self) -> Option<&Arc<TimerEntry>> { self.timers.first() }

    pub(crate) fn pop(&mut self) {
        if let Some(top) = self.top().cloned() {
            self.remove(&top);
        }
    }

    pub(crate) fn len(&self) -> usize { self.timers.len() }

    pub(crate) fn is_empty(&self) -> bool { self.timers.is_empty() }

    fn adjust_upwards(&mut self, mut i: usize) {
        let timer = self.timers[i].clone();
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.timers[parent].deadline <= timer.deadline {
                break;
            }
            self.timers[i] = self.timers[parent].clone();
            self.timers[i].heap_index.store(i, Ordering::Relaxed);
            i = parent;
        }
        timer.heap_index.store(i, Ordering::Relaxed);
        self.timers[i] = timer;
    }

    fn adjust_downwards(&mut self, mut i: usize) {
        let timer = self.timers[i].clone();
        loop {
            let left = 2 * i + 1;
            if left >= self.timers.len() {
                break;
            }
            let right = left + 1;
            let next = if right < self.timers.len()
                && self.timers[left].deadline > self.timers[right].deadline
            {
                right
            } else {
                left
            };
            if timer.deadline <= self.timers[next].deadline {
                break;
            }
            self.timers[i] = self.timers[next].clone();
            self.timers[i].heap_index.store(i, Ordering::Relaxed);
            i = next;
        }
        timer.heap_index.store(i, Ordering::Relaxed);
        self.timers[i] = timer;
    }

    /// Gives memory back once the heap drops below a quarter of its
    /// capacity; small heaps are left alone.
    fn maybe_shrink(&mut self) {
        if self.timers.len() >= SHRINK_MIN_ELEMS
            && self.timers.len() <= self.timers.capacity() / SHRINK_FULLNESS_FACTOR / 2
        {
            self.timers.shrink_to(self.timers.len() * SHRINK_FULLNESS_FACTOR);
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, timer: &Arc<TimerEntry>) -> bool {
        self.timers.iter().any(|candidate| Arc::ptr_eq(candidate, timer))
    }

    #[cfg(test)]
    pub(crate) fn check_valid(&self) -> bool {
        for (i, timer) in self.timers.iter().enumerate() {
            if timer.heap_index.load(Ordering::Relaxed) != i {
                return false;
            }
            let left = 2 * i + 1;
            let right = left + 1;
            if left < self.timers.len() && timer.deadline > self.timers[left].deadline {
                return false;
            }
            if right < self.timers.len() && timer.deadline > self.timers[right].deadline {
                return false;
            }
        }
        true
    }
}
