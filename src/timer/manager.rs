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

//! Sharded delay queue firing closures at or after their deadlines.
//!
//! Each shard keeps an *urgent heap* of timers due before the shard's
//! rolling `heap_capacity` and an unordered overflow list for everything
//! later, which keeps the heap small while the capacity window, derived
//! from averaged delay statistics, amortises the refill work. A shard
//! priority queue ordered by per-shard minimum deadline drives the poll
//! loop's blocking timeout.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use crate::reactor::IoManager;
use crate::task::{Closure, TaskRunner};
use crate::time::{Delta, Time};
use crate::timer::heap::TimerHeap;
use crate::timer::stats::AveragedStats;
use crate::timer::{TimerController, TimerEntry, INVALID_INDEX};

/// Power of two.
const NUM_SHARDS: usize = 8;

/// Scales the averaged delay into the heap-capacity window.
const ADD_DEADLINE_SCALE: f64 = 0.33;
/// Window bounds, in seconds.
const MIN_QUEUE_WINDOW: f64 = 0.01;
const MAX_QUEUE_WINDOW: f64 = 1.0;

/// Scatters the middle bits of the entry address; timers allocated together
/// still land on different shards.
fn shard_of(entry: &Arc<TimerEntry>) -> usize {
    let address = Arc::as_ptr(entry) as usize;
    ((address >> 4) ^ (address >> 9) ^ (address >> 14)) & (NUM_SHARDS - 1)
}

struct ShardState {
    /// Timers with deadlines below `heap_capacity`.
    heap: TimerHeap,
    /// Unordered; timers know their position for O(1) removal.
    overflow: Vec<Arc<TimerEntry>>,
    stats: AveragedStats,
    /// Rolling cutoff; never decreases.
    heap_capacity: Time,
}

struct Shard {
    state: Mutex<ShardState>,
}

/// Shard ordering by minimum deadline. Guarded by the outer mutex; the lock
/// order is always outer then shard, never the reverse.
struct ShardQueue {
    queue: [usize; NUM_SHARDS],
    position: [usize; NUM_SHARDS],
    min_deadline: [Time; NUM_SHARDS],
}

impl ShardQueue {
    fn new() -> ShardQueue {
        let mut queue = [0; NUM_SHARDS];
        let mut position = [0; NUM_SHARDS];
        for (i, slot) in queue.iter_mut().enumerate() {
            *slot = i;
            position[i] = i;
        }
        ShardQueue {
            queue,
            position,
            min_deadline: [Time::infinite(); NUM_SHARDS],
        }
    }

    fn first(&self) -> usize { self.queue[0] }

    fn swap_adjacent(&mut self, first: usize) {
        self.queue.swap(first, first + 1);
        self.position[self.queue[first]] = first;
        self.position[self.queue[first + 1]] = first + 1;
    }

    /// Restores the weak ordering after `shard`'s min deadline changed, by
    /// adjacent swaps in whichever direction is needed.
    fn resort(&mut self, shard: usize) {
        let mut pos = self.position[shard];
        while pos > 0
            && self.min_deadline[self.queue[pos]] < self.min_deadline[self.queue[pos - 1]]
        {
            self.swap_adjacent(pos - 1);
            pos -= 1;
        }
        while pos + 1 < NUM_SHARDS
            && self.min_deadline[self.queue[pos]] > self.min_deadline[self.queue[pos + 1]]
        {
            self.swap_adjacent(pos);
            pos += 1;
        }
    }

    #[cfg(test)]
    fn is_weakly_sorted(&self) -> bool {
        self.queue
            .windows(2)
            .all(|pair| self.min_deadline[pair[0]] <= self.min_deadline[pair[1]])
    }
}

/// Process-wide sharded timer set. Constructed on first use via
/// [`TimerManager::get`], which also forces the I/O manager into existence
/// since the poll loop is what drives [`TimerManager::check`].
pub struct TimerManager {
    shards: Vec<Shard>,
    ordering: Mutex<ShardQueue>,
}

static TIMERS: OnceLock<TimerManager> = OnceLock::new();

impl TimerManager {
    pub fn get() -> &'static TimerManager {
        TIMERS.get_or_init(|| {
            let manager = TimerManager::new();
            IoManager::get();
            manager
        })
    }

    pub(crate) fn new() -> TimerManager {
        let now = Time::now();
        let mut shards: Vec<Shard> = empty!();
        for _ in 0..NUM_SHARDS {
            shards.push(Shard {
                state: Mutex::new(ShardState {
                    heap: TimerHeap::new(),
                    overflow: empty!(),
                    stats: AveragedStats::new(1.0 / ADD_DEADLINE_SCALE, 0.1, 0.5),
                    heap_capacity: now,
                }),
            });
        }
        TimerManager {
            shards,
            ordering: Mutex::new(ShardQueue::new()),
        }
    }

    /// Schedules `closure` to run at or after `delay` from now, recording
    /// the timer on `controller`.
    pub fn start(&self, delay: Delta, closure: Closure, controller: &TimerController) {
        let deadline = Time::now() + delay;
        let core = &controller.core;
        let entry = TimerEntry::new(deadline, closure, Arc::downgrade(core));
        {
            let mut slot = core.timer.lock().expect("timer mutex poisoned");
            debug_assert!(
                slot.as_ref().map_or(true, |old| !old.pending.load(Ordering::Acquire)),
                "timer restarted while still pending"
            );
            *slot = Some(entry.clone());
        }

        let shard_index = shard_of(&entry);
        let became_root = {
            let mut shard =
                self.shards[shard_index].state.lock().expect("timer shard mutex poisoned");
            shard.stats.add_sample(delay.to_micros() as f64 / 1e6);
            // The shard queue only sees heap roots, so any timer earlier
            // than the current root must enter the heap even when it lies
            // beyond the capacity window; otherwise the poll loop would
            // sleep past it.
            let goes_to_heap = deadline < shard.heap_capacity
                || shard.heap.top().map_or(true, |root| deadline < root.deadline);
            if goes_to_heap {
                shard.heap.add(entry.clone())
            } else {
                entry.list_index.store(shard.overflow.len(), Ordering::Relaxed);
                shard.overflow.push(entry.clone());
                false
            }
        };

        if became_root {
            let mut ordering = self.ordering.lock().expect("timer queue mutex poisoned");
            if deadline < ordering.min_deadline[shard_index] {
                let old_global = ordering.min_deadline[ordering.first()];
                ordering.min_deadline[shard_index] = deadline;
                ordering.resort(shard_index);
                let is_new_global = ordering.first() == shard_index && deadline < old_global;
                drop(ordering);
                if is_new_global {
                    // the poll loop may be blocked on the old, later deadline
                    IoManager::get().wakeup();
                }
            }
        }

        #[cfg(feature = "log")]
        log::trace!(target: "timers", "Started a {delay} timer on shard {shard_index}");
    }

    /// Cancels the controller's pending timer, if any, and reaps the task
    /// of an already-fired one (cancelling it and waiting if it is running
    /// on another thread). Idempotent.
    pub fn cancel(&self, controller: &TimerController) {
        let core = &controller.core;
        let entry = core.timer.lock().expect("timer mutex poisoned").clone();
        let task = match entry {
            None => core.scheduled.lock().expect("timer mutex poisoned").take(),
            Some(entry) => {
                let shard_index = shard_of(&entry);
                let mut shard =
                    self.shards[shard_index].state.lock().expect("timer shard mutex poisoned");
                let task = core.scheduled.lock().expect("timer mutex poisoned").take();
                if entry.pending.swap(false, Ordering::AcqRel) {
                    if entry.heap_index.load(Ordering::Relaxed) == INVALID_INDEX {
                        remove_from_overflow(&mut shard, &entry);
                    } else {
                        shard.heap.remove(&entry);
                    }
                    // release whatever the closure captured
                    entry.closure.lock().expect("timer mutex poisoned").take();
                }
                task
            }
        };
        if let Some(task) = task {
            task.cancel();
            task.wait_if_running();
        }
    }

    /// Fires everything due, posting closures to the task runner, and
    /// returns the time until the next deadline (infinite when no timer is
    /// scheduled anywhere). Called by the poll loop to size its blocking
    /// timeout.
    pub fn check(&self) -> Delta {
        let now = Time::now();
        let mut ordering = self.ordering.lock().expect("timer queue mutex poisoned");
        loop {
            let first = ordering.first();
            if ordering.min_deadline[first] > now {
                break;
            }
            let new_min = self.pop_shard(first, now);
            ordering.min_deadline[first] = new_min;
            ordering.resort(first);
        }
        let min = ordering.min_deadline[ordering.first()];
        if min.is_infinite() {
            Delta::infinite()
        } else {
            min - now
        }
    }

    /// Pops every due timer of one shard and returns the shard's new
    /// minimum deadline.
    fn pop_shard(&self, shard_index: usize, now: Time) -> Time {
        let mut shard = self.shards[shard_index].state.lock().expect("timer shard mutex poisoned");
        while let Some(entry) = pop_one(&mut shard, now) {
            #[cfg(feature = "log")]
            log::trace!(target: "timers", "Shard {shard_index} fires a timer");
            let closure = entry.closure.lock().expect("timer mutex poisoned").take();
            let handle = closure.map(|closure| TaskRunner::get().post(closure));
            if let Some(core) = entry.controller.upgrade() {
                *core.scheduled.lock().expect("timer mutex poisoned") = handle;
            }
        }
        restore_min_invariant(&mut shard);
        shard.heap.top().map(|entry| entry.deadline).unwrap_or_else(Time::infinite)
    }

    #[cfg(test)]
    pub(crate) fn refill_for_test(&self, shard_index: usize, now: Time) -> bool {
        let mut shard = self.shards[shard_index].state.lock().unwrap();
        refill(&mut shard, now)
    }

    #[cfg(test)]
    pub(crate) fn heap_capacity_for_test(&self, shard_index: usize) -> Time {
        self.shards[shard_index].state.lock().unwrap().heap_capacity
    }

    #[cfg(test)]
    pub(crate) fn queue_is_weakly_sorted(&self) -> bool {
        self.ordering.lock().unwrap().is_weakly_sorted()
    }
}

/// Pops the next due timer: refills the heap from the overflow list when it
/// runs empty past its capacity window, and returns `None` once the heap
/// root (if any) lies in the future.
fn pop_one(shard: &mut ShardState, now: Time) -> Option<Arc<TimerEntry>> {
    loop {
        if shard.heap.is_empty() {
            if now < shard.heap_capacity {
                return None;
            }
            if !refill(shard, now) {
                return None;
            }
        }
        let top = shard.heap.top().cloned().expect("heap was refilled");
        if top.deadline > now {
            return None;
        }
        top.pending.store(false, Ordering::Release);
        shard.heap.pop();
        return Some(top);
    }
}

/// Advances the capacity window by the clamped averaged-delay estimate and
/// pulls every overflow timer now falling under it into the heap. Returns
/// whether the heap ended up non-empty.
fn refill(shard: &mut ShardState, now: Time) -> bool {
    let computed = shard.stats.update_average() * ADD_DEADLINE_SCALE;
    let window = computed.clamp(MIN_QUEUE_WINDOW, MAX_QUEUE_WINDOW);
    shard.heap_capacity =
        shard.heap_capacity.max(now) + Delta::from_millis((window * 1000.0) as i64);

    let mut i = 0;
    while i < shard.overflow.len() {
        if shard.overflow[i].deadline < shard.heap_capacity {
            let entry = take_from_overflow(shard, i);
            shard.heap.add(entry);
        } else {
            i += 1;
        }
    }
    !shard.heap.is_empty()
}

/// Popping can leave the heap empty, or expose a root which lies beyond an
/// overflow timer; either way the shard queue would sleep past whatever is
/// actually due next. Promote overflow timers until the heap root is the
/// true shard minimum.
fn restore_min_invariant(shard: &mut ShardState) {
    loop {
        let Some(earliest) = earliest_overflow_index(shard) else {
            break;
        };
        let due_first = shard.overflow[earliest].deadline;
        if shard.heap.top().map_or(false, |root| root.deadline <= due_first) {
            break;
        }
        let entry = take_from_overflow(shard, earliest);
        shard.heap.add(entry);
    }
}

fn earliest_overflow_index(shard: &ShardState) -> Option<usize> {
    let mut earliest: Option<usize> = None;
    for (i, entry) in shard.overflow.iter().enumerate() {
        if earliest.map_or(true, |e| entry.deadline < shard.overflow[e].deadline) {
            earliest = Some(i);
        }
    }
    earliest
}

fn take_from_overflow(shard: &mut ShardState, index: usize) -> Arc<TimerEntry> {
    let entry = shard.overflow.swap_remove(index);
    entry.list_index.store(INVALID_INDEX, Ordering::Relaxed);
    if let Some(moved) = shard.overflow.get(index) {
        moved.list_index.store(index, Ordering::Relaxed);
    }
    entry
}

fn remove_from_overflow(shard: &mut ShardState, entry: &Arc<TimerEntry>) {
    let index = entry.list_index.load(Ordering::Relaxed);
    debug_assert!(index < shard.overflow.len(), "timer not in the overflow list");
    debug_assert!(
        Arc::ptr_eq(&shard.overflow[index], entry),
        "stored overflow index is stale"
    );
    take_from_overflow(shard, index);
}
