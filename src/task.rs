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

//! Fixed-size worker pool executing posted closures with per-task
//! cancellation and wait-if-running semantics.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel as chan;

use crate::sync::Notification;

/// Number of worker threads in the process-wide runner.
const NUM_WORKERS: usize = 4;

/// A unit of deferred work.
pub type Closure = Box<dyn FnOnce() + Send>;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const COMPLETED: u8 = 3;

pub(crate) struct Task {
    state: AtomicU8,
    closure: Mutex<Option<Closure>>,
    completed: Notification,
    worker: Mutex<Option<ThreadId>>,
}

impl Task {
    fn new(closure: Closure) -> Task {
        Task {
            state: AtomicU8::new(PENDING),
            closure: Mutex::new(Some(closure)),
            completed: Notification::new(),
            worker: Mutex::new(None),
        }
    }

    fn run(&self) {
        // A failed exchange means a late cancellation won the race.
        if self
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *self.worker.lock().expect("task mutex poisoned") = Some(thread::current().id());
        if let Some(closure) = self.closure.lock().expect("task mutex poisoned").take() {
            closure();
        }
        self.state.store(COMPLETED, Ordering::Release);
        self.completed.notify();
        *self.worker.lock().expect("task mutex poisoned") = None;
    }

    fn cancel(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            match state {
                PENDING | RUNNING => {
                    if self
                        .state
                        .compare_exchange(state, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                CANCELLED | COMPLETED => return,
                _ => unreachable!("corrupt task state"),
            }
        }
    }

    fn wait_if_running(&self) {
        // Waiting on our own task would never return.
        if *self.worker.lock().expect("task mutex poisoned") == Some(thread::current().id()) {
            return;
        }
        if self.state.load(Ordering::Acquire) == RUNNING {
            self.completed.wait_for_notification();
        }
    }

    #[cfg(test)]
    fn state(&self) -> u8 { self.state.load(Ordering::Acquire) }
}

/// Reference-counted alias for a posted task. A default-constructed handle
/// is null and all its operations are no-ops.
#[derive(Clone, Default)]
pub struct TaskHandle(Option<Arc<Task>>);

impl TaskHandle {
    /// Transitions a pending or running task to cancelled; a cancelled task
    /// which has not yet started will never run. Completed tasks are left
    /// alone.
    pub fn cancel(&self) {
        if let Some(task) = &self.0 {
            task.cancel();
        }
    }

    /// Blocks until the task completes, but only if it is currently running
    /// on some other thread.
    pub fn wait_if_running(&self) {
        if let Some(task) = &self.0 {
            task.wait_if_running();
        }
    }
}

/// The process-wide worker pool.
///
/// Workers block on a shared queue and run one task at a time. All watcher
/// and timer callbacks execute here; the polling thread itself never runs
/// user code.
pub struct TaskRunner {
    tx: Mutex<Option<chan::Sender<Arc<Task>>>>,
    rx: chan::Receiver<Arc<Task>>,
    stopping: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

static RUNNER: OnceLock<TaskRunner> = OnceLock::new();

impl TaskRunner {
    pub fn get() -> &'static TaskRunner { RUNNER.get_or_init(|| TaskRunner::new(NUM_WORKERS)) }

    pub(crate) fn new(num_workers: usize) -> TaskRunner {
        let (tx, rx) = chan::unbounded();
        let stopping = Arc::new(AtomicBool::new(false));
        let mut workers: Vec<JoinHandle<()>> = empty!();
        for i in 0..num_workers {
            let rx = rx.clone();
            let stopping = stopping.clone();
            let worker = thread::Builder::new()
                .name(format!("iomux-worker-{i}"))
                .spawn(move || Self::run_tasks(rx, stopping))
                .expect("failed to spawn worker thread");
            workers.push(worker);
        }
        TaskRunner {
            tx: Mutex::new(Some(tx)),
            rx,
            stopping,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a closure and wakes one worker. During shutdown the closure
    /// is dropped and a null handle returned.
    pub fn post(&self, closure: Closure) -> TaskHandle {
        if self.stopping.load(Ordering::Acquire) {
            return TaskHandle::default();
        }
        let tx = self.tx.lock().expect("runner mutex poisoned");
        let Some(tx) = tx.as_ref() else {
            return TaskHandle::default();
        };
        let task = Arc::new(Task::new(closure));
        if tx.send(task.clone()).is_err() {
            return TaskHandle::default();
        }
        TaskHandle(Some(task))
    }

    fn run_tasks(rx: chan::Receiver<Arc<Task>>, stopping: Arc<AtomicBool>) {
        for task in rx.iter() {
            if stopping.load(Ordering::Acquire) {
                task.cancel();
                continue;
            }
            task.run();
        }
    }

    /// Stops accepting work, cancels whatever is still queued and joins the
    /// workers.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        // Closing the channel lets the workers drain the backlog and exit.
        drop(self.tx.lock().expect("runner mutex poisoned").take());
        let workers: Vec<_> =
            self.workers.lock().expect("runner mutex poisoned").drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        // With no workers left, cancel anything still queued.
        while let Ok(task) = self.rx.try_recv() {
            task.cancel();
        }
    }

    /// Drains the queue on the calling thread; only meaningful for a runner
    /// constructed with zero workers.
    #[cfg(test)]
    pub(crate) fn run_queued_for_test(&self) {
        while let Ok(task) = self.rx.try_recv() {
            task.run();
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) { self.shutdown(); }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn counting_closure(counter: &Arc<AtomicUsize>) -> Closure {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn task_starts_pending() {
        let task = Task::new(Box::new(|| {}));
        assert_eq!(task.state(), PENDING);
    }

    #[test]
    fn task_runs_to_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Task::new(counting_closure(&counter));
        task.run();
        assert_eq!(task.state(), COMPLETED);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // completed tasks ignore wait and further cancels
        task.wait_if_running();
        task.cancel();
        assert_eq!(task.state(), COMPLETED);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Task::new(counting_closure(&counter));
        task.cancel();
        assert_eq!(task.state(), CANCELLED);
        task.run();
        assert_eq!(task.state(), CANCELLED);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn null_handle_is_inert() {
        let handle = TaskHandle::default();
        handle.cancel();
        handle.wait_if_running();
    }

    #[test]
    fn zero_worker_runner_queues_until_drained() {
        let runner = TaskRunner::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        runner.post(counting_closure(&counter));
        runner.post(counting_closure(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        runner.run_queued_for_test();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_before_drain_drops_the_task() {
        let runner = TaskRunner::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = runner.post(counting_closure(&counter));
        handle.cancel();
        runner.run_queued_for_test();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_executes_posted_work() {
        let runner = TaskRunner::new(2);
        let done = Arc::new(Notification::new());
        let signal = done.clone();
        runner.post(Box::new(move || signal.notify()));
        done.wait_for_notification();
    }

    #[test]
    fn wait_if_running_blocks_until_completion() {
        let runner = TaskRunner::new(1);
        let entered = Arc::new(Notification::new());
        let entered_signal = entered.clone();
        let release = Arc::new(Notification::new());
        let release_wait = release.clone();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = finished.clone();
        let handle = runner.post(Box::new(move || {
            entered_signal.notify();
            release_wait.wait_for_notification();
            finished_flag.store(true, Ordering::SeqCst);
        }));

        entered.wait_for_notification();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            release.notify();
        });
        handle.wait_if_running();
        assert!(finished.load(Ordering::SeqCst));
        releaser.join().unwrap();
    }

    #[test]
    fn wait_if_running_from_own_worker_does_not_deadlock() {
        let runner = TaskRunner::new(1);
        let handle_slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        let slot = handle_slot.clone();
        let handle_set = Arc::new(Notification::new());
        let handle_ready = handle_set.clone();
        let done = Arc::new(Notification::new());
        let signal = done.clone();
        let handle = runner.post(Box::new(move || {
            // a watcher stopping itself from inside its own callback
            handle_ready.wait_for_notification();
            let own = slot.lock().unwrap().take().expect("handle stored");
            own.cancel();
            own.wait_if_running();
            signal.notify();
        }));
        *handle_slot.lock().unwrap() = Some(handle);
        handle_set.notify();
        done.wait_for_notification();
    }

    #[test]
    fn shutdown_cancels_queued_tasks_and_rejects_new_work() {
        let runner = TaskRunner::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        runner.post(counting_closure(&counter));
        runner.shutdown();
        let handle = runner.post(counting_closure(&counter));
        handle.cancel();
        runner.run_queued_for_test();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
