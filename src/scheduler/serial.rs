// Copyright (c) 2025 RustySched Contributors
//
// Serial scheduler
//
// One dedicated worker drains a FIFO queue, so tasks posted from a single
// thread complete in posting order. Posting is thread-safe from anywhere;
// the worker parks on a semaphore between posts and a condvar broadcast
// releases threads blocked in `wait`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::sync::Semaphore;
use crate::task::{ensure_thread_arena, Task, TaskHandle};
use crate::timing::ScopeTimer;
use crate::SchedulerConfig;

use super::{
    enter_worker, next_scheduler_id, this_scheduler, SchedulerHandle, TaskScheduler, WorkerToken,
};

/// Upper bound on one idle park; a stop or post signals earlier.
const IDLE_WAIT: Duration = Duration::from_millis(10);

pub(crate) struct SerialCore {
    id: usize,
    queue: Mutex<VecDeque<Task>>,
    /// Wakes the worker when work arrives or the scheduler stops.
    work: Semaphore,
    /// Broadcast after each task so waiters re-check their handles.
    done: Condvar,
    running: AtomicBool,
    stopped: AtomicBool,
    worker: Mutex<Option<ThreadId>>,
    self_weak: Weak<SerialCore>,
}

impl SerialCore {
    fn is_worker_thread(&self) -> bool {
        *self.worker.lock() == Some(thread::current().id())
    }

    fn run_task(&self, task: Task, binding: &SchedulerHandle) {
        if task.available() {
            let _active = this_scheduler::activate(binding.clone());
            task.execute();
        } else {
            // Children still pending; FIFO order puts them first.
            self.queue.lock().push_back(task);
        }
        self.done.notify_all();
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.work.signal();
        self.done.notify_all();
        debug!("serial scheduler {} stopping", self.id);
    }
}

impl TaskScheduler for SerialCore {
    fn post_task(&self, task: Task) {
        assert!(
            !self.stopped.load(Ordering::Acquire),
            "task posted to a stopped scheduler"
        );
        self.queue.lock().push_back(task);
        self.work.signal();
    }

    fn wait(&self, handle: &TaskHandle) {
        if self.is_worker_thread() {
            // Called from inside a task body: keep the queue moving so the
            // waited task (or its children) can reach the front.
            let binding = self.handle();
            while !handle.completed() {
                let task = self.queue.lock().pop_front();
                match task {
                    Some(task) => self.run_task(task, &binding),
                    None => thread::yield_now(),
                }
            }
        } else {
            let mut queue = self.queue.lock();
            while !handle.completed() {
                // Timed so that a completion racing the lock cannot strand
                // this thread.
                let _ = self.done.wait_for(&mut queue, IDLE_WAIT);
            }
        }
    }

    fn handle(&self) -> SchedulerHandle {
        let core = self.self_weak.upgrade().expect("scheduler core vanished");
        SchedulerHandle::new(core)
    }
}

fn serial_worker_main(core: Arc<SerialCore>, max_tasks: usize) {
    *core.worker.lock() = Some(thread::current().id());
    let _token = enter_worker(WorkerToken {
        scheduler: core.id,
        index: 0,
    });
    ensure_thread_arena(max_tasks);
    debug!("serial worker started");

    let binding = core.handle();
    loop {
        let task = core.queue.lock().pop_front();
        match task {
            Some(task) => core.run_task(task, &binding),
            None => {
                if !core.running.load(Ordering::Acquire) {
                    break;
                }
                core.work.try_wait_for(IDLE_WAIT);
            }
        }
    }

    debug!("serial worker exited");
}

/// A scheduler that executes tasks one at a time in posting order.
///
/// The worker thread starts at construction; there is no `run` to call.
/// For any two tasks posted from the same thread, the first completes
/// before the second begins.
pub struct SerialTaskScheduler {
    core: Arc<SerialCore>,
    owner: ThreadId,
    thread: Option<JoinHandle<()>>,
}

impl SerialTaskScheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Only `max_tasks` is honored here; a serial scheduler always runs a
    /// single worker.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let core = Arc::new_cyclic(|self_weak| SerialCore {
            id: next_scheduler_id(),
            queue: Mutex::new(VecDeque::new()),
            work: Semaphore::new(0),
            done: Condvar::new(),
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        let max_tasks = config.max_tasks.max(1);
        let worker = Arc::clone(&core);
        let thread = thread::Builder::new()
            .name("rusty-sched-serial".to_string())
            .spawn(move || serial_worker_main(worker, max_tasks))
            .expect("failed to spawn serial scheduler worker");

        Self {
            core,
            owner: thread::current().id(),
            thread: Some(thread),
        }
    }

    /// Signals the worker to stop once the queue drains. Posting after this
    /// is fatal; calling it a second time has no effect.
    pub fn stop(&self) {
        self.assert_owner("stop");
        self.core.stop();
    }

    fn assert_owner(&self, operation: &str) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "only the owning thread may call {operation}"
        );
    }
}

impl TaskScheduler for SerialTaskScheduler {
    fn post_task(&self, task: Task) {
        self.core.post_task(task);
    }

    fn wait(&self, handle: &TaskHandle) {
        TaskScheduler::wait(&*self.core, handle);
    }

    fn handle(&self) -> SchedulerHandle {
        TaskScheduler::handle(&*self.core)
    }
}

impl Default for SerialTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialTaskScheduler {
    fn drop(&mut self) {
        let _shutdown = ScopeTimer::new("serial scheduler shutdown");

        self.core.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("serial scheduler worker panicked during shutdown");
            }
        }

        // Belt for posts that raced the stop: nothing may be dropped
        // unexecuted.
        let binding = TaskScheduler::handle(&*self.core);
        loop {
            let task = self.core.queue.lock().pop_front();
            match task {
                Some(task) => self.core.run_task(task, &binding),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tasks_run_in_posting_order() {
        let scheduler = SerialTaskScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut last = None;
        for value in 1..=5 {
            let order = Arc::clone(&order);
            last = Some(scheduler.post(move || order.lock().push(value)));
        }

        scheduler.wait(&last.unwrap());
        assert_eq!(*order.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_post_and_wait_round_trip() {
        let scheduler = SerialTaskScheduler::new();
        let squared = scheduler.post_and_wait(|| 12 * 12);
        assert_eq!(squared, 144);
    }

    #[test]
    fn test_stop_drains_pending_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = SerialTaskScheduler::new();
            for _ in 0..50 {
                let counter = Arc::clone(&counter);
                scheduler.post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            scheduler.stop();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_worker_helps_itself_while_waiting() {
        let scheduler = SerialTaskScheduler::new();
        let observed = Arc::new(AtomicUsize::new(0));

        let outer = {
            let observed = Arc::clone(&observed);
            scheduler.post(move || {
                let inner = this_scheduler::post({
                    let observed = Arc::clone(&observed);
                    move || {
                        observed.fetch_add(1, Ordering::SeqCst);
                    }
                });
                // Executes `inner` on this same worker rather than
                // deadlocking on it.
                this_scheduler::wait(&inner);
                observed.fetch_add(10, Ordering::SeqCst);
            })
        };

        scheduler.wait(&outer);
        assert_eq!(observed.load(Ordering::SeqCst), 11);
    }

    #[test]
    #[should_panic(expected = "task posted to a stopped scheduler")]
    fn test_post_after_stop_is_fatal() {
        let scheduler = SerialTaskScheduler::new();
        scheduler.stop();
        scheduler.post(|| {});
    }
}
