// Copyright (c) 2025 RustySched Contributors
//
// Work-stealing concurrent scheduler
//
// One deque per worker; deque 0 belongs to the owning thread, which becomes
// worker 0 inside `run`. Workers pop their own deque in LIFO order and steal
// from a random victim in FIFO order when it runs dry. A popped task whose
// children have not finished goes back on the runner's deque and the cycle
// continues, so the loop never wedges on an unready task.
//
// Only the thread that constructed the scheduler may run, stop or drop it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::concurrent::deque::{Steal, StealDeque};
use crate::concurrent::Backoff;
use crate::cpu;
use crate::task::{ensure_thread_arena, Task, TaskHandle};
use crate::timing::ScopeTimer;
use crate::SchedulerConfig;

use super::{
    enter_worker, next_scheduler_id, this_scheduler, worker_index_for, SchedulerHandle,
    TaskScheduler, WorkerToken,
};

/// Empty work cycles a worker spins through before parking briefly.
const IDLE_SPIN_CYCLES: u32 = 64;

/// How long an idle worker parks before re-checking its queues.
const IDLE_WAIT: Duration = Duration::from_millis(1);

pub(crate) struct ConcurrentCore {
    id: usize,
    queues: Vec<StealDeque<Task>>,
    running: AtomicBool,
    stopped: AtomicBool,
    started: AtomicBool,
    active_workers: AtomicUsize,
    idle: Mutex<()>,
    idle_cv: Condvar,
    pin_workers: bool,
    max_tasks: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    self_weak: Weak<ConcurrentCore>,
}

impl ConcurrentCore {
    fn local_index(&self) -> Option<usize> {
        worker_index_for(self.id)
    }

    /// One task from the local deque, or stolen from a random victim.
    fn get_task(&self) -> Option<Task> {
        let me = self.local_index();
        if let Some(index) = me {
            if let Some(task) = self.queues[index].pop() {
                return Some(task);
            }
        }
        self.steal_task(me)
    }

    fn steal_task(&self, me: Option<usize>) -> Option<Task> {
        let queues = self.queues.len();
        if me.is_some() && queues == 1 {
            return None;
        }

        let victim = loop {
            let candidate = fastrand::usize(0..queues);
            if Some(candidate) != me {
                break candidate;
            }
        };

        let mut backoff = Backoff::new();
        loop {
            match self.queues[victim].steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => backoff.spin(),
            }
        }
    }

    /// One iteration of the work cycle. Returns whether any progress was
    /// made (a task ran or was requeued).
    fn do_work(&self, binding: &SchedulerHandle) -> bool {
        match self.get_task() {
            Some(task) if task.available() => {
                let _active = this_scheduler::activate(binding.clone());
                task.execute();
                true
            }
            Some(task) => {
                // Outstanding children; run it after them.
                let index = self.local_index().unwrap_or(0);
                self.queues[index].push(task);
                true
            }
            None => {
                thread::yield_now();
                false
            }
        }
    }

    fn has_remaining_tasks(&self) -> bool {
        self.queues.iter().any(|queue| !queue.is_empty())
    }

    fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.stopped.load(Ordering::Acquire) {
            // Stopped before it ever ran; nothing to spawn.
            return;
        }

        self.running.store(true, Ordering::Release);

        let workers = self.queues.len();
        let mut threads = self.threads.lock();
        for index in 1..workers {
            let core = Arc::clone(self);
            let thread = thread::Builder::new()
                .name(format!("rusty-sched-worker-{index}"))
                .spawn(move || worker_main(core, index))
                .expect("failed to spawn scheduler worker");
            threads.push(thread);
        }

        self.idle_cv.notify_all();
        debug!("concurrent scheduler {} started, {} workers", self.id, workers);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.idle_cv.notify_all();
        debug!("concurrent scheduler {} stopping", self.id);
    }

    /// Executes whatever is still queued on the calling thread. Only used
    /// once no workers remain.
    fn drain_inline(&self) {
        let binding = self.handle();
        while self.has_remaining_tasks() {
            self.do_work(&binding);
        }
    }

    fn log_queue_stats(&self) {
        let mut pushed = 0u64;
        let mut popped = 0u64;
        let mut stolen = 0u64;
        let mut attempts = 0u64;
        for queue in &self.queues {
            let stats = queue.stats();
            pushed += stats.pushed;
            popped += stats.popped;
            stolen += stats.stolen;
            attempts += stats.steal_attempts;
        }
        debug!(
            "concurrent scheduler {}: {} tasks queued, {} popped, {} stolen ({} steal attempts)",
            self.id, pushed, popped, stolen, attempts
        );
    }
}

impl TaskScheduler for ConcurrentCore {
    fn post_task(&self, task: Task) {
        assert!(
            !self.stopped.load(Ordering::Acquire),
            "task posted to a stopped scheduler"
        );
        let index = self.local_index().unwrap_or(0);
        self.queues[index].push(task);
        self.idle_cv.notify_all();
    }

    fn wait(&self, handle: &TaskHandle) {
        let binding = self.handle();
        while !handle.completed() {
            self.do_work(&binding);
        }
    }

    fn handle(&self) -> SchedulerHandle {
        let core = self.self_weak.upgrade().expect("scheduler core vanished");
        SchedulerHandle::new(core)
    }
}

fn worker_main(core: Arc<ConcurrentCore>, index: usize) {
    let _token = enter_worker(WorkerToken {
        scheduler: core.id,
        index,
    });
    ensure_thread_arena(core.max_tasks);

    if core.pin_workers {
        if let Err(err) = cpu::pin_current_thread(index) {
            warn!("worker {index}: running unpinned: {err}");
        }
    }

    core.active_workers.fetch_add(1, Ordering::AcqRel);
    debug!("worker {index} started");

    let binding = core.handle();
    let mut idle_streak = 0u32;

    while core.running.load(Ordering::Acquire) || core.has_remaining_tasks() {
        if core.do_work(&binding) {
            idle_streak = 0;
        } else {
            idle_streak += 1;
            if idle_streak > IDLE_SPIN_CYCLES {
                let mut guard = core.idle.lock();
                if !core.has_remaining_tasks() && core.running.load(Ordering::Acquire) {
                    let _ = core.idle_cv.wait_for(&mut guard, IDLE_WAIT);
                }
            }
        }
    }

    core.active_workers.fetch_sub(1, Ordering::AcqRel);
    debug!("worker {index} exited");
}

/// A scheduler running tasks across a pool of work-stealing workers.
///
/// The constructing thread owns the scheduler: it is the only one allowed to
/// call [`run`](Self::run), [`stop`](Self::stop) or drop it, and it serves
/// as worker 0 while `run` is active.
pub struct ConcurrentTaskScheduler {
    core: Arc<ConcurrentCore>,
    owner: ThreadId,
}

impl ConcurrentTaskScheduler {
    /// A scheduler with one worker per logical core.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// A scheduler with `workers` total workers, owning thread included.
    pub fn with_workers(workers: usize) -> Self {
        Self::with_config(SchedulerConfig {
            worker_threads: workers,
            ..SchedulerConfig::default()
        })
    }

    /// A scheduler with one worker per logical core, each pinned to its
    /// core (best-effort).
    pub fn with_affinity() -> Self {
        Self::with_config(SchedulerConfig {
            pin_workers: true,
            ..SchedulerConfig::default()
        })
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let workers = config.worker_threads.max(1);
        let core = Arc::new_cyclic(|self_weak| ConcurrentCore {
            id: next_scheduler_id(),
            queues: (0..workers).map(|_| StealDeque::new()).collect(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
            pin_workers: config.pin_workers,
            max_tasks: config.max_tasks.max(1),
            threads: Mutex::new(Vec::new()),
            self_weak: self_weak.clone(),
        });

        Self {
            core,
            owner: thread::current().id(),
        }
    }

    /// Total worker count, owning thread included.
    pub fn worker_count(&self) -> usize {
        self.core.queues.len()
    }

    /// Runs the scheduler. The calling thread becomes worker 0 and invokes
    /// `step` once per work-cycle iteration, so take care not to starve the
    /// pool from inside `step`. Returns once [`stop`](Self::stop) has been
    /// called and every queue has drained.
    pub fn run<F>(&self, mut step: F)
    where
        F: FnMut(),
    {
        self.assert_owner("run");
        self.core.start();

        let binding = self.core.handle();
        let _active = this_scheduler::activate(binding.clone());
        let _token = enter_worker(WorkerToken {
            scheduler: self.core.id,
            index: 0,
        });
        ensure_thread_arena(self.core.max_tasks);

        if self.core.pin_workers {
            if let Err(err) = cpu::pin_current_thread(0) {
                warn!("worker 0: running unpinned: {err}");
            }
        }

        while self.core.running.load(Ordering::Acquire) || self.core.has_remaining_tasks() {
            step();
            self.core.do_work(&binding);
        }
    }

    /// Signals the scheduler to stop. Tasks already posted still run before
    /// shutdown completes; posting anything new is fatal. Calling this a
    /// second time has no effect.
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

impl TaskScheduler for ConcurrentTaskScheduler {
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

impl Default for ConcurrentTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConcurrentTaskScheduler {
    fn drop(&mut self) {
        let _shutdown = ScopeTimer::new("concurrent scheduler shutdown");

        self.core.stop();

        let threads = std::mem::take(&mut *self.core.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                log::error!("scheduler worker panicked during shutdown");
            }
        }

        // Anything still queued (posted before the stop won the race, or
        // posted when `run` was never called) executes here.
        self.core.drain_inline();
        self.core.log_queue_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_wait_helps_without_run() {
        let scheduler = ConcurrentTaskScheduler::with_workers(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            handles.push(scheduler.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for handle in &handles {
            scheduler.wait(handle);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_wait_on_completed_handle_returns_immediately() {
        let scheduler = ConcurrentTaskScheduler::with_workers(1);
        let handle = scheduler.post(|| {});
        scheduler.wait(&handle);
        // Nothing left to execute; this must not block.
        scheduler.wait(&handle);
        assert!(handle.completed());
    }

    #[test]
    fn test_one_worker_runs_lifo() {
        let scheduler = ConcurrentTaskScheduler::with_workers(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for value in 1..=3 {
            let order = Arc::clone(&order);
            scheduler.post(move || order.lock().push(value));
        }

        let mut stopped = false;
        scheduler.run(|| {
            if !stopped {
                stopped = true;
                scheduler.stop();
            }
        });

        // Owner pops its own deque newest-first and no thief interferes.
        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let scheduler = ConcurrentTaskScheduler::with_workers(2);
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            scheduler.post(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        scheduler.run(|| {
            scheduler.stop();
            scheduler.stop();
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_without_run_executes_posted_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = ConcurrentTaskScheduler::with_workers(2);
            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                scheduler.post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    #[should_panic(expected = "task posted to a stopped scheduler")]
    fn test_post_after_stop_is_fatal() {
        let scheduler = ConcurrentTaskScheduler::with_workers(1);
        scheduler.stop();
        scheduler.post(|| {});
    }

    #[test]
    fn test_post_and_wait_returns_value() {
        let scheduler = ConcurrentTaskScheduler::with_workers(2);
        let value = scheduler.post_and_wait(|| 6 * 7);
        assert_eq!(value, 42);
    }
}
