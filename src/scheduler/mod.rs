// Copyright (c) 2025 RustySched Contributors
//
// Task scheduler surfaces
//
// Both scheduler kinds expose the same posting surface through the
// `TaskScheduler` trait: post a task, wait on a handle, or go through the
// convenience helpers that build the task for you. `SchedulerHandle` is the
// cheap clonable form used by the thread-local binding and by bound objects.

pub mod bound;
pub mod concurrent;
pub mod serial;
pub mod this_scheduler;

pub use bound::BoundObject;
pub use concurrent::ConcurrentTaskScheduler;
pub use serial::SerialTaskScheduler;

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::task::{make_task, make_task_with_parent, Task, TaskHandle};

/// A system for scheduling tasks.
///
/// Schedulers provide a way of posting a task and of waiting on a task that
/// has already been posted.
pub trait TaskScheduler: Send + Sync {
    /// Posts an already-constructed task for execution.
    ///
    /// Posting to a stopped scheduler is a programming error and fatal.
    fn post_task(&self, task: Task);

    /// Blocks until the task behind `handle` completes. The calling thread
    /// participates in executing tasks while it waits, where the scheduler
    /// kind allows it.
    fn wait(&self, handle: &TaskHandle);

    /// A cheap clonable reference to this scheduler.
    fn handle(&self) -> SchedulerHandle;

    /// Creates and posts a task invoking `f`, returning its handle.
    fn post<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        let task = make_task(f);
        let handle = task.handle();
        self.post_task(task);
        handle
    }

    /// Creates and posts a task parented to `parent`.
    fn post_with_parent<F>(&self, parent: &TaskHandle, f: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        let task = make_task_with_parent(parent, f)?;
        let handle = task.handle();
        self.post_task(task);
        Ok(handle)
    }

    /// Posts `f` and blocks for its result, making the call appear
    /// synchronous even though it may run on another thread.
    fn post_and_wait<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        Self: Sized,
    {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);

        let task = make_task(move || {
            *slot.lock() = Some(f());
        });
        let handle = task.handle();
        self.post_task(task);
        self.wait(&handle);

        let value = result.lock().take();
        // The wait above only returns once the posted body ran.
        value.expect("posted task completed without producing a result")
    }

    /// Confines `value` to this scheduler; every later access goes through
    /// tasks posted here.
    fn bind<T>(&self, value: T) -> BoundObject<T>
    where
        T: Send + 'static,
        Self: Sized,
    {
        BoundObject::new(self.handle(), value)
    }
}

/// A shared, clonable reference to a scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<dyn TaskScheduler>,
}

impl SchedulerHandle {
    pub(crate) fn new(inner: Arc<dyn TaskScheduler>) -> Self {
        Self { inner }
    }
}

impl TaskScheduler for SchedulerHandle {
    fn post_task(&self, task: Task) {
        self.inner.post_task(task);
    }

    fn wait(&self, handle: &TaskHandle) {
        self.inner.wait(handle);
    }

    fn handle(&self) -> SchedulerHandle {
        self.clone()
    }
}

/// Identity of the scheduler worker occupying the current thread.
#[derive(Clone, Copy)]
pub(crate) struct WorkerToken {
    pub scheduler: usize,
    pub index: usize,
}

thread_local! {
    static WORKER_TOKEN: Cell<Option<WorkerToken>> = const { Cell::new(None) };
}

pub(crate) fn next_scheduler_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct WorkerGuard {
    previous: Option<WorkerToken>,
}

/// Marks the current thread as a worker until the guard drops.
pub(crate) fn enter_worker(token: WorkerToken) -> WorkerGuard {
    let previous = WORKER_TOKEN.with(|cell| cell.replace(Some(token)));
    WorkerGuard { previous }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        WORKER_TOKEN.with(|cell| cell.set(previous));
    }
}

/// Index of the scheduler worker running on the calling thread, if any.
/// Worker 0 is the thread that called `run` on a concurrent scheduler, or
/// the dedicated thread of a serial scheduler.
pub fn worker_index() -> Option<usize> {
    WORKER_TOKEN.with(|cell| cell.get()).map(|token| token.index)
}

/// Worker index on one specific scheduler instance.
pub(crate) fn worker_index_for(scheduler: usize) -> Option<usize> {
    WORKER_TOKEN
        .with(|cell| cell.get())
        .filter(|token| token.scheduler == scheduler)
        .map(|token| token.index)
}
