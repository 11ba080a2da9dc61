// Copyright (c) 2025 RustySched Contributors
//
// Helpers that forward to the scheduler currently active on this thread.
//
// The binding is set by `run` for the owning thread and around every task
// body a worker executes, so task code can post follow-up work without
// threading a scheduler reference through every call.

use std::cell::RefCell;

use crate::error::Result;
use crate::task::{Task, TaskHandle};

use super::{BoundObject, SchedulerHandle, TaskScheduler};

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<SchedulerHandle>> = const { RefCell::new(None) };
}

pub(crate) struct CurrentSchedulerGuard {
    previous: Option<SchedulerHandle>,
}

/// Makes `handle` the active scheduler for the calling thread until the
/// guard drops, restoring whatever was active before.
pub(crate) fn activate(handle: SchedulerHandle) -> CurrentSchedulerGuard {
    let previous = CURRENT_SCHEDULER.with(|cell| cell.borrow_mut().replace(handle));
    CurrentSchedulerGuard { previous }
}

impl Drop for CurrentSchedulerGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// The scheduler active on the calling thread, if any.
pub fn try_current() -> Option<SchedulerHandle> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
}

/// The scheduler active on the calling thread.
///
/// Panics on a thread with no active scheduler; the helpers below are only
/// meaningful inside `run` or a task body.
pub fn current() -> SchedulerHandle {
    try_current().expect("no task scheduler is active on this thread")
}

/// Posts a task to the active scheduler.
pub fn post_task(task: Task) {
    current().post_task(task);
}

/// Creates and posts a task on the active scheduler.
pub fn post<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    current().post(f)
}

/// Creates and posts a task parented to `parent` on the active scheduler.
pub fn post_with_parent<F>(parent: &TaskHandle, f: F) -> Result<TaskHandle>
where
    F: FnOnce() + Send + 'static,
{
    current().post_with_parent(parent, f)
}

/// Waits on `handle` through the active scheduler.
pub fn wait(handle: &TaskHandle) {
    current().wait(handle);
}

/// Binds `value` to the active scheduler.
pub fn bind<T>(value: T) -> BoundObject<T>
where
    T: Send + 'static,
{
    current().bind(value)
}
