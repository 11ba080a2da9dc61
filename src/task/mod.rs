// Copyright (c) 2025 RustySched Contributors
//
// Task objects
//
// A task is one unit of deferred work: a closure captured by value into a
// pool slot, an unfinished counter and an optional back-link to a parent
// task. The counter starts at 1 for the task's own body and gains 1 per
// child, so `unfinished == 1` means runnable and `unfinished == 0` means
// complete. Completion walks the parent chain instead of keeping any child
// lists.

mod arena;

pub use arena::{
    out_of_task_handler, set_out_of_task_handler, OutOfTaskHandler, DEFAULT_MAX_TASKS,
};

pub(crate) use arena::{current_arena, ensure_thread_arena, ParentLink, TaskArena};

use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::error::Result;

/// A unit of deferred computation.
///
/// Tasks are move-only; executing one consumes it. Dropping a task without
/// executing it still destroys the captured closure and releases the
/// completion count, so a parent never waits on a discarded child.
pub struct Task {
    arena: Arc<TaskArena>,
    index: u32,
    generation: u32,
}

impl Task {
    pub(crate) fn from_parts(arena: Arc<TaskArena>, index: u32, generation: u32) -> Self {
        Self {
            arena,
            index,
            generation,
        }
    }

    /// A non-owning handle usable for waiting after the task is posted.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            arena: Arc::clone(&self.arena),
            index: self.index,
            generation: self.generation,
        }
    }

    /// Whether this task has completed.
    pub fn completed(&self) -> bool {
        let (_, unfinished) = self.arena.slot(self.index).snapshot();
        unfinished == 0
    }

    /// Whether this task may run now, i.e. every child has completed.
    pub fn available(&self) -> bool {
        let (_, unfinished) = self.arena.slot(self.index).snapshot();
        unfinished == 1
    }

    /// Runs the stored closure exactly once, then releases this task and,
    /// transitively, any parent that was only waiting on it.
    ///
    /// The release happens even when the closure panics: an unfinished count
    /// left behind would wedge the slot for the rest of the arena's life and
    /// strand every ancestor of this task.
    pub fn execute(self) {
        debug_assert!(self.available(), "executed a task with unfinished children");

        let this = ManuallyDrop::new(self);
        // Move the fields into a guard so the completion chain runs during
        // an unwind as well as on the normal path.
        let guard = CompletionGuard {
            arena: unsafe { std::ptr::read(&this.arena) },
            index: this.index,
        };

        let slot = guard.arena.slot(guard.index);
        if let Some(vtable) = unsafe { slot.take_vtable() } {
            unsafe { (vtable.invoke)(slot.payload_ptr()) };
        }
    }
}

/// Releases one task's completion count when dropped, normally or during a
/// panic unwind out of the task body.
struct CompletionGuard {
    arena: Arc<TaskArena>,
    index: u32,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        complete(&self.arena, self.index);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let slot = self.arena.slot(self.index);

        if let Some(vtable) = unsafe { slot.take_vtable() } {
            unsafe { (vtable.drop_payload)(slot.payload_ptr()) };
        }

        complete(&self.arena, self.index);
    }
}

/// A non-owning observer for a task.
///
/// Handles stay meaningful until the arena ring wraps past the slot; the
/// recorded generation detects reuse, and a stale handle simply reports the
/// old task as completed (which, by the ring discipline, it is).
#[derive(Clone)]
pub struct TaskHandle {
    arena: Arc<TaskArena>,
    index: u32,
    generation: u32,
}

impl TaskHandle {
    /// Whether the referenced task has completed.
    pub fn completed(&self) -> bool {
        let (generation, unfinished) = self.arena.slot(self.index).snapshot();
        generation != self.generation || unfinished == 0
    }

    /// Whether the referenced task is runnable right now.
    pub fn available(&self) -> bool {
        let (generation, unfinished) = self.arena.slot(self.index).snapshot();
        generation == self.generation && unfinished == 1
    }

    /// Accounts a new child against this task.
    pub(crate) fn retain(&self) -> Result<()> {
        self.arena.slot(self.index).try_retain(self.generation)
    }

    pub(crate) fn parent_link(&self) -> ParentLink {
        ParentLink {
            arena: Arc::downgrade(&self.arena),
            index: self.index,
        }
    }
}

/// Walks the completion chain from `(arena, index)` upward.
fn complete(arena: &Arc<TaskArena>, index: u32) {
    let mut current = Some((Arc::clone(arena), index));
    while let Some((arena, index)) = current {
        let slot = arena.slot(index);
        // Read the back-link before the release: once the count hits zero
        // the slot is claimable and must not be touched again.
        let parent = unsafe { slot.clone_parent() };
        if !slot.release() {
            break;
        }
        current = parent.and_then(|link| link.arena.upgrade().map(|arena| (arena, link.index)));
    }
}

/// Creates a task that invokes `f` exactly once.
///
/// The closure is captured by value into the slot's inline payload; a
/// closure too large for the payload fails to compile.
pub fn make_task<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    current_arena().allocate(None, f)
}

/// Creates a task parented to `parent`.
///
/// The parent's unfinished counter is raised first, so the parent cannot
/// complete before this child does. Fails with
/// [`SchedError::ParentGone`](crate::SchedError::ParentGone) when the parent
/// has already completed.
pub fn make_task_with_parent<F>(parent: &TaskHandle, f: F) -> Result<Task>
where
    F: FnOnce() + Send + 'static,
{
    parent.retain()?;
    Ok(current_arena().allocate(Some(parent.parent_link()), f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_execute_runs_closure_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&calls);

        let task = make_task(move || {
            recorded.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.available());
        assert!(!task.completed());

        task.execute();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_observes_completion() {
        let task = make_task(|| {});
        let handle = task.handle();

        assert!(handle.available());
        assert!(!handle.completed());

        task.execute();

        assert!(handle.completed());
        assert!(!handle.available());
    }

    #[test]
    fn test_children_gate_parent_availability() {
        let parent = make_task(|| {});
        let handle = parent.handle();

        let first = make_task_with_parent(&handle, || {}).unwrap();
        let second = make_task_with_parent(&handle, || {}).unwrap();

        // Two live children: the parent body may run but the parent cannot
        // complete, and is not "available" in the ready-to-finish sense.
        assert!(!parent.available());

        first.execute();
        assert!(!parent.available());

        second.execute();
        assert!(parent.available());

        parent.execute();
        assert!(handle.completed());
    }

    #[test]
    fn test_parent_gone_after_completion() {
        let parent = make_task(|| {});
        let handle = parent.handle();
        parent.execute();

        let result = make_task_with_parent(&handle, || {});
        assert!(matches!(result, Err(SchedError::ParentGone)));
    }

    #[test]
    fn test_dropped_task_still_completes() {
        let parent = make_task(|| {});
        let handle = parent.handle();
        let child = make_task_with_parent(&handle, || {}).unwrap();
        let child_handle = child.handle();

        drop(child);
        assert!(child_handle.completed());

        // The dropped child released its count, so the parent can finish.
        assert!(parent.available());
        parent.execute();
        assert!(handle.completed());
    }

    #[test]
    fn test_dropped_task_destroys_payload() {
        let marker = Arc::new(());
        let captured = Arc::clone(&marker);

        let task = make_task(move || {
            let _ = &captured;
        });

        assert_eq!(Arc::strong_count(&marker), 2);
        drop(task);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_panicking_body_still_completes() {
        let parent = make_task(|| {});
        let handle = parent.handle();
        let child = make_task_with_parent(&handle, || panic!("body failure")).unwrap();
        let child_handle = child.handle();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| child.execute()));
        assert!(result.is_err());

        // The unwind released the child's count: the slot is reclaimable
        // and the parent is not stranded.
        assert!(child_handle.completed());
        assert!(parent.available());
        parent.execute();
        assert!(handle.completed());
    }

    #[test]
    fn test_stale_handle_reads_as_completed() {
        let arena = TaskArena::new(1);

        let first = arena.allocate(None, || {});
        let stale = first.handle();
        first.execute();

        // Reuse the lone slot; the stale handle must not see the newcomer.
        let second = arena.allocate(None, || {});
        assert!(stale.completed());
        assert!(!stale.available());
        second.execute();
    }
}
