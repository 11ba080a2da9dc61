// Copyright (c) 2025 RustySched Contributors
//
// Objects confined to a scheduler
//
// A bound object owns its value and funnels every access through tasks
// posted to the scheduler it was bound to. The binding carries its own
// serialization, so visits never overlap even when the bound scheduler runs
// tasks on several workers.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SchedError};

use super::{SchedulerHandle, TaskScheduler};

/// Shared state for a binding: the scheduler the object is bound to, or
/// `None` once unbound.
pub(crate) struct BoundState {
    scheduler: RwLock<Option<SchedulerHandle>>,
}

/// A value whose access is confined to the scheduler it was bound to.
///
/// Clones share both the value and the binding, so any clone may visit and
/// any clone may unbind all of them at once.
pub struct BoundObject<T> {
    object: Arc<Mutex<T>>,
    state: Arc<BoundState>,
}

impl<T> Clone for BoundObject<T> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> BoundObject<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(scheduler: SchedulerHandle, value: T) -> Self {
        Self {
            object: Arc::new(Mutex::new(value)),
            state: Arc::new(BoundState {
                scheduler: RwLock::new(Some(scheduler)),
            }),
        }
    }

    /// Posts `f` against the bound value and returns without waiting.
    pub fn visit_async<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let scheduler = self.scheduler()?;
        let object = Arc::clone(&self.object);
        scheduler.post(move || f(&mut object.lock()));
        Ok(())
    }

    /// Posts `f` against the bound value and blocks for its result.
    ///
    /// Waiting happens through the bound scheduler, so calling this from a
    /// task already running there keeps the queue moving instead of
    /// deadlocking.
    pub fn visit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let scheduler = self.scheduler()?;
        let object = Arc::clone(&self.object);
        Ok(scheduler.post_and_wait(move || f(&mut object.lock())))
    }

    /// Disables the binding; later visits report
    /// [`SchedError::Unbound`](crate::SchedError::Unbound).
    pub fn unbind(&self) {
        *self.state.scheduler.write() = None;
    }

    /// Whether a scheduler is still bound.
    pub fn is_bound(&self) -> bool {
        self.state.scheduler.read().is_some()
    }

    fn scheduler(&self) -> Result<SchedulerHandle> {
        self.state
            .scheduler
            .read()
            .clone()
            .ok_or(SchedError::Unbound)
    }
}
