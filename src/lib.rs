// RustySched - work-stealing task scheduler and platform concurrency services
// Core library module

use serde::{Deserialize, Serialize};

pub mod concurrent;
pub mod cpu;
pub mod error;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timing;

pub use error::{Result, SchedError};
pub use scheduler::{
    this_scheduler, worker_index, BoundObject, ConcurrentTaskScheduler, SchedulerHandle,
    SerialTaskScheduler, TaskScheduler,
};
pub use task::{
    make_task, make_task_with_parent, out_of_task_handler, set_out_of_task_handler,
    OutOfTaskHandler, Task, TaskHandle, DEFAULT_MAX_TASKS,
};

/// Scheduler construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total worker count for a concurrent scheduler, owning thread included.
    /// Ignored by the serial scheduler, which always runs one worker.
    pub worker_threads: usize,
    /// Pin worker `i` to logical core `i`. Best-effort: a failed pin is
    /// logged and the worker runs unpinned.
    pub pin_workers: bool,
    /// Capacity of each worker thread's task arena ring.
    pub max_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: cpu::logical_cores(),
            pin_workers: false,
            max_tasks: task::DEFAULT_MAX_TASKS,
        }
    }
}
