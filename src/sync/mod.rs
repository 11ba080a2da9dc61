// Copyright (c) 2025 RustySched Contributors
//
// Blocking synchronization primitives used around the scheduler core.

mod semaphore;
mod waitable_event;

pub use semaphore::Semaphore;
pub use waitable_event::WaitableEvent;
