// Copyright (c) 2025 RustySched Contributors
//
// Per-thread task pool
//
// Tasks live in a fixed ring of cache-line-aligned slots. Allocation bumps a
// monotonic counter modulo the capacity and claims the slot with a single
// CAS, so the hot path takes no locks. A slot whose previous occupant has
// not completed when the ring wraps back around triggers the process-global
// out-of-task handler.

use std::cell::{RefCell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Result, SchedError};

use super::Task;

/// Default number of slots in a thread's task arena.
// TODO(config): surface a process-wide override once someone actually needs
// a different capacity for plain (non-worker) threads.
pub const DEFAULT_MAX_TASKS: usize = 4096;

/// Size of the inline payload blob inside each task slot.
pub(crate) const TASK_PAYLOAD_SIZE: usize = 64;

/// Strictest alignment an inline payload may require.
pub(crate) const TASK_PAYLOAD_ALIGN: usize = 16;

/// Handler invoked when allocating a task would overwrite a live one.
pub type OutOfTaskHandler = fn();

fn default_out_of_task_handler() {
    log::error!("task arena exhausted: allocation would overwrite a live task");
    std::process::abort();
}

static OUT_OF_TASK_HANDLER: Mutex<OutOfTaskHandler> = Mutex::new(default_out_of_task_handler);

/// Replaces the global out-of-task handler, returning the previous one.
pub fn set_out_of_task_handler(handler: OutOfTaskHandler) -> OutOfTaskHandler {
    std::mem::replace(&mut *OUT_OF_TASK_HANDLER.lock(), handler)
}

/// Returns the currently installed out-of-task handler.
pub fn out_of_task_handler() -> OutOfTaskHandler {
    *OUT_OF_TASK_HANDLER.lock()
}

/// Inline storage for a captured closure.
#[repr(C, align(16))]
pub(crate) struct TaskPayload {
    bytes: [MaybeUninit<u8>; TASK_PAYLOAD_SIZE],
}

impl TaskPayload {
    const fn empty() -> Self {
        Self {
            bytes: [MaybeUninit::uninit(); TASK_PAYLOAD_SIZE],
        }
    }
}

/// Type-erased entry points for the closure stored in a slot.
#[derive(Clone, Copy)]
pub(crate) struct TaskVtable {
    pub invoke: unsafe fn(*mut u8),
    pub drop_payload: unsafe fn(*mut u8),
}

unsafe fn invoke_payload<F: FnOnce()>(payload: *mut u8) {
    let f = payload.cast::<F>().read();
    f();
}

unsafe fn drop_payload<F>(payload: *mut u8) {
    payload.cast::<F>().drop_in_place();
}

/// Compile-time rejection of closures that cannot live inline.
struct PayloadFit<F>(PhantomData<F>);

impl<F> PayloadFit<F> {
    const CHECK: () = assert!(
        std::mem::size_of::<F>() <= TASK_PAYLOAD_SIZE
            && std::mem::align_of::<F>() <= TASK_PAYLOAD_ALIGN,
        "task closure does not fit the slot's inline storage",
    );
}

/// Back-link from a child to its parent's slot.
///
/// The arena reference is weak: a slot must not keep its own arena alive, or
/// a parent and child allocated from the same ring would form a cycle.
#[derive(Clone)]
pub(crate) struct ParentLink {
    pub arena: Weak<TaskArena>,
    pub index: u32,
}

#[inline]
const fn pack(generation: u32, unfinished: u32) -> u64 {
    ((generation as u64) << 32) | unfinished as u64
}

#[inline]
const fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

/// One pool cell.
///
/// The state word packs the slot generation (high 32 bits) with the
/// unfinished counter (low 32 bits) so observers always see a consistent
/// pair. `unfinished == 0` doubles as "free": the previous occupant has
/// completed and the slot may be claimed.
#[repr(C, align(64))]
pub(crate) struct TaskSlot {
    state: AtomicU64,
    vtable: UnsafeCell<Option<TaskVtable>>,
    parent: UnsafeCell<Option<ParentLink>>,
    payload: UnsafeCell<TaskPayload>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(0, 0)),
            vtable: UnsafeCell::new(None),
            parent: UnsafeCell::new(None),
            payload: UnsafeCell::new(TaskPayload::empty()),
        }
    }

    /// Current `(generation, unfinished)` pair.
    #[inline]
    pub(crate) fn snapshot(&self) -> (u32, u32) {
        unpack(self.state.load(Ordering::Acquire))
    }

    /// Claims a free slot, bumping its generation. Returns the new
    /// generation, or `None` when the previous occupant is still live.
    fn try_claim(&self) -> Option<u32> {
        let state = self.state.load(Ordering::Acquire);
        let (generation, unfinished) = unpack(state);
        if unfinished != 0 {
            return None;
        }
        let next_generation = generation.wrapping_add(1);
        self.state
            .compare_exchange(
                state,
                pack(next_generation, 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        Some(next_generation)
    }

    /// Adds one unfinished count on behalf of a new child. Fails when the
    /// slot no longer holds the generation the caller knows about, or the
    /// task already completed.
    pub(crate) fn try_retain(&self, generation: u32) -> Result<()> {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let (current_generation, unfinished) = unpack(state);
            if current_generation != generation || unfinished == 0 {
                return Err(SchedError::ParentGone);
            }
            match self.state.compare_exchange_weak(
                state,
                pack(current_generation, unfinished + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => state = actual,
            }
        }
    }

    /// Drops one unfinished count; true when the task just completed.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        let (_, unfinished) = unpack(previous);
        debug_assert!(unfinished >= 1, "task released below zero");
        unfinished == 1
    }

    /// # Safety
    ///
    /// Only the thread holding the live `Task` for this slot may call this.
    pub(crate) unsafe fn take_vtable(&self) -> Option<TaskVtable> {
        (*self.vtable.get()).take()
    }

    /// # Safety
    ///
    /// The slot's unfinished count must be non-zero for the duration of the
    /// call; the parent link is only rewritten while the slot is claimed.
    pub(crate) unsafe fn clone_parent(&self) -> Option<ParentLink> {
        (*self.parent.get()).clone()
    }

    #[inline]
    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        self.payload.get().cast()
    }
}

/// A fixed ring of task slots.
///
/// Every thread that creates tasks gets its own arena (see
/// [`current_arena`]), so allocation never contends between threads; the
/// atomics only arbitrate against completion and handle observers.
pub(crate) struct TaskArena {
    slots: Box<[TaskSlot]>,
    next: AtomicU64,
}

// Slots are only written between a successful claim and publication of the
// task; afterwards all shared access goes through the atomic state word.
unsafe impl Send for TaskArena {}
unsafe impl Sync for TaskArena {}

impl TaskArena {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "task arena capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| TaskSlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            slots,
            next: AtomicU64::new(0),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn slot(&self, index: u32) -> &TaskSlot {
        &self.slots[index as usize]
    }

    /// Allocates a slot and moves `f` into its inline payload.
    pub(crate) fn allocate<F>(self: &Arc<Self>, parent: Option<ParentLink>, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        #[allow(clippy::let_unit_value)]
        let _fits = PayloadFit::<F>::CHECK;

        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let index = (ticket % self.slots.len() as u64) as u32;
        let slot = &self.slots[index as usize];

        let generation = match slot.try_claim() {
            Some(generation) => generation,
            None => {
                // The ring wrapped onto a task that has not completed.
                out_of_task_handler()();
                panic!("task arena exhausted ({} slots)", self.slots.len());
            }
        };

        // The claim gives this thread exclusive access to the cells until
        // the task is published by posting it.
        unsafe {
            *slot.parent.get() = parent;
            *slot.vtable.get() = Some(TaskVtable {
                invoke: invoke_payload::<F>,
                drop_payload: drop_payload::<F>,
            });
            std::ptr::write(slot.payload_ptr().cast::<F>(), f);
        }

        Task::from_parts(Arc::clone(self), index, generation)
    }
}

thread_local! {
    static THREAD_ARENA: RefCell<Option<Arc<TaskArena>>> = const { RefCell::new(None) };
}

/// The calling thread's arena, created with the default capacity on first
/// use. Worker threads size theirs up front via [`ensure_thread_arena`].
pub(crate) fn current_arena() -> Arc<TaskArena> {
    THREAD_ARENA.with(|cell| {
        Arc::clone(
            cell.borrow_mut()
                .get_or_insert_with(|| TaskArena::new(DEFAULT_MAX_TASKS)),
        )
    })
}

/// Creates the calling thread's arena with `capacity` slots unless one
/// already exists.
pub(crate) fn ensure_thread_arena(capacity: usize) {
    THREAD_ARENA.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(TaskArena::new(capacity));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_slots_recycle_after_completion() {
        let arena = TaskArena::new(4);
        assert_eq!(arena.capacity(), 4);

        for _ in 0..16 {
            let task = arena.allocate(None, || {});
            task.execute();
        }
    }

    #[test]
    fn test_generation_bumps_on_reuse() {
        let arena = TaskArena::new(1);

        let first = arena.allocate(None, || {});
        let (generation_a, _) = arena.slot(0).snapshot();
        first.execute();

        let second = arena.allocate(None, || {});
        let (generation_b, _) = arena.slot(0).snapshot();
        second.execute();

        assert_ne!(generation_a, generation_b);
    }

    #[test]
    fn test_exhaustion_invokes_handler() {
        static FIRED: AtomicBool = AtomicBool::new(false);

        fn recording_handler() {
            FIRED.store(true, Ordering::SeqCst);
        }

        let arena = TaskArena::new(2);
        let live: Vec<Task> = (0..2).map(|_| arena.allocate(None, || {})).collect();

        let previous = set_out_of_task_handler(recording_handler);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = arena.allocate(None, || {});
        }));
        set_out_of_task_handler(previous);

        assert!(result.is_err());
        assert!(FIRED.load(Ordering::SeqCst));
        drop(live);
    }
}
