//! # Task Control Block
//!
//! Task model of the per-core fixed-priority scheduler. Every task has a
//! static priority, an inline stack and a small state machine; there is no
//! dynamic priority adjustment.

use crate::config::STACK_SIZE;
use crate::sync::SingleSlotSignal;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task in the scheduler's state machine.
///
/// ```text
///   ┌──────────┐     schedule()      ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///        ▲  ▲        preempt / yield      │
///        │  └─────────────────────────────┤
///        │                                │ delay(ticks)
///        │        wake tick reached       ▼
///        │                          ┌──────────┐
///        ├───────────────────────── │ Delayed  │
///        │                          └──────────┘
///        │    signal posted or            │ wait(signal)
///        │    recheck tick reached        ▼
///        │                          ┌──────────┐
///        └───────────────────────── │ Blocked  │
///                                   └──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Task is ready to run and waiting for the processor.
    Ready,
    /// Task is currently executing on this core.
    Running,
    /// Task sleeps until its wake tick.
    Delayed,
    /// Task waits for a signal, at most until its wake tick.
    Blocked,
    /// Slot is free or the task was halted.
    Suspended,
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Static configuration for a task, set at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Name used in log output.
    pub name: &'static str,

    /// Priority (higher = more important). The idle task runs at 0.
    pub priority: u8,
}

impl TaskConfig {
    pub const fn new(name: &'static str, priority: u8) -> Self {
        Self { name, priority }
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Per-task stack memory, aligned to 8 bytes as required by ARM AAPCS.
#[repr(C, align(8))]
pub struct TaskStack(pub [u8; STACK_SIZE]);

/// Task Control Block (TCB).
///
/// TCBs are stored in a fixed array in the scheduler; no heap allocation.
/// The `stack_pointer` field points into `stack` and is updated on every
/// context switch.
pub struct TaskControlBlock {
    /// Index in the scheduler's task array.
    pub id: usize,

    pub state: TaskState,

    pub config: TaskConfig,

    /// Saved stack pointer (PSP). Points into `self.stack`.
    pub stack_pointer: *mut u32,

    pub stack: TaskStack,

    /// Tick at which a `Delayed` or `Blocked` task becomes `Ready` again.
    pub wake_tick: u64,

    /// Signal a `Blocked` task waits for. Only compared, never dereferenced.
    pub blocked_on: *const SingleSlotSignal,

    /// Number of times this task was selected to run.
    pub activations: u32,

    /// Whether this slot holds a task.
    pub active: bool,
}

// Safety: `stack_pointer` only ever points into the TCB's own stack,
// `blocked_on` is never dereferenced, and TCBs are only touched inside
// critical sections or from PendSV.
unsafe impl Send for TaskControlBlock {}
unsafe impl Sync for TaskControlBlock {}

impl TaskControlBlock {
    /// Create an empty (unallocated) TCB. Used to initialize the static array.
    pub const fn empty() -> Self {
        Self {
            id: 0,
            state: TaskState::Suspended,
            config: TaskConfig::new("", 0),
            stack_pointer: core::ptr::null_mut(),
            stack: TaskStack([0u8; STACK_SIZE]),
            wake_tick: 0,
            blocked_on: core::ptr::null(),
            activations: 0,
            active: false,
        }
    }

    /// Initialize a TCB for a new task. The stack frame is set up
    /// separately by the scheduler.
    pub fn init(&mut self, id: usize, config: TaskConfig) {
        self.id = id;
        self.state = TaskState::Ready;
        self.config = config;
        self.wake_tick = 0;
        self.blocked_on = core::ptr::null();
        self.activations = 0;
        self.active = true;
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.active && self.state == TaskState::Ready
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    /// Put the task to sleep until `tick`.
    pub fn delay_until(&mut self, tick: u64) {
        self.state = TaskState::Delayed;
        self.wake_tick = tick;
    }

    /// Park the task on `signal`. It wakes when the signal is posted on
    /// this core or, failing that, at `recheck_tick`.
    pub fn block_on(&mut self, signal: &SingleSlotSignal, recheck_tick: u64) {
        self.state = TaskState::Blocked;
        self.blocked_on = signal as *const SingleSlotSignal;
        self.wake_tick = recheck_tick;
    }

    /// Make a delayed or blocked task ready once `now` reached its wake
    /// tick. Returns `true` if the task woke.
    pub fn wake_if_due(&mut self, now: u64) -> bool {
        let sleeping = matches!(self.state, TaskState::Delayed | TaskState::Blocked);
        if self.active && sleeping && now >= self.wake_tick {
            self.make_ready();
            true
        } else {
            false
        }
    }

    /// Make the task ready if it is blocked on `signal`.
    pub fn wake_if_blocked_on(&mut self, signal: &SingleSlotSignal) -> bool {
        if self.active
            && self.state == TaskState::Blocked
            && core::ptr::eq(self.blocked_on, signal)
        {
            self.make_ready();
            true
        } else {
            false
        }
    }

    fn make_ready(&mut self) {
        self.state = TaskState::Ready;
        self.blocked_on = core::ptr::null();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
