//! # Scheduler
//!
//! Preemptive fixed-priority scheduler, one instance per core.
//!
//! ## Scheduling Algorithm
//!
//! At each SysTick interrupt:
//! 1. **Advance time**: increment the tick counter
//! 2. **Wake sleepers**: every `Delayed` or `Blocked` task whose wake tick
//!    passed becomes `Ready`
//! 3. **Preempt**: if a woken task outranks the running one, request a
//!    reschedule (PendSV)
//!
//! A task waiting for a signal is `Blocked` on it. Posting the signal on the
//! same core, from a task or an ISR, makes the waiter `Ready` right away
//! through [`Scheduler::wake_waiters`], so the PendSV that follows already
//! sees it.
//!
//! On every reschedule the highest-priority ready task runs. Tasks of equal
//! priority take turns, starting after the one that ran last. The idle task
//! at index 0 runs when nothing else is ready.

use crate::config::{MAX_TASKS, STACK_SIZE, TICK_HZ};
use crate::error::SchedError;
use crate::sync::SingleSlotSignal;
use crate::task::{TaskConfig, TaskControlBlock, TaskState};

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Scheduler state of one core: its task control blocks and tick count.
///
/// - All tasks are stored inline in a fixed-size array (no heap)
/// - `current_task` tracks the index of the currently running task
/// - Index 0 is the idle task once the kernel created it
pub struct Scheduler {
    /// Fixed-size array of TCBs. Index 0 is reserved for the idle task.
    pub tasks: [TaskControlBlock; MAX_TASKS],

    /// Index of the currently running task.
    pub current_task: usize,

    /// Number of allocated tasks (including idle task).
    pub task_count: usize,

    /// Monotonic tick counter.
    pub tick_count: u64,

    /// Set when a context switch should happen at the next opportunity.
    pub needs_reschedule: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [const { TaskControlBlock::empty() }; MAX_TASKS],
            current_task: 0,
            task_count: 0,
            tick_count: 0,
            needs_reschedule: false,
        }
    }

    /// Register a new task. Returns its index.
    pub fn create_task(
        &mut self,
        entry: extern "C" fn() -> !,
        config: TaskConfig,
    ) -> Result<usize, SchedError> {
        if self.task_count >= MAX_TASKS {
            return Err(SchedError::TableFull(MAX_TASKS));
        }

        let id = self.task_count;
        self.tasks[id].init(id, config);

        // Initialize the stack frame for context switching
        init_task_stack(&mut self.tasks[id], entry);

        self.task_count += 1;
        Ok(id)
    }

    /// Called from the SysTick handler every tick.
    pub fn tick(&mut self) {
        self.tick_count += 1;

        let now = self.tick_count;
        let running = self.running_priority();
        for task in self.tasks[..self.task_count].iter_mut() {
            if task.wake_if_due(now) && running.map_or(true, |p| task.priority() > p) {
                self.needs_reschedule = true;
            }
        }
    }

    /// Milliseconds since the scheduler started ticking.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.tick_count * 1000 / u64::from(TICK_HZ)
    }

    /// Select the next task to run and mark it `Running`.
    ///
    /// Among ready tasks of the highest priority, the first one after the
    /// current task (in table order, wrapping) wins. Falls back to the idle
    /// task at index 0.
    pub fn schedule(&mut self) -> usize {
        let prev = self.current_task;
        if prev < self.task_count && self.tasks[prev].state == TaskState::Running {
            self.tasks[prev].state = TaskState::Ready;
        }

        let mut best_task: Option<usize> = None;
        for offset in 1..=self.task_count {
            let i = (prev + offset) % self.task_count;
            let task = &self.tasks[i];
            if !task.is_runnable() {
                continue;
            }
            if best_task.map_or(true, |b| task.priority() > self.tasks[b].priority()) {
                best_task = Some(i);
            }
        }

        let next = best_task.unwrap_or(0);
        if next < self.task_count {
            self.tasks[next].state = TaskState::Running;
            self.tasks[next].activations = self.tasks[next].activations.wrapping_add(1);
        }

        self.current_task = next;
        self.needs_reschedule = false;
        next
    }

    /// Put the current task to sleep for `ticks`. Zero ticks is a yield.
    pub fn delay_current(&mut self, ticks: u32) {
        if ticks == 0 {
            self.yield_current();
            return;
        }
        let current = self.current_task;
        if current < self.task_count && self.tasks[current].active {
            let wake = self.tick_count + u64::from(ticks);
            self.tasks[current].delay_until(wake);
            self.needs_reschedule = true;
        }
    }

    /// Give up the processor to another ready task of equal priority.
    pub fn yield_current(&mut self) {
        let current = self.current_task;
        if current < self.task_count && self.tasks[current].active {
            self.tasks[current].state = TaskState::Ready;
            self.needs_reschedule = true;
        }
    }

    /// Park the current task until `signal` is posted, or for at most
    /// `recheck_ticks`. Returns `false` and leaves the task running when a
    /// credit is already pending.
    ///
    /// Must run with this core's interrupts masked, so that a post cannot
    /// slip in between the check and the park.
    pub fn block_current(&mut self, signal: &SingleSlotSignal, recheck_ticks: u32) -> bool {
        if signal.is_pending() {
            return false;
        }
        let current = self.current_task;
        if current >= self.task_count || !self.tasks[current].active {
            return false;
        }
        let recheck = self.tick_count + u64::from(recheck_ticks.max(1));
        self.tasks[current].block_on(signal, recheck);
        self.needs_reschedule = true;
        true
    }

    /// Make every task blocked on `signal` ready. Returns `true` if one of
    /// them outranks the running task, in which case a reschedule is due.
    pub fn wake_waiters(&mut self, signal: &SingleSlotSignal) -> bool {
        let running = self.running_priority();
        let mut preempt = false;
        for task in self.tasks[..self.task_count].iter_mut() {
            if task.wake_if_blocked_on(signal) && running.map_or(true, |p| task.priority() > p) {
                preempt = true;
            }
        }
        if preempt {
            self.needs_reschedule = true;
        }
        preempt
    }

    /// Halt the current task for good.
    pub fn suspend_current(&mut self) {
        let current = self.current_task;
        if current < self.task_count {
            self.tasks[current].state = TaskState::Suspended;
            self.needs_reschedule = true;
        }
    }

    /// Get a reference to the current task's TCB.
    pub fn current_tcb(&self) -> &TaskControlBlock {
        &self.tasks[self.current_task]
    }

    fn running_priority(&self) -> Option<u8> {
        self.tasks[..self.task_count]
            .get(self.current_task)
            .filter(|t| t.state == TaskState::Running)
            .map(TaskControlBlock::priority)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stack initialization helper
// ---------------------------------------------------------------------------

/// Initialize a task's stack frame for first-time context switch.
///
/// The Cortex-M4 hardware automatically pushes an exception frame on
/// interrupt entry. We pre-populate this frame on the task's stack so
/// that the first PendSV "return" starts executing the task function.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]   <- initial PSP points here
///   xPSR  (Thumb bit set)
///   PC    (task entry point)
///   LR    (task_exit)
///   R12   (0)
///   R3    (0)
///   R2    (0)
///   R1    (0)
///   R0    (0)
/// [Software saved context]
///   R11   (0)
///   R10   (0)
///   R9    (0)
///   R8    (0)
///   R7    (0)
///   R6    (0)
///   R5    (0)
///   R4    (0)              <- stack_pointer after init
/// ```
fn init_task_stack(tcb: &mut TaskControlBlock, entry: extern "C" fn() -> !) {
    let stack_top = tcb.stack.0.as_mut_ptr() as usize + STACK_SIZE;
    // Align to 8 bytes (AAPCS requirement)
    let aligned_top = stack_top & !0x07;

    // We need space for 16 registers (8 HW + 8 SW)
    let frame_ptr = (aligned_top - FRAME_WORDS * 4) as *mut u32;

    // Safety: the frame lies inside `tcb.stack`, which is at least
    // `FRAME_WORDS` words long and 8-byte aligned.
    unsafe {
        // Software-saved registers (R4–R11) and R0–R3, R12
        for i in 0..13 {
            *frame_ptr.add(i) = 0;
        }
        *frame_ptr.add(13) = task_exit as usize as u32; // LR: return address if task returns
        *frame_ptr.add(14) = entry as usize as u32; // PC: task entry point
        *frame_ptr.add(15) = XPSR_THUMB; // xPSR: Thumb bit set
    }

    tcb.stack_pointer = frame_ptr;
}

/// Words in the initial frame: 8 software-saved plus 8 hardware-stacked.
const FRAME_WORDS: usize = 16;

const XPSR_THUMB: u32 = 0x0100_0000;

/// Fallback for tasks that return (they should not; entry is `fn() -> !`).
extern "C" fn task_exit() -> ! {
    loop {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::wfi();
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        core::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
