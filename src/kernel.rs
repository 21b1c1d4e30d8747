//! # Kernel
//!
//! Per-core kernel instances and the [`KernelPort`] that task code runs on.
//!
//! Every core runs its own [`Scheduler`] with its own SysTick and PendSV.
//! The only state cores share is what the [`System`](crate::system::System)
//! holds, and all of that is atomic.
//!
//! ## Startup Sequence (per core)
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► System::core_entry()  ← boot barrier, returns the core's role
//!         ├─► kernel::init()        ← idle task
//!         ├─► kernel::create_task() ← role tasks (×N)
//!         └─► kernel::start()       ← launch scheduler (no return)
//!               ├─► Configure SysTick
//!               ├─► Set interrupt priorities
//!               └─► Start first task via arch::start_first_task()
//! ```

use core::cell::UnsafeCell;

use crate::arch::cortex_m4;
use crate::config::{CORE_ID_ADDR, NUM_CORES, TICK_HZ, WAIT_RECHECK_MS};
use crate::context::Port;
use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::sync::{self, SingleSlotSignal};
use crate::task::TaskConfig;

// ---------------------------------------------------------------------------
// Per-core scheduler instances
// ---------------------------------------------------------------------------

struct CoreSchedulers([UnsafeCell<Scheduler>; NUM_CORES]);

// Safety: core `i` only ever touches entry `i`, and only inside a critical
// section on that core, from thread mode and handlers alike.
unsafe impl Sync for CoreSchedulers {}

static SCHEDULERS: CoreSchedulers =
    CoreSchedulers([const { UnsafeCell::new(Scheduler::new()) }; NUM_CORES]);

/// Number of the executing core.
#[inline]
pub fn core_id() -> u8 {
    // Safety: read-only board register, valid for the whole program.
    let id = unsafe { core::ptr::read_volatile(CORE_ID_ADDR as *const u32) };
    (id as usize % NUM_CORES) as u8
}

/// Scheduler of the executing core.
///
/// # Safety
/// Caller must be in a critical section on this core and must not hold the
/// reference past that.
unsafe fn local_scheduler() -> &'static mut Scheduler {
    &mut *SCHEDULERS.0[usize::from(core_id())].get()
}

/// Run `f` on this core's scheduler with its interrupts masked.
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    // Safety: interrupts on this core are masked for the duration of `f`.
    sync::critical_section(|_cs| f(unsafe { local_scheduler() }))
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Create the idle task of this core. Call once, before any other task.
pub fn init() -> Result<(), SchedError> {
    create_task(idle_task, TaskConfig::new("idle", 0)).map(|_| ())
}

/// Register a task with this core's scheduler. Returns its index.
pub fn create_task(entry: extern "C" fn() -> !, config: TaskConfig) -> Result<usize, SchedError> {
    let id = with_scheduler(|s| s.create_task(entry, config))?;
    log::debug!("core {}: task {} '{}' prio {}", core_id(), id, config.name, config.priority);
    Ok(id)
}

/// Start this core's scheduler. **Does not return.**
///
/// `peripherals` are the core-private ones (SysTick, NVIC, SCB) of the
/// calling core.
pub fn start(mut peripherals: cortex_m::Peripherals) -> ! {
    cortex_m4::configure_systick(&mut peripherals.SYST);
    cortex_m4::set_interrupt_priorities();

    let first_sp = with_scheduler(|s| {
        let first = s.schedule();
        s.tasks[first].stack_pointer as *const u32
    });

    // Safety: called once per core; `first_sp` is a frame built by
    // `create_task`, and `init` guarantees at least the idle task exists.
    unsafe { cortex_m4::start_first_task(first_sp) }
}

/// Block the calling task for `ticks` scheduler ticks.
pub fn delay(ticks: u32) {
    with_scheduler(|s| s.delay_current(ticks));
    cortex_m4::trigger_pendsv();
}

/// Take the calling task off the scheduler for good.
pub fn exit_task() -> ! {
    with_scheduler(|s| s.suspend_current());
    cortex_m4::trigger_pendsv();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Block the calling task on `signal`. Returns at once if a credit is
/// pending, otherwise once the signal is posted on this core or the recheck
/// interval passed.
pub fn block_on(signal: &SingleSlotSignal) {
    let recheck = ms_to_ticks(WAIT_RECHECK_MS);
    if with_scheduler(|s| s.block_current(signal, recheck)) {
        cortex_m4::trigger_pendsv();
    }
}

/// Make this core's tasks blocked on `signal` ready, and switch to one of
/// them if it outranks the caller. From an ISR the switch happens on return.
pub fn wake(signal: &SingleSlotSignal) {
    if with_scheduler(|s| s.wake_waiters(signal)) {
        cortex_m4::trigger_pendsv();
    }
}

fn ms_to_ticks(ms: u32) -> u32 {
    let ticks = (u64::from(ms) * u64::from(TICK_HZ)).div_ceil(1000);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// Milliseconds since this core's scheduler started.
pub fn now_ms() -> u64 {
    with_scheduler(|s| s.now_ms())
}

extern "C" fn idle_task() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// [`Port`] backed by the kernel of the calling core.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelPort;

impl Port for KernelPort {
    fn now_ms(&self) -> u64 {
        now_ms()
    }

    fn delay_ms(&self, ms: u32) {
        delay(ms_to_ticks(ms));
    }

    /// Sleeps one tick rather than yielding so that lower-priority tasks run
    /// while a higher-priority task polls.
    fn idle(&self) {
        delay(1);
    }

    fn spin(&self) {
        cortex_m::asm::wfe();
    }

    fn notify_cores(&self) {
        cortex_m::asm::sev();
    }

    fn pend_yield(&self) {
        cortex_m4::trigger_pendsv();
    }

    fn block_on(&self, signal: &SingleSlotSignal) {
        block_on(signal);
    }

    fn wake(&self, signal: &SingleSlotSignal) {
        wake(signal);
    }
}
