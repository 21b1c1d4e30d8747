//! # Cortex-M4 Port
//!
//! Exception handlers and core registers behind the per-core kernel. Each
//! core takes its own PendSV and SysTick and resolves them against its own
//! scheduler, so nothing here is shared between cores.
//!
//! ## Stacks
//!
//! Handlers run on MSP, tasks on PSP. Exception entry pushes the caller-saved
//! half of the register file (R0-R3, R12, LR, PC, xPSR) to PSP in hardware;
//! PendSV adds R4-R11 below that frame, which is exactly the layout
//! `scheduler::init_task_stack` prepares for a fresh task.
//!
//! ## Priorities
//!
//! | Source  | Priority               |
//! |---------|------------------------|
//! | ETH     | `ISR_PRIORITY_ETH_IRQ` |
//! | SysTick | 0xFF                   |
//! | PendSV  | 0xFF                   |
//!
//! PendSV therefore never preempts the ETH ISR, and a yield the ISR requests
//! is taken right after it returns.

use core::arch::naked_asm;

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{NVIC, SYST};

use crate::config::{ETH_IRQ_NUMBER, ISR_PRIORITY_ETH_IRQ, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel;

/// Interrupt control and state register.
const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
const ICSR_PENDSVSET: u32 = 1 << 28;

/// System handler priority register 3: PendSV in [23:16], SysTick in [31:24].
const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;

/// Start the kernel tick at `TICK_HZ` off the core clock.
pub fn configure_systick(syst: &mut SYST) {
    syst.set_reload(SYSTEM_CLOCK_HZ / TICK_HZ - 1);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Pend a context switch on this core. Callable from tasks and handlers
/// alike; the switch runs once no other handler is active.
#[inline]
pub fn trigger_pendsv() {
    // Safety: PENDSVSET is a write-one-to-set bit, other bits ignore zeros.
    unsafe { core::ptr::write_volatile(ICSR, ICSR_PENDSVSET) }
}

/// Drop PendSV and SysTick to the lowest priority.
pub fn set_interrupt_priorities() {
    // Safety: read-modify-write of this core's banked SHPR3.
    unsafe {
        let shpr3 = core::ptr::read_volatile(SHPR3);
        core::ptr::write_volatile(SHPR3, shpr3 | (0xFF << 16) | (0xFF << 24));
    }
}

#[derive(Debug, Clone, Copy)]
struct EthIrq;

// Safety: the Ethernet global interrupt line of the device.
unsafe impl InterruptNumber for EthIrq {
    fn number(self) -> u16 {
        ETH_IRQ_NUMBER
    }
}

/// Route the ETH interrupt to this core above every task and enable it.
pub fn enable_eth_irq(nvic: &mut NVIC) {
    // Safety: the handler only touches atomics and the MAC status register,
    // so unmasking it cannot break a critical section's invariants.
    unsafe {
        nvic.set_priority(EthIrq, ISR_PRIORITY_ETH_IRQ);
        NVIC::unmask(EthIrq);
    }
}

/// Whether `irqn`, as passed to `DefaultHandler`, is the ETH interrupt.
#[inline]
pub fn is_eth_irq(irqn: i16) -> bool {
    irqn == ETH_IRQ_NUMBER as i16
}

/// Enter the first task of this core and never come back to MSP code.
///
/// # Safety
/// Call once per core with a stack pointer set up by the scheduler, with
/// interrupts disabled.
pub unsafe fn start_first_task(psp: *const u32) -> ! {
    core::arch::asm!(
        // Skip the R4-R11 area, nothing to restore for a fresh task.
        "adds r0, #32",
        "msr psp, r0",
        // Thread mode on PSP.
        "movs r0, #2",
        "msr control, r0",
        "isb",
        // Unwind the fake exception frame by hand.
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",
        "pop {{r5}}",
        "pop {{r6}}",
        "cpsie i",
        "bx r5",
        in("r0") psp,
        options(noreturn)
    );
}

/// Context switch: push R4-R11 of the outgoing task, record its PSP, pick
/// the next task, pop its R4-R11 and return to it on PSP.
#[no_mangle]
#[unsafe(naked)]
pub extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {save}",
        "bl {next}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // EXC_RETURN: thread mode, PSP.
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        save = sym save_outgoing,
        next = sym select_incoming,
    );
}

// The ETH ISR wakes tasks and outranks PendSV and SysTick, so both go
// through the critical section like thread code does.

extern "C" fn save_outgoing(psp: *mut u32) {
    kernel::with_scheduler(|s| {
        let current = s.current_task;
        if current < s.task_count {
            s.tasks[current].stack_pointer = psp;
        }
    })
}

extern "C" fn select_incoming() -> *mut u32 {
    kernel::with_scheduler(|s| {
        let next = s.schedule();
        s.tasks[next].stack_pointer
    })
}

/// Kernel tick.
#[no_mangle]
pub extern "C" fn SysTick() {
    let reschedule = kernel::with_scheduler(|s| {
        s.tick();
        s.needs_reschedule
    });
    if reschedule {
        trigger_pendsv();
    }
}
