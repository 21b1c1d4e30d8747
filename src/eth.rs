//! # Deferred ETH Interrupt Handoff
//!
//! The Ethernet ISR runs above every task and does the minimum:
//!
//! 1. read the pending DMA status flags,
//! 2. clear exactly the flags it observed (unknown flags included, or the
//!    line would re-fire forever and starve every task),
//! 3. for receive-ready, post the receive signal, which readies the blocked
//!    receive task, and request a reschedule so it runs as the ISR returns.
//!
//! The actual frame processing happens in [`rx_deferred_task`], which runs
//! at the highest task priority on the core:
//!
//! ```text
//!   ISR (RI) ──signal──► [pending] ──wait──► rx task: drain everything
//!   ISR (RI) ──signal──► [pending] (absorbed; same drain picks it up)
//! ```
//!
//! Because the signal holds a single credit, several interrupts that land
//! before the task runs collapse into one wake. The task therefore drains
//! the hardware queue until it is empty rather than handling one frame per
//! wake.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::context::{InterruptContext, TaskContext};
use crate::error::Cancelled;
use crate::sync::SingleSlotSignal;

bitflags! {
    /// DMA status register bits of the Ethernet MAC (Synopsys GMAC layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EthStatus: u32 {
        /// Transmit complete (TI).
        const TRANSMIT_DONE = 1 << 0;
        /// Transmit buffer unavailable (TU).
        const TRANSMIT_UNDERRUN = 1 << 2;
        /// Receive complete (RI).
        const RECEIVE_READY = 1 << 6;
    }
}

/// Hardware boundary of the interrupt path.
pub trait EthInterruptRegs: Sync {
    /// Pending status bits, including ones this driver does not know.
    fn pending(&self) -> EthStatus;

    /// Clear exactly `flags`. Bits not in `flags` must stay untouched.
    fn clear(&self, flags: EthStatus);
}

/// Digital output pin (LED).
pub trait DigitalOutput: Sync {
    fn set(&self, on: bool);
    fn toggle(&self);
}

/// Event classified from one status flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptEvent {
    ReceiveReady,
    TransmitDone,
    TransmitUnderrun,
}

impl InterruptEvent {
    const ALL: [InterruptEvent; 3] = [
        InterruptEvent::ReceiveReady,
        InterruptEvent::TransmitDone,
        InterruptEvent::TransmitUnderrun,
    ];

    /// Status flag this event is derived from.
    pub const fn flag(self) -> EthStatus {
        match self {
            InterruptEvent::ReceiveReady => EthStatus::RECEIVE_READY,
            InterruptEvent::TransmitDone => EthStatus::TRANSMIT_DONE,
            InterruptEvent::TransmitUnderrun => EthStatus::TRANSMIT_UNDERRUN,
        }
    }

    /// Events present in `status`, receive first.
    pub fn classify(status: EthStatus) -> impl Iterator<Item = InterruptEvent> {
        Self::ALL.into_iter().filter(move |ev| status.contains(ev.flag()))
    }
}

/// What one ISR invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsrOutcome {
    /// Every flag cleared, known or not.
    pub cleared: EthStatus,
    /// Flags with no handling path.
    pub unhandled: EthStatus,
    /// The receive task was woken (no credit was pending before).
    pub woke_rx: bool,
}

/// Running totals, readable from any context.
#[derive(Debug, Default)]
pub struct IrqCounters {
    pub invocations: AtomicU32,
    pub receive: AtomicU32,
    pub transmit_done: AtomicU32,
    pub transmit_underrun: AtomicU32,
    pub unhandled: AtomicU32,
    pub coalesced: AtomicU32,
}

impl IrqCounters {
    pub const fn new() -> Self {
        Self {
            invocations: AtomicU32::new(0),
            receive: AtomicU32::new(0),
            transmit_done: AtomicU32::new(0),
            transmit_underrun: AtomicU32::new(0),
            unhandled: AtomicU32::new(0),
            coalesced: AtomicU32::new(0),
        }
    }
}

/// State the ETH ISR needs, bundled so it can be registered once.
pub struct EthIrqHandler<'a> {
    rx_ready: &'a SingleSlotSignal,
    activity_led: Option<&'a dyn DigitalOutput>,
    counters: &'a IrqCounters,
}

impl<'a> EthIrqHandler<'a> {
    pub fn new(rx_ready: &'a SingleSlotSignal, counters: &'a IrqCounters) -> Self {
        Self {
            rx_ready,
            activity_led: None,
            counters,
        }
    }

    /// Toggle `led` on every receive interrupt.
    pub fn with_activity_led(mut self, led: &'a dyn DigitalOutput) -> Self {
        self.activity_led = Some(led);
        self
    }

    /// Interrupt entry. Bounded work, no allocation, no blocking.
    pub fn on_interrupt(&self, irq: &InterruptContext<'_>, regs: &dyn EthInterruptRegs) -> IsrOutcome {
        let pending = regs.pending();
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let mut woke_rx = false;
        for event in InterruptEvent::classify(pending) {
            regs.clear(event.flag());
            match event {
                InterruptEvent::ReceiveReady => {
                    self.counters.receive.fetch_add(1, Ordering::Relaxed);
                    if let Some(led) = self.activity_led {
                        led.toggle();
                    }
                    woke_rx = irq.signal(self.rx_ready);
                    if woke_rx {
                        irq.request_yield();
                    } else {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                }
                InterruptEvent::TransmitDone => {
                    self.counters.transmit_done.fetch_add(1, Ordering::Relaxed);
                }
                InterruptEvent::TransmitUnderrun => {
                    self.counters.transmit_underrun.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Nothing to do for these, but leaving them set re-enters the ISR
        // immediately.
        let unhandled = pending.difference(EthStatus::all());
        if !unhandled.is_empty() {
            regs.clear(unhandled);
            self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
        }

        IsrOutcome {
            cleared: pending,
            unhandled,
            woke_rx,
        }
    }
}

/// Receive-side work the deferred task performs on every wake.
pub trait RxDrain {
    /// Process everything the hardware currently holds. Returns the number
    /// of frames handled.
    fn drain(&self, now_ms: u64) -> usize;
}

/// Body of the deferred receive task: wait for the ISR, drain, repeat.
///
/// Returns only when cancelled.
pub fn rx_deferred_task<D: RxDrain + ?Sized>(
    ctx: &TaskContext<'_>,
    rx_ready: &SingleSlotSignal,
    rx: &D,
) -> Result<(), Cancelled> {
    log::info!("{}: deferred receive task running", ctx.name());
    loop {
        ctx.wait(rx_ready)?;
        let frames = rx.drain(ctx.now_ms());
        log::trace!("{}: drained {} frame(s)", ctx.name(), frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StepPort;
    use crate::sync::CancelToken;
    use std::sync::Mutex;

    struct FakeRegs {
        status: AtomicU32,
        clears: Mutex<std::vec::Vec<u32>>,
    }

    impl FakeRegs {
        fn new(bits: u32) -> Self {
            Self {
                status: AtomicU32::new(bits),
                clears: Mutex::new(std::vec::Vec::new()),
            }
        }
    }

    impl EthInterruptRegs for FakeRegs {
        fn pending(&self) -> EthStatus {
            EthStatus::from_bits_retain(self.status.load(Ordering::Acquire))
        }

        fn clear(&self, flags: EthStatus) {
            self.clears.lock().unwrap().push(flags.bits());
            self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
    }

    struct CountingLed(AtomicU32);

    impl DigitalOutput for CountingLed {
        fn set(&self, _on: bool) {}
        fn toggle(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_classify_order() {
        let all: std::vec::Vec<_> = InterruptEvent::classify(EthStatus::all()).collect();
        assert_eq!(
            all,
            [
                InterruptEvent::ReceiveReady,
                InterruptEvent::TransmitDone,
                InterruptEvent::TransmitUnderrun
            ]
        );
        assert_eq!(InterruptEvent::classify(EthStatus::empty()).count(), 0);
    }

    #[test]
    fn test_rx_interrupt_signals_and_clears_only_rx() {
        let port = StepPort::new();
        let signal = SingleSlotSignal::new();
        let counters = IrqCounters::new();
        let led = CountingLed(AtomicU32::new(0));
        let handler = EthIrqHandler::new(&signal, &counters).with_activity_led(&led);
        let regs = FakeRegs::new(EthStatus::RECEIVE_READY.bits());

        let out = handler.on_interrupt(&InterruptContext::new(&port), &regs);

        assert!(out.woke_rx);
        assert!(signal.is_pending());
        assert_eq!(out.cleared, EthStatus::RECEIVE_READY);
        assert_eq!(*regs.clears.lock().unwrap(), [EthStatus::RECEIVE_READY.bits()]);
        assert_eq!(regs.status.load(Ordering::Acquire), 0);
        assert_eq!(led.0.load(Ordering::Relaxed), 1);
        assert_eq!(port.yields.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_tx_flags_cleared_without_wake() {
        let port = StepPort::new();
        let signal = SingleSlotSignal::new();
        let counters = IrqCounters::new();
        let handler = EthIrqHandler::new(&signal, &counters);
        let bits = (EthStatus::TRANSMIT_DONE | EthStatus::TRANSMIT_UNDERRUN).bits();
        let regs = FakeRegs::new(bits);

        let out = handler.on_interrupt(&InterruptContext::new(&port), &regs);

        assert!(!out.woke_rx);
        assert!(!signal.is_pending());
        assert_eq!(regs.status.load(Ordering::Acquire), 0);
        assert_eq!(counters.transmit_done.load(Ordering::Relaxed), 1);
        assert_eq!(counters.transmit_underrun.load(Ordering::Relaxed), 1);
        assert_eq!(port.yields.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_unknown_flags_are_cleared() {
        let port = StepPort::new();
        let signal = SingleSlotSignal::new();
        let counters = IrqCounters::new();
        let handler = EthIrqHandler::new(&signal, &counters);
        let unknown = 1 << 13;
        let regs = FakeRegs::new(unknown | EthStatus::TRANSMIT_DONE.bits());

        let out = handler.on_interrupt(&InterruptContext::new(&port), &regs);

        assert_eq!(out.unhandled.bits(), unknown);
        assert_eq!(regs.status.load(Ordering::Acquire), 0);
        assert_eq!(counters.unhandled.load(Ordering::Relaxed), 1);
        // Known and unknown bits cleared separately, nothing beyond them
        assert_eq!(
            *regs.clears.lock().unwrap(),
            [EthStatus::TRANSMIT_DONE.bits(), unknown]
        );
    }

    #[test]
    fn test_flags_raised_later_survive() {
        let port = StepPort::new();
        let signal = SingleSlotSignal::new();
        let counters = IrqCounters::new();
        let handler = EthIrqHandler::new(&signal, &counters);
        let regs = FakeRegs::new(EthStatus::TRANSMIT_DONE.bits());

        handler.on_interrupt(&InterruptContext::new(&port), &regs);
        regs.status.fetch_or(EthStatus::RECEIVE_READY.bits(), Ordering::AcqRel);
        // A frame that arrived after the read must still be pending
        assert_eq!(regs.pending(), EthStatus::RECEIVE_READY);
    }

    #[test]
    fn test_back_to_back_rx_interrupts_coalesce() {
        let port = StepPort::new();
        let signal = SingleSlotSignal::new();
        let counters = IrqCounters::new();
        let handler = EthIrqHandler::new(&signal, &counters);
        let irq = InterruptContext::new(&port);

        for _ in 0..3 {
            let regs = FakeRegs::new(EthStatus::RECEIVE_READY.bits());
            handler.on_interrupt(&irq, &regs);
        }

        assert_eq!(counters.receive.load(Ordering::Relaxed), 3);
        assert_eq!(counters.coalesced.load(Ordering::Relaxed), 2);
        // One waiter wake and one yield for the whole burst.
        assert_eq!(port.wakes.load(Ordering::Acquire), 1);
        assert_eq!(port.yields.load(Ordering::Acquire), 1);
        assert!(signal.try_take());
        assert!(!signal.try_take());
    }

    struct OneShotDrain {
        cancel: CancelToken,
        calls: AtomicU32,
    }

    impl RxDrain for OneShotDrain {
        fn drain(&self, _now_ms: u64) -> usize {
            self.calls.fetch_add(1, Ordering::AcqRel);
            self.cancel.cancel();
            0
        }
    }

    #[test]
    fn test_deferred_task_drains_once_per_wake() {
        let port = StepPort::new();
        let signal = SingleSlotSignal::new();
        let drain = OneShotDrain {
            cancel: CancelToken::new(),
            calls: AtomicU32::new(0),
        };
        signal.signal();
        signal.signal();

        let ctx = TaskContext::new("eth_rx", &port, &drain.cancel);
        assert_eq!(rx_deferred_task(&ctx, &signal, &drain), Err(Cancelled));
        assert_eq!(drain.calls.load(Ordering::Acquire), 1);
    }
}
