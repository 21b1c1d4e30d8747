//! # Execution Contexts
//!
//! Task code and interrupt code get different handles so that blocking from
//! an ISR is a type error rather than a convention:
//!
//! | Operation        | [`TaskContext`] | [`InterruptContext`] |
//! |------------------|-----------------|----------------------|
//! | post a signal    | yes             | yes                  |
//! | wait on a signal | yes             | no                   |
//! | sleep            | yes             | no                   |
//! | request resched  | no              | yes                  |
//!
//! Both sit on a [`Port`], the seam to whatever actually runs the code: the
//! per-core kernel on hardware, OS threads in the host simulation.

use crate::config::SLEEP_SLICE_MS;
use crate::error::Cancelled;
use crate::sync::{CancelToken, SingleSlotSignal};

/// Execution environment of one core.
pub trait Port: Sync {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;

    /// Suspend the calling task for `ms` milliseconds.
    fn delay_ms(&self, ms: u32);

    /// Give the processor away briefly from task context so lower-priority
    /// tasks can run.
    fn idle(&self);

    /// Wait for another core before the scheduler runs. Must not starve the
    /// other cores.
    fn spin(&self);

    /// Wake cores parked in [`Port::spin`].
    fn notify_cores(&self);

    /// Request a reschedule once the current ISR returns. Must not block.
    fn pend_yield(&self);

    /// Park the calling task until `signal` may hold a credit. Returning
    /// early is allowed; the caller checks the signal again.
    fn block_on(&self, _signal: &SingleSlotSignal) {
        self.idle();
    }

    /// Make tasks parked on `signal` runnable after it was posted. Called
    /// from task and interrupt context alike, so it must not block.
    fn wake(&self, _signal: &SingleSlotSignal) {}
}

/// Handle passed to every task body. Exposes the blocking operations.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    port: &'a dyn Port,
    cancel: &'a CancelToken,
    name: &'static str,
}

impl<'a> TaskContext<'a> {
    pub fn new(name: &'static str, port: &'a dyn Port, cancel: &'a CancelToken) -> Self {
        Self { port, cancel, name }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.port.now_ms()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    fn check(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Post `signal` without blocking. Returns `false` if a credit was
    /// already pending and this one was absorbed.
    pub fn signal(&self, signal: &SingleSlotSignal) -> bool {
        post(self.port, signal)
    }

    /// Block until `signal` holds a credit, then consume it.
    pub fn wait(&self, signal: &SingleSlotSignal) -> Result<(), Cancelled> {
        loop {
            self.check()?;
            if signal.try_take() {
                return Ok(());
            }
            self.port.block_on(signal);
        }
    }

    /// Sleep for `ms` milliseconds, waking early only to honour cancellation.
    pub fn sleep_ms(&self, ms: u32) -> Result<(), Cancelled> {
        let mut remaining = ms;
        loop {
            self.check()?;
            if remaining == 0 {
                return Ok(());
            }
            let slice = remaining.min(SLEEP_SLICE_MS);
            self.port.delay_ms(slice);
            remaining -= slice;
        }
    }

    /// One round of giving the processor away, for polling loops such as a
    /// blocking receive.
    pub fn relax(&self) -> Result<(), Cancelled> {
        self.check()?;
        self.port.idle();
        Ok(())
    }
}

/// Handle passed to interrupt handlers. Only non-blocking operations.
#[derive(Clone, Copy)]
pub struct InterruptContext<'a> {
    port: &'a dyn Port,
}

impl<'a> InterruptContext<'a> {
    pub fn new(port: &'a dyn Port) -> Self {
        Self { port }
    }

    /// Post `signal`. Returns `true` when this post woke the waiter, i.e.
    /// no credit was pending before.
    #[inline]
    pub fn signal(&self, signal: &SingleSlotSignal) -> bool {
        post(self.port, signal)
    }

    /// Ask the scheduler to run the highest-priority ready task as soon as
    /// this handler returns.
    #[inline]
    pub fn request_yield(&self) {
        self.port.pend_yield();
    }
}

fn post(port: &dyn Port, signal: &SingleSlotSignal) -> bool {
    let posted = signal.signal();
    if posted {
        port.wake(signal);
    }
    posted
}


#[cfg(test)]
mod tests {
    use super::testing::StepPort;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_wait_consumes_pending_credit() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let ctx = TaskContext::new("t", &port, &cancel);
        let signal = SingleSlotSignal::new();

        assert!(ctx.signal(&signal));
        assert_eq!(ctx.wait(&signal), Ok(()));
        assert!(!signal.is_pending());
        assert_eq!(port.idles.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_wait_returns_on_cancel() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = TaskContext::new("t", &port, &cancel);
        let signal = SingleSlotSignal::new();
        assert_eq!(ctx.wait(&signal), Err(Cancelled));
    }

    #[test]
    fn test_wait_blocks_until_isr_signals() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let signal = SingleSlotSignal::new();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| TaskContext::new("rx", &port, &cancel).wait(&signal));
            while port.idles.load(Ordering::Acquire) < 3 {
                std::thread::yield_now();
            }
            let irq = InterruptContext::new(&port);
            assert!(irq.signal(&signal));
            irq.request_yield();
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
        assert_eq!(port.yields.load(Ordering::Acquire), 1);
        assert_eq!(port.wakes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_absorbed_post_wakes_nobody() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let ctx = TaskContext::new("producer", &port, &cancel);
        let irq = InterruptContext::new(&port);
        let signal = SingleSlotSignal::new();

        assert!(ctx.signal(&signal));
        assert!(!ctx.signal(&signal));
        assert!(!irq.signal(&signal));
        assert_eq!(port.wakes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_sleep_advances_in_slices() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let ctx = TaskContext::new("t", &port, &cancel);
        assert_eq!(ctx.sleep_ms(25), Ok(()));
        assert_eq!(ctx.now_ms(), 25);
        assert_eq!(ctx.sleep_ms(0), Ok(()));
        assert_eq!(ctx.now_ms(), 25);
    }
}
