//! # Rate Gate
//!
//! A fast periodic task posts one credit every `divisor` cycles to a
//! [`SingleSlotSignal`]; a slow task waits for a credit once per cycle.
//!
//! The producer never blocks. When it posts while a credit is still
//! pending, the post is absorbed and counted in [`GateStats::absorbed`]
//! instead of queueing. The consumer therefore runs no faster than credits
//! arrive, but a slow consumer does not throttle the producer.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{RATE_CONSUMER_PERIOD_MS, RATE_DIVISOR, RATE_PRODUCER_PERIOD_MS};
use crate::context::TaskContext;
use crate::error::Cancelled;
use crate::eth::DigitalOutput;
use crate::sync::SingleSlotSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateGateConfig {
    pub producer_period_ms: u32,
    /// Credit is posted on every `divisor`-th producer cycle.
    pub divisor: u32,
    pub consumer_period_ms: u32,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            producer_period_ms: RATE_PRODUCER_PERIOD_MS,
            divisor: RATE_DIVISOR,
            consumer_period_ms: RATE_CONSUMER_PERIOD_MS,
        }
    }
}

/// Counters shared by both sides of the gate.
#[derive(Debug, Default)]
pub struct GateStats {
    pub producer_cycles: AtomicU32,
    /// Posts that raised a credit.
    pub posted: AtomicU32,
    /// Posts that found a credit pending and were coalesced into it.
    pub absorbed: AtomicU32,
    pub consumed: AtomicU32,
}

impl GateStats {
    pub const fn new() -> Self {
        Self {
            producer_cycles: AtomicU32::new(0),
            posted: AtomicU32::new(0),
            absorbed: AtomicU32::new(0),
            consumed: AtomicU32::new(0),
        }
    }
}

/// Producer-side cycle counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Producer {
    cycle: u32,
    divisor: u32,
}

impl Producer {
    /// A `divisor` of 0 is treated as 1.
    pub const fn new(divisor: u32) -> Self {
        Self {
            cycle: 0,
            divisor: if divisor == 0 { 1 } else { divisor },
        }
    }

    #[inline]
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Advance one cycle. Returns `true` on cycles that post a credit.
    pub fn tick(&mut self) -> bool {
        self.cycle = self.cycle.wrapping_add(1);
        self.cycle % self.divisor == 0
    }
}

/// Fast task body. Returns only when cancelled.
pub fn producer_task(
    ctx: &TaskContext<'_>,
    gate: &SingleSlotSignal,
    cfg: &RateGateConfig,
    stats: &GateStats,
) -> Result<(), Cancelled> {
    let mut producer = Producer::new(cfg.divisor);
    loop {
        stats.producer_cycles.fetch_add(1, Ordering::Relaxed);
        if producer.tick() {
            if ctx.signal(gate) {
                stats.posted.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.absorbed.fetch_add(1, Ordering::Relaxed);
                log::trace!("{}: credit absorbed at cycle {}", ctx.name(), producer.cycle());
            }
        }
        ctx.sleep_ms(cfg.producer_period_ms)?;
    }
}

/// Slow task body. Waits for a credit, toggles `led`, sleeps. Returns only
/// when cancelled.
pub fn consumer_task(
    ctx: &TaskContext<'_>,
    gate: &SingleSlotSignal,
    cfg: &RateGateConfig,
    stats: &GateStats,
    led: Option<&dyn DigitalOutput>,
) -> Result<(), Cancelled> {
    loop {
        ctx.wait(gate)?;
        let n = stats.consumed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(led) = led {
            led.toggle();
        }
        log::debug!("{}: credit #{}", ctx.name(), n);
        ctx.sleep_ms(cfg.consumer_period_ms)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StepPort;
    use crate::context::Port;
    use crate::sync::CancelToken;

    #[test]
    fn test_producer_posts_every_kth_cycle() {
        let mut p = Producer::new(5);
        let mut posts = std::vec::Vec::new();
        for _ in 0..12 {
            if p.tick() {
                posts.push(p.cycle());
            }
        }
        assert_eq!(posts, [5, 10]);
        assert!(Producer::new(0).tick());
    }

    #[test]
    fn test_k_signals_before_wait_yield_one_credit() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let ctx = TaskContext::new("gate", &port, &cancel);
        let gate = SingleSlotSignal::new();

        let fresh: usize = (0..7).filter(|_| ctx.signal(&gate)).count();
        assert_eq!(fresh, 1);
        assert_eq!(ctx.wait(&gate), Ok(()));
        assert!(!gate.is_pending());
    }

    /// Port that cancels its token once the clock reaches `until_ms`.
    struct TimedPort {
        inner: StepPort,
        cancel: CancelToken,
        until_ms: u64,
    }

    impl Port for TimedPort {
        fn now_ms(&self) -> u64 {
            self.inner.now_ms()
        }
        fn delay_ms(&self, ms: u32) {
            self.inner.delay_ms(ms);
            if self.inner.now_ms() >= self.until_ms {
                self.cancel.cancel();
            }
        }
        fn idle(&self) {
            self.inner.idle()
        }
        fn spin(&self) {}
        fn notify_cores(&self) {}
        fn pend_yield(&self) {}
    }

    #[test]
    fn test_producer_never_blocks_without_consumer() {
        let port = TimedPort {
            inner: StepPort::new(),
            cancel: CancelToken::new(),
            until_ms: 2000,
        };
        let ctx = TaskContext::new("fast", &port, &port.cancel);
        let gate = SingleSlotSignal::new();
        let stats = GateStats::new();
        let cfg = RateGateConfig::default();

        assert_eq!(producer_task(&ctx, &gate, &cfg, &stats), Err(Cancelled));

        // 20 cycles of 100 ms, a post every 5th: one credit raised, the
        // other three absorbed since nobody consumed.
        assert_eq!(stats.producer_cycles.load(Ordering::Relaxed), 20);
        assert_eq!(stats.posted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.absorbed.load(Ordering::Relaxed), 3);
        assert!(gate.is_pending());
        assert_eq!(port.inner.idles.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_consumer_takes_one_credit_per_cycle() {
        struct Led(AtomicU32);
        impl DigitalOutput for Led {
            fn set(&self, _on: bool) {}
            fn toggle(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let port = StepPort::new();
        let cancel = CancelToken::new();
        let gate = SingleSlotSignal::new();
        let stats = GateStats::new();
        let led = Led(AtomicU32::new(0));
        let cfg = RateGateConfig {
            consumer_period_ms: 0,
            ..RateGateConfig::default()
        };

        let fast = TaskContext::new("fast", &port, &cancel);
        for _ in 0..4 {
            fast.signal(&gate);
        }

        std::thread::scope(|s| {
            let consumer = s.spawn(|| {
                let ctx = TaskContext::new("slow", &port, &cancel);
                consumer_task(&ctx, &gate, &cfg, &stats, Some(&led))
            });

            while stats.consumed.load(Ordering::Acquire) < 1 {
                std::thread::yield_now();
            }
            // The burst left a single credit: the consumer is back to waiting.
            let idles = port.idles.load(Ordering::Acquire);
            while port.idles.load(Ordering::Acquire) < idles + 3 {
                std::thread::yield_now();
            }
            assert_eq!(stats.consumed.load(Ordering::Acquire), 1);

            fast.signal(&gate);
            while stats.consumed.load(Ordering::Acquire) < 2 {
                std::thread::yield_now();
            }
            cancel.cancel();
            assert_eq!(consumer.join().unwrap(), Err(Cancelled));
        });

        assert_eq!(stats.consumed.load(Ordering::Relaxed), 2);
        assert_eq!(led.0.load(Ordering::Relaxed), 2);
    }
}
