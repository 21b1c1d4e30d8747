//! # Boot Barrier
//!
//! Start-up rendezvous for the cores booting from this image. Every core
//! sets its bit in a shared arrival mask and waits until the mask covers the
//! required set; only then does anyone touch shared hardware.
//!
//! ```text
//!   ┌─────────┐  arrive()   ┌─────────┐  mask == required  ┌──────────┐
//!   │ Unsynced│ ──────────► │ Waiting │ ─────────────────► │ Released │
//!   └─────────┘             └─────────┘                    └──────────┘
//! ```
//!
//! There is no timeout. A core that never arrives keeps every other core
//! parked forever; for a statically configured image that fail-stop is the
//! intended outcome.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::context::Port;
use crate::error::Cancelled;
use crate::sync::CancelToken;

/// Observable phase of the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// No core has arrived yet.
    Unsynced,
    /// At least one core arrived; the mask is incomplete.
    Waiting,
    /// Every required core arrived. Terminal.
    Released,
}

/// Shared arrival mask plus a latched release flag.
#[derive(Debug)]
pub struct BootBarrier {
    arrived: AtomicU32,
    required: u32,
    released: AtomicBool,
}

impl BootBarrier {
    /// Barrier that releases once every bit of `required` has arrived.
    pub const fn new(required: u32) -> Self {
        Self {
            arrived: AtomicU32::new(0),
            required,
            released: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn required_mask(&self) -> u32 {
        self.required
    }

    /// Cores seen so far.
    #[inline]
    pub fn arrived_mask(&self) -> u32 {
        self.arrived.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BarrierState {
        if self.released.load(Ordering::Acquire) {
            BarrierState::Released
        } else if self.arrived_mask() == 0 {
            BarrierState::Unsynced
        } else {
            BarrierState::Waiting
        }
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Mark `core` as arrived and wait for the others. Never times out.
    ///
    /// Calling again from a core that already passed returns immediately.
    pub fn arrive(&self, core: u8, port: &dyn Port) {
        let never = CancelToken::new();
        // The token above is never fired, so the only exit is release.
        let _ = self.arrive_cancellable(core, port, &never);
    }

    /// [`arrive`](Self::arrive) with a teardown hook for tests and the host
    /// simulation. The arrival bit stays set when cancelled.
    pub fn arrive_cancellable(
        &self,
        core: u8,
        port: &dyn Port,
        cancel: &CancelToken,
    ) -> Result<(), Cancelled> {
        let bit = 1u32.checked_shl(u32::from(core)).unwrap_or(0);
        let seen = self.arrived.fetch_or(bit, Ordering::AcqRel) | bit;
        port.notify_cores();

        if seen & self.required == self.required {
            self.release();
            return Ok(());
        }

        loop {
            if self.arrived_mask() & self.required == self.required {
                self.release();
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            port.spin();
        }
    }

    fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::info!("boot barrier released (mask {:#x})", self.required);
        }
    }
}
