//! # Synchronization Primitives
//!
//! Interrupt-safe building blocks shared by tasks and interrupt handlers:
//!
//! - [`critical_section`] / [`Shared`]: exclusive access to per-core state
//!   that both tasks and ISRs reach.
//! - [`SingleSlotSignal`]: a binary wake primitive holding at most one
//!   pending credit. Posting while a credit is pending is absorbed.
//! - [`CancelToken`]: teardown request checked at every suspension point.
//!
//! The signal's post and take operations are crate-private. Tasks and ISRs
//! reach them through [`TaskContext`](crate::context::TaskContext) and
//! [`InterruptContext`](crate::context::InterruptContext), which decide who
//! may block.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::{CriticalSection, Mutex};

/// Execute a closure within a critical section (interrupts disabled).
///
/// On Cortex-M this masks interrupts on the calling core only. State guarded
/// this way must therefore be owned by one core; cross-core state uses
/// atomics instead.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Per-core state reachable from several tasks.
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access to the value.
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}

// ---------------------------------------------------------------------------
// Single-slot signal
// ---------------------------------------------------------------------------

/// Binary semaphore: `pending` is a flag, not a counter.
///
/// ```text
///   signal()            signal()
///   ─────────► pending ─────────► pending (absorbed)
///                 │
///                 │ try_take()
///                 ▼
///               idle
/// ```
///
/// A consumer that was signalled K times before it looked sees one credit.
/// Code that needs every event must drain its source completely on wake.
#[derive(Debug)]
pub struct SingleSlotSignal {
    pending: AtomicBool,
}

impl SingleSlotSignal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Post the credit. Returns `false` when one was already pending and
    /// this post was absorbed. Never blocks.
    #[inline]
    pub(crate) fn signal(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    /// Consume the credit if present.
    #[inline]
    pub(crate) fn try_take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Whether a credit is currently pending.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for SingleSlotSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// One-shot teardown request. Firmware never fires it; tests and the host
/// simulation use it to stop task loops deterministically.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub const fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
