//! # mcsync: Multicore Synchronisation Demonstrator
//!
//! Three cores of one microcontroller meet at a boot barrier, then each runs
//! a small fixed-priority scheduler with its own tasks. The pieces that cross
//! task, core and interrupt boundaries are the point of the crate:
//!
//! - **Boot barrier**: no core starts its scheduler before every required
//!   core has arrived
//! - **Deferred interrupt handoff**: the ETH ISR only clears status and posts
//!   a signal; a high-priority task drains received frames
//! - **Rate gate**: a fast producer hands credits to a slow consumer through
//!   a single-slot signal that absorbs surplus posts
//! - **UDP harness**: a periodic client or an echo-less server over smoltcp
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │          Core roles and wiring (system.rs)              │
//! │     core_entry() · run_net_role() · heartbeat_task()   │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  ETH handoff │   Rate gate        │  UDP harness      │
//! │  eth.rs      │   rate_gate.rs     │  net/             │
//! │  ─ ISR       │   ─ producer       │  ─ client/server  │
//! │  ─ rx task   │   ─ consumer       │  ─ smoltcp stack  │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │  Boot barrier · Packet pool · Signals · Contexts        │
//! │  barrier.rs     pool.rs         sync.rs   context.rs    │
//! ├────────────────────────────────────────────────────────┤
//! │  Kernel (kernel.rs, scheduler.rs, task.rs)   │  host.rs │
//! │  Arch port (arch/): PendSV · SysTick · GMAC  │  threads │
//! ├──────────────────────────────────────────────┴─────────┤
//! │         ARM Cortex-M4 hardware  /  development host     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Contexts
//!
//! Code that may block takes a [`TaskContext`](context::TaskContext); code
//! that runs in an interrupt handler only gets an
//! [`InterruptContext`](context::InterruptContext), which can post a signal
//! and request a yield but cannot wait. Both sit on a
//! [`Port`](context::Port), implemented by the kernel on target and by
//! [`host::HostPort`] on a development machine.
//!
//! ## Memory Model
//!
//! - **No heap on target**: all state is statically allocated
//! - **Packet buffers**: fixed pool, move-only handles freed on drop
//! - **Critical sections**: `critical_section::with()`, single-core on
//!   target and a global lock under `std`
//! - **Cross-core state**: atomics only

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod sync;
pub mod context;
pub mod error;
pub mod barrier;
pub mod pool;
pub mod eth;
pub mod net;
pub mod rate_gate;
pub mod task;
pub mod scheduler;
pub mod system;

#[cfg(feature = "std")]
pub mod host;

#[cfg(target_os = "none")]
pub mod kernel;
#[cfg(target_os = "none")]
pub mod arch;
