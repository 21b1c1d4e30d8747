//! # Errors
//!
//! Typed failures for every layer. Setup errors are fatal for the task that
//! hits them (see [`fail_stop`]); resource errors only skip the current cycle.

use core::fmt;
use core::net::SocketAddrV4;

use thiserror::Error;

use crate::net::EndpointState;

/// Transport-level failures reported by a [`Transport`](crate::net::Transport).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("no free endpoint slot")]
    NoEndpoint,
    #[error("port {0} is already bound")]
    AddrInUse(u16),
    #[error("address is not reachable from this interface")]
    Unaddressable,
    #[error("transmit buffer full")]
    BufferFull,
    #[error("endpoint is not bound")]
    NotBound,
    #[error("link is down")]
    LinkDown,
    #[error("operation not valid in endpoint state {0:?}")]
    InvalidState(EndpointState),
}

/// Fatal setup failure of a network role. The task halts after reporting it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    #[error("bind to port {port} failed")]
    Bind {
        port: u16,
        #[source]
        source: NetError,
    },
    #[error("connect to {remote} failed")]
    Connect {
        remote: SocketAddrV4,
        #[source]
        source: NetError,
    },
}

/// Transient packet-buffer allocation failure. The caller skips its cycle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("packet pool exhausted")]
    Exhausted,
    #[error("requested {requested} bytes, buffers hold {capacity}")]
    TooLarge { requested: usize, capacity: usize },
}

/// Task table full.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    #[error("task table full ({0} tasks)")]
    TableFull(usize),
}

/// Returned from a suspension point once the task's cancellation token fired.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled")]
pub struct Cancelled;

/// Report a fatal error and halt the calling task without yielding.
///
/// With the watchdogs disabled this parks the core for good; a supervised
/// deployment would restart the core instead.
pub fn fail_stop(err: &dyn fmt::Display) -> ! {
    log::error!("fatal: {}; halting", err);
    loop {
        core::hint::spin_loop();
    }
}

/// Failure of a blocking receive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}
