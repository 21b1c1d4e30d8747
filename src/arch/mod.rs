//! # Architecture and Board Layer
//!
//! Everything that touches registers directly: the Cortex-M port of the
//! scheduler, the Ethernet MAC driver and the board LEDs. Only built for
//! bare-metal targets.

pub mod board;
pub mod cortex_m4;
pub mod gmac;
