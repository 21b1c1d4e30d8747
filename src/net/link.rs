//! Link monitor: polls the PHY and mirrors its link state into the stack.

use crate::context::TaskContext;
use crate::error::Cancelled;

/// Physical link state source, typically the PHY's basic status register.
pub trait LinkStatus: Sync {
    fn link_up(&self) -> bool;
}

/// Network interface side of a link change.
pub trait LinkControl: Sync {
    fn set_link_up(&self, up: bool);
}

/// Poll `phy` every `period_ms` and forward transitions to `net`.
///
/// The interface starts with the link assumed up, so only a change from
/// that is forwarded on the first poll.
pub fn link_monitor_task(
    ctx: &TaskContext<'_>,
    phy: &dyn LinkStatus,
    net: &dyn LinkControl,
    period_ms: u32,
) -> Result<(), Cancelled> {
    let mut up = true;
    loop {
        let now = phy.link_up();
        if now != up {
            if now {
                log::info!("{}: link up", ctx.name());
            } else {
                log::warn!("{}: link down", ctx.name());
            }
            net.set_link_up(now);
            up = now;
        }
        ctx.sleep_ms(period_ms)?;
    }
}
