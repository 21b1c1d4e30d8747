//! # System Coordinator
//!
//! Everything the cores share lives in one [`System`] value, constructed
//! once (as a `static` on hardware) and passed by reference into every task
//! and interrupt registration.
//!
//! ```text
//!            ┌──────────────────────── System ────────────────────────┐
//!            │ barrier · eth_rx · rate_gate · pool · stats · cancel   │
//!            └────────────────────────────────────────────────────────┘
//!   core 0 (Network)        core 1 (RateGate)        core 2 (Heartbeat)
//!   ─ eth_rx      prio 5    ─ producer  prio 3       ─ heartbeat prio 1
//!   ─ link        prio 4    ─ consumer  prio 2
//!   ─ net role    prio 3
//! ```

use crate::barrier::BootBarrier;
use crate::config::{
    PACKET_BUFFER_SIZE, PACKET_POOL_SLOTS, PRIO_ETH_RX, PRIO_HEARTBEAT,
    PRIO_LINK_MONITOR, PRIO_NET_ROLE, PRIO_RATE_CONSUMER, PRIO_RATE_PRODUCER,
    NET_ROLE, REQUIRED_CORES_MASK,
};
use crate::context::{Port, TaskContext};
use crate::error::{Cancelled, SetupError};
use crate::eth::{DigitalOutput, EthIrqHandler, IrqCounters};
use crate::net::client::{client_task, BufferSource, ClientConfig, ClientStats};
use crate::net::server::{server_task, Datagram, ServerConfig};
use crate::net::{NetRole, Transport};
use crate::pool::PacketPool;
use crate::rate_gate::GateStats;
use crate::sync::{CancelToken, SingleSlotSignal};
use crate::task::TaskConfig;

/// Packet pool shared by the network core.
pub type SystemPool = PacketPool<PACKET_POOL_SLOTS, PACKET_BUFFER_SIZE>;

/// What a core runs after the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRole {
    /// Deferred ETH receive, link monitor and the UDP test role.
    Network,
    /// Producer/consumer pair on the rate gate.
    RateGate,
    /// Heartbeat LED only.
    Heartbeat,
    /// Core outside the configured set.
    Unused,
}

const NETWORK_TASKS: [TaskConfig; 3] = [
    TaskConfig::new("eth_rx", PRIO_ETH_RX),
    TaskConfig::new("link", PRIO_LINK_MONITOR),
    TaskConfig::new("net_role", PRIO_NET_ROLE),
];

const RATE_GATE_TASKS: [TaskConfig; 2] = [
    TaskConfig::new("rate_producer", PRIO_RATE_PRODUCER),
    TaskConfig::new("rate_consumer", PRIO_RATE_CONSUMER),
];

const HEARTBEAT_TASKS: [TaskConfig; 1] = [TaskConfig::new("heartbeat", PRIO_HEARTBEAT)];

impl CoreRole {
    pub const fn for_core(core: u8) -> Self {
        match core {
            0 => Self::Network,
            1 => Self::RateGate,
            2 => Self::Heartbeat,
            _ => Self::Unused,
        }
    }

    /// Tasks of this role in creation order.
    pub fn tasks(self) -> &'static [TaskConfig] {
        match self {
            Self::Network => &NETWORK_TASKS,
            Self::RateGate => &RATE_GATE_TASKS,
            Self::Heartbeat => &HEARTBEAT_TASKS,
            Self::Unused => &[],
        }
    }
}

/// Network test role plus the parameters of both roles.
#[derive(Debug, Clone, Copy)]
pub struct RoleConfig {
    pub role: NetRole,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            role: NET_ROLE,
            client: ClientConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// State shared by all cores, tasks and the ETH interrupt.
pub struct System {
    pub barrier: BootBarrier,
    /// Posted by the ETH ISR, awaited by the deferred receive task.
    pub eth_rx: SingleSlotSignal,
    /// Credit between the rate-gate producer and consumer.
    pub rate_gate: SingleSlotSignal,
    pub pool: SystemPool,
    pub irq_counters: IrqCounters,
    pub gate_stats: GateStats,
    pub client_stats: ClientStats,
    pub cancel: CancelToken,
}

impl System {
    pub const fn new() -> Self {
        Self::with_required(REQUIRED_CORES_MASK)
    }

    /// System whose barrier waits for the cores in `required`.
    pub const fn with_required(required: u32) -> Self {
        Self {
            barrier: BootBarrier::new(required),
            eth_rx: SingleSlotSignal::new(),
            rate_gate: SingleSlotSignal::new(),
            pool: PacketPool::new(),
            irq_counters: IrqCounters::new(),
            gate_stats: GateStats::new(),
            client_stats: ClientStats::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Boot rendezvous of `core`. Returns the core's role once every
    /// required core arrived. If one of them never does, this only returns
    /// on [`shutdown`](Self::shutdown), which firmware never calls.
    pub fn core_entry(&self, core: u8, port: &dyn Port) -> Result<CoreRole, Cancelled> {
        log::info!(
            "core {}: up, waiting for rendezvous of {:#05b}",
            core,
            self.barrier.required_mask()
        );
        self.barrier.arrive_cancellable(core, port, &self.cancel)?;
        let role = CoreRole::for_core(core);
        log::info!("core {}: released as {:?}", core, role);
        Ok(role)
    }

    /// ETH interrupt handler bound to this system's receive signal.
    pub fn eth_irq_handler(&self) -> EthIrqHandler<'_> {
        EthIrqHandler::new(&self.eth_rx, &self.irq_counters)
    }

    /// Context for a task of this system running on `port`.
    pub fn task_context<'a>(&'a self, name: &'static str, port: &'a dyn Port) -> TaskContext<'a> {
        TaskContext::new(name, port, &self.cancel)
    }

    /// Run the configured UDP test role. `on_datagram` only sees traffic in
    /// the server role.
    pub fn run_net_role(
        &self,
        ctx: &TaskContext<'_>,
        transport: &dyn Transport,
        cfg: &RoleConfig,
        on_datagram: impl FnMut(&Datagram<'_>),
    ) -> Result<(), SetupError> {
        match cfg.role {
            NetRole::Client => client_task(
                ctx,
                transport,
                &self.pool as &dyn BufferSource,
                &cfg.client,
                &self.client_stats,
            ),
            NetRole::Server => server_task(ctx, transport, &cfg.server, on_datagram),
        }
    }

    /// Stop every task loop at its next suspension point.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

/// Blink `led` on the otherwise idle core. Returns only when cancelled.
pub fn heartbeat_task(
    ctx: &TaskContext<'_>,
    led: &dyn DigitalOutput,
    period_ms: u32,
) -> Result<(), Cancelled> {
    log::info!("{}: every {} ms", ctx.name(), period_ms);
    loop {
        led.toggle();
        ctx.sleep_ms(period_ms)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierState;
    use crate::context::testing::StepPort;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_role_mapping() {
        assert_eq!(CoreRole::for_core(0), CoreRole::Network);
        assert_eq!(CoreRole::for_core(1), CoreRole::RateGate);
        assert_eq!(CoreRole::for_core(2), CoreRole::Heartbeat);
        assert_eq!(CoreRole::for_core(3), CoreRole::Unused);

        let prios: std::vec::Vec<u8> = CoreRole::Network.tasks().iter().map(|t| t.priority).collect();
        assert_eq!(prios, [5, 4, 3]);
        assert!(CoreRole::RateGate.tasks()[0].priority > CoreRole::RateGate.tasks()[1].priority);
        assert!(CoreRole::Unused.tasks().is_empty());
    }

    #[test]
    fn test_all_cores_released_with_their_roles() {
        let system = System::new();
        let port = StepPort::new();

        let roles: std::vec::Vec<CoreRole> = std::thread::scope(|s| {
            let handles: std::vec::Vec<_> = (0..3u8)
                .map(|core| {
                    let (system, port) = (&system, &port);
                    s.spawn(move || system.core_entry(core, port).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(
            roles,
            [CoreRole::Network, CoreRole::RateGate, CoreRole::Heartbeat]
        );
        assert_eq!(system.barrier.state(), BarrierState::Released);
    }

    #[test]
    fn test_shutdown_frees_core_waiting_for_missing_peer() {
        let system = System::with_required(0b11);
        let port = StepPort::new();
        std::thread::scope(|s| {
            let core0 = s.spawn(|| system.core_entry(0, &port));
            while system.barrier.state() != BarrierState::Waiting {
                std::thread::yield_now();
            }
            system.shutdown();
            assert_eq!(core0.join().unwrap(), Err(Cancelled));
        });
        assert_eq!(system.barrier.state(), BarrierState::Waiting);
    }

    #[test]
    fn test_heartbeat_toggles_until_cancelled() {
        struct Led(AtomicU32);
        impl DigitalOutput for Led {
            fn set(&self, _on: bool) {}
            fn toggle(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let system = System::new();
        let port = StepPort::new();
        let led = Led(AtomicU32::new(0));
        std::thread::scope(|s| {
            let hb = s.spawn(|| {
                let ctx = system.task_context("heartbeat", &port);
                heartbeat_task(&ctx, &led, crate::config::HEARTBEAT_PERIOD_MS)
            });
            while led.0.load(Ordering::Relaxed) < 3 {
                std::thread::yield_now();
            }
            system.shutdown();
            assert_eq!(hb.join().unwrap(), Err(Cancelled));
        });
        assert!(led.0.load(Ordering::Relaxed) >= 3);
    }
}
