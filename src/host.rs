//! # Host Simulation
//!
//! Runs the complete system on a development machine. Every core and every
//! task is an OS thread; the Ethernet MAC is simulated down to its
//! write-one-to-clear DMA status register, and a second simulated host on
//! the far end of the cable plays the opposite UDP role.
//!
//! ```text
//!   device 192.168.5.123                           remote 192.168.5.196
//!   NetStack ─► SimEth ─► SimMac ════ cable ════ SimMac ◄─ SimEth ◄─ NetStack
//!                           │ status                 │ status
//!                        IrqLine ─► ISR           IrqLine ─► ISR
//!                                    │                        │
//!                              eth_rx task              eth_rx task
//! ```
//!
//! Frames only reach a stack through the same path as on hardware: the
//! [`IrqLine`] sees the receive flag, runs the ISR, and the deferred receive
//! task drains the MAC.

use core::net::SocketAddrV4;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant as NetInstant;

use crate::config::{
    DEVICE_ADDR, HEARTBEAT_PERIOD_MS, LINK_MONITOR_PERIOD_MS, MTU, NUM_CORES,
    PREFIX_LEN, REMOTE_ADDR,
};
use crate::context::{InterruptContext, Port};
use crate::error::{PoolError, SetupError};
use crate::eth::{
    rx_deferred_task, DigitalOutput, EthInterruptRegs, EthIrqHandler, EthStatus, IsrOutcome,
};
use crate::net::client::{BufferSource, ClientConfig};
use crate::net::link::{link_monitor_task, LinkStatus};
use crate::net::server::Datagram;
use crate::net::stack::{InterfaceConfig, NetStack, SharedStack, StackStorage};
use crate::net::NetRole;
use crate::pool::PacketBuffer;
use crate::rate_gate::{consumer_task, producer_task, RateGateConfig};
use crate::sync::CancelToken;
use crate::system::{heartbeat_task, CoreRole, RoleConfig, System};

/// MAC address of the simulated remote host (locally administered).
pub const REMOTE_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x01, 0xc4];

/// How long an idle task gives the processor away.
const IDLE_SLICE: Duration = Duration::from_micros(200);

/// Poll period of an [`IrqLine`] with nothing pending.
const IRQ_POLL: Duration = Duration::from_micros(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// [`Port`] on OS threads. Time is wall-clock time since construction.
pub struct HostPort {
    epoch: Instant,
    yield_requests: AtomicU32,
}

impl HostPort {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            yield_requests: AtomicU32::new(0),
        }
    }

    /// Reschedule requests issued from interrupt context so far. Every task
    /// has its own thread here, so they are only counted.
    pub fn yield_requests(&self) -> u32 {
        self.yield_requests.load(Ordering::Relaxed)
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostPort {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn delay_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn idle(&self) {
        thread::sleep(IDLE_SLICE);
    }

    fn spin(&self) {
        thread::yield_now();
    }

    fn notify_cores(&self) {}

    fn pend_yield(&self) {
        self.yield_requests.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Board peripherals
// ---------------------------------------------------------------------------

/// LED that remembers its level and how often it was toggled.
#[derive(Debug, Default)]
pub struct SimLed {
    on: AtomicBool,
    toggles: AtomicU32,
}

impl SimLed {
    pub const fn new() -> Self {
        Self {
            on: AtomicBool::new(false),
            toggles: AtomicU32::new(0),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    pub fn toggles(&self) -> u32 {
        self.toggles.load(Ordering::Relaxed)
    }
}

impl DigitalOutput for SimLed {
    fn set(&self, on: bool) {
        self.on.store(on, Ordering::Relaxed);
    }

    fn toggle(&self) {
        self.on.fetch_xor(true, Ordering::Relaxed);
        self.toggles.fetch_add(1, Ordering::Relaxed);
    }
}

/// PHY link status that tests can pull down.
#[derive(Debug)]
pub struct SimLink {
    up: AtomicBool,
}

impl SimLink {
    pub const fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
        }
    }

    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }
}

impl LinkStatus for SimLink {
    fn link_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Simulated MAC
// ---------------------------------------------------------------------------

/// Frame queues and DMA status register of one simulated MAC.
#[derive(Debug, Default)]
pub struct SimMac {
    status: AtomicU32,
    rx: Mutex<VecDeque<Vec<u8>>>,
    egress: Mutex<VecDeque<Vec<u8>>>,
    tx_frames: AtomicU32,
    rx_frames: AtomicU32,
}

impl SimMac {
    pub const fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            rx: Mutex::new(VecDeque::new()),
            egress: Mutex::new(VecDeque::new()),
            tx_frames: AtomicU32::new(0),
            rx_frames: AtomicU32::new(0),
        }
    }

    /// Set status bits, known or not.
    pub fn raise(&self, flags: EthStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Queue `frame` for reception and flag it.
    pub fn inject(&self, frame: Vec<u8>) {
        lock(&self.rx).push_back(frame);
        self.raise(EthStatus::RECEIVE_READY);
    }

    /// Frames waiting in the receive queue.
    pub fn rx_pending(&self) -> usize {
        lock(&self.rx).len()
    }

    /// Frames handed to the stack so far.
    pub fn rx_frames(&self) -> u32 {
        self.rx_frames.load(Ordering::Relaxed)
    }

    /// Frames the stack transmitted so far.
    pub fn tx_frames(&self) -> u32 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    /// Take every transmitted frame off the wire.
    pub fn take_egress(&self) -> Vec<Vec<u8>> {
        lock(&self.egress).drain(..).collect()
    }

    fn transmit(&self, frame: Vec<u8>) {
        lock(&self.egress).push_back(frame);
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.raise(EthStatus::TRANSMIT_DONE);
    }

    fn next_rx(&self) -> Option<Vec<u8>> {
        lock(&self.rx).pop_front()
    }

    /// Put `frame` back at the head of the queue. The ring still holds a
    /// frame, so receive-ready stays raised.
    fn unread(&self, frame: Vec<u8>) {
        lock(&self.rx).push_front(frame);
        self.raise(EthStatus::RECEIVE_READY);
    }
}

impl EthInterruptRegs for SimMac {
    fn pending(&self) -> EthStatus {
        EthStatus::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    fn clear(&self, flags: EthStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// smoltcp device over a [`SimMac`]. Received frames are copied into pool
/// buffers, as the DMA would.
pub struct SimEth<'a> {
    mac: &'a SimMac,
    buffers: &'a dyn BufferSource,
}

impl<'a> SimEth<'a> {
    pub fn new(mac: &'a SimMac, buffers: &'a dyn BufferSource) -> Self {
        Self { mac, buffers }
    }
}

pub struct SimRxToken<'a>(PacketBuffer<'a>);

pub struct SimTxToken<'a>(&'a SimMac);

impl phy::RxToken for SimRxToken<'_> {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0[..])
    }
}

impl phy::TxToken for SimTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.transmit(frame);
        result
    }
}

impl<'a> Device for SimEth<'a> {
    type RxToken<'b>
        = SimRxToken<'a>
    where
        Self: 'b;
    type TxToken<'b>
        = SimTxToken<'a>
    where
        Self: 'b;

    fn receive(&mut self, _timestamp: NetInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mac: &'a SimMac = self.mac;
        let buffers: &'a dyn BufferSource = self.buffers;
        loop {
            let frame = mac.next_rx()?;
            match buffers.alloc(frame.len()) {
                Ok(mut buf) => {
                    buf.copy_from_slice(&frame);
                    mac.rx_frames.fetch_add(1, Ordering::Relaxed);
                    return Some((SimRxToken(buf), SimTxToken(mac)));
                }
                Err(PoolError::Exhausted) => {
                    // Stays in the MAC until a buffer is free again.
                    mac.unread(frame);
                    return None;
                }
                Err(err) => log::warn!("sim-eth: dropping {}-byte frame: {}", frame.len(), err),
            }
        }
    }

    fn transmit(&mut self, _timestamp: NetInstant) -> Option<Self::TxToken<'_>> {
        Some(SimTxToken(self.mac))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = MTU;
        caps
    }
}

/// Stack of one simulated host.
pub type SimStack<'a> = SharedStack<'a, SimEth<'a>>;

/// Bring up a stack on `mac`, receiving into `buffers`.
pub fn sim_stack<'a>(
    mac: &'a SimMac,
    buffers: &'a dyn BufferSource,
    cfg: &InterfaceConfig,
    storage: &'a mut StackStorage<'a>,
    now_ms: u64,
) -> SimStack<'a> {
    SharedStack::new(NetStack::with_storage(SimEth::new(mac, buffers), cfg, storage, now_ms))
}

// ---------------------------------------------------------------------------
// Interrupt line
// ---------------------------------------------------------------------------

/// Interrupt controller of one MAC. Also carries the cable: frames `mac`
/// transmits land in `peer`'s receive queue (`peer` may be `mac` itself for
/// a loopback).
pub struct IrqLine<'a> {
    mac: &'a SimMac,
    peer: &'a SimMac,
    handler: EthIrqHandler<'a>,
    port: &'a dyn Port,
}

impl<'a> IrqLine<'a> {
    pub fn new(mac: &'a SimMac, peer: &'a SimMac, handler: EthIrqHandler<'a>, port: &'a dyn Port) -> Self {
        Self {
            mac,
            peer,
            handler,
            port,
        }
    }

    /// Deliver pending egress, then enter the ISR if any status bit is set.
    pub fn step(&self) -> Option<IsrOutcome> {
        for frame in self.mac.take_egress() {
            self.peer.inject(frame);
        }
        if self.mac.pending().is_empty() {
            return None;
        }
        Some(self.handler.on_interrupt(&InterruptContext::new(self.port), self.mac))
    }

    /// Dispatch interrupts until `cancel` fires.
    pub fn run(&self, cancel: &CancelToken) {
        while !cancel.is_cancelled() {
            if self.step().is_none() {
                thread::sleep(IRQ_POLL);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Whole-system simulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Role of the device; the remote host plays the other one.
    pub roles: RoleConfig,
    pub rate_gate: RateGateConfig,
    pub heartbeat_ms: u32,
    pub link_poll_ms: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            roles: RoleConfig::default(),
            rate_gate: RateGateConfig::default(),
            heartbeat_ms: HEARTBEAT_PERIOD_MS,
            link_poll_ms: LINK_MONITOR_PERIOD_MS,
        }
    }
}

/// A datagram as seen by whichever side runs the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub from: SocketAddrV4,
    pub payload: Vec<u8>,
    pub truncated: bool,
}

/// The device, its cable and the remote host.
pub struct Simulation {
    pub device: System,
    pub remote: System,
    pub port: HostPort,
    pub device_mac: SimMac,
    pub remote_mac: SimMac,
    pub link: SimLink,
    pub activity_led: SimLed,
    pub gate_led: SimLed,
    pub heartbeat_led: SimLed,
    received: Mutex<Vec<Received>>,
    cfg: SimConfig,
}

impl Simulation {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            device: System::new(),
            remote: System::with_required(0),
            port: HostPort::new(),
            device_mac: SimMac::new(),
            remote_mac: SimMac::new(),
            link: SimLink::new(true),
            activity_led: SimLed::new(),
            gate_led: SimLed::new(),
            heartbeat_led: SimLed::new(),
            received: Mutex::new(Vec::new()),
            cfg,
        }
    }

    /// Run every core and the remote host until [`shutdown`](Self::shutdown).
    /// A setup failure on either side stops the whole simulation and is
    /// returned.
    pub fn run(&self) -> Result<(), SetupError> {
        log::info!("sim: {} cores, device role {:?}", NUM_CORES, self.cfg.roles.role);
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(NUM_CORES + 1);
            handles.push(s.spawn(|| self.run_remote()));
            for core in 0..NUM_CORES as u8 {
                handles.push(s.spawn(move || self.run_core(core)));
            }

            let mut result = Ok(());
            for handle in handles {
                match handle.join() {
                    Ok(Err(err)) if result.is_ok() => result = Err(err),
                    Ok(_) => {}
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            result
        })
    }

    /// Cancel every task on both hosts.
    pub fn shutdown(&self) {
        self.device.shutdown();
        self.remote.shutdown();
    }

    /// Datagrams the server side received so far.
    pub fn received(&self) -> Vec<Received> {
        lock(&self.received).clone()
    }

    fn record(&self, datagram: &Datagram<'_>) {
        lock(&self.received).push(Received {
            from: datagram.from,
            payload: datagram.payload.to_vec(),
            truncated: datagram.truncated,
        });
    }

    fn fail(&self, err: SetupError) -> Result<(), SetupError> {
        log::error!("sim: {}; stopping", err);
        self.shutdown();
        Err(err)
    }

    fn run_core(&self, core: u8) -> Result<(), SetupError> {
        let Ok(role) = self.device.core_entry(core, &self.port) else {
            return Ok(());
        };
        match role {
            CoreRole::Network => self.run_network_core(),
            CoreRole::RateGate => {
                self.run_rate_gate_core();
                Ok(())
            }
            CoreRole::Heartbeat => {
                let ctx = self.device.task_context("heartbeat", &self.port);
                let _ = heartbeat_task(&ctx, &self.heartbeat_led, self.cfg.heartbeat_ms);
                Ok(())
            }
            CoreRole::Unused => Ok(()),
        }
    }

    fn run_network_core(&self) -> Result<(), SetupError> {
        let sys = &self.device;
        let mut storage = StackStorage::new();
        let stack = sim_stack(
            &self.device_mac,
            &sys.pool,
            &InterfaceConfig::default(),
            &mut storage,
            self.port.now_ms(),
        );
        let handler = sys.eth_irq_handler().with_activity_led(&self.activity_led);
        let line = IrqLine::new(&self.device_mac, &self.remote_mac, handler, &self.port);

        thread::scope(|s| {
            s.spawn(|| line.run(&sys.cancel));
            s.spawn(|| {
                let ctx = sys.task_context("eth_rx", &self.port);
                let _ = rx_deferred_task(&ctx, &sys.eth_rx, &stack);
            });
            s.spawn(|| {
                let ctx = sys.task_context("link", &self.port);
                let _ = link_monitor_task(&ctx, &self.link, &stack, self.cfg.link_poll_ms);
            });

            let ctx = sys.task_context("net_role", &self.port);
            match sys.run_net_role(&ctx, &stack, &self.cfg.roles, |d| self.record(d)) {
                Ok(()) => Ok(()),
                Err(err) => self.fail(err),
            }
        })
    }

    fn run_rate_gate_core(&self) {
        let sys = &self.device;
        let cfg = &self.cfg.rate_gate;
        thread::scope(|s| {
            s.spawn(|| {
                let ctx = sys.task_context("rate_producer", &self.port);
                let _ = producer_task(&ctx, &sys.rate_gate, cfg, &sys.gate_stats);
            });
            let ctx = sys.task_context("rate_consumer", &self.port);
            let _ = consumer_task(&ctx, &sys.rate_gate, cfg, &sys.gate_stats, Some(&self.gate_led));
        });
    }

    fn run_remote(&self) -> Result<(), SetupError> {
        let sys = &self.remote;
        let mut storage = StackStorage::new();
        let iface = InterfaceConfig {
            mac: REMOTE_MAC,
            addr: *REMOTE_ADDR.ip(),
            prefix_len: PREFIX_LEN,
            gateway: None,
        };
        let stack = sim_stack(&self.remote_mac, &sys.pool, &iface, &mut storage, self.port.now_ms());
        let line = IrqLine::new(&self.remote_mac, &self.device_mac, sys.eth_irq_handler(), &self.port);

        thread::scope(|s| {
            s.spawn(|| line.run(&sys.cancel));
            s.spawn(|| {
                let ctx = sys.task_context("remote_rx", &self.port);
                let _ = rx_deferred_task(&ctx, &sys.eth_rx, &stack);
            });

            let ctx = sys.task_context("remote", &self.port);
            match sys.run_net_role(&ctx, &stack, &self.remote_roles(), |d| self.record(d)) {
                Ok(()) => Ok(()),
                Err(err) => self.fail(err),
            }
        })
    }

    fn remote_roles(&self) -> RoleConfig {
        let roles = self.cfg.roles;
        match roles.role {
            NetRole::Client => RoleConfig {
                role: NetRole::Server,
                ..roles
            },
            NetRole::Server => RoleConfig {
                role: NetRole::Client,
                client: ClientConfig {
                    remote: SocketAddrV4::new(DEVICE_ADDR, roles.server.port),
                    ..roles.client
                },
                ..roles
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::IrqCounters;
    use crate::pool::PacketPool;
    use crate::sync::SingleSlotSignal;

    #[test]
    fn test_status_register_write_one_to_clear() {
        let mac = SimMac::new();
        mac.raise(EthStatus::RECEIVE_READY | EthStatus::TRANSMIT_DONE);
        mac.clear(EthStatus::TRANSMIT_DONE);
        assert_eq!(mac.pending(), EthStatus::RECEIVE_READY);

        mac.raise(EthStatus::from_bits_retain(1 << 13));
        assert_eq!(mac.pending().bits(), (1 << 13) | (1 << 6));
    }

    #[test]
    fn test_irq_line_delivers_to_peer_and_signals() {
        let port = HostPort::new();
        let signal = SingleSlotSignal::new();
        let counters = IrqCounters::new();
        let (a, b) = (SimMac::new(), SimMac::new());

        a.transmit(vec![0x45; 20]);
        let line_a = IrqLine::new(&a, &b, EthIrqHandler::new(&signal, &counters), &port);
        let outcome = line_a.step().unwrap();
        assert!(!outcome.woke_rx);
        assert_eq!(b.rx_pending(), 1);
        assert!(line_a.step().is_none());

        let line_b = IrqLine::new(&b, &a, EthIrqHandler::new(&signal, &counters), &port);
        assert!(line_b.step().unwrap().woke_rx);
        assert!(signal.is_pending());
        assert!(b.pending().is_empty());
        assert_eq!(port.yield_requests(), 1);
    }

    #[test]
    fn test_receive_holds_frame_while_pool_exhausted() {
        let mac = SimMac::new();
        let pool = PacketPool::<1, 64>::new();
        let mut eth = SimEth::new(&mac, &pool);
        mac.inject(vec![1; 8]);
        mac.inject(vec![2; 8]);
        // The ISR already acknowledged both frames.
        mac.clear(EthStatus::RECEIVE_READY);

        let (rx, _tx) = eth.receive(NetInstant::from_millis(0)).unwrap();
        assert!(eth.receive(NetInstant::from_millis(0)).is_none());
        assert_eq!(mac.rx_pending(), 1);
        // The held frame raises receive-ready again.
        assert_eq!(mac.pending(), EthStatus::RECEIVE_READY);

        let first = phy::RxToken::consume(rx, |frame| frame.to_vec());
        assert_eq!(first, [1; 8]);
        assert_eq!(pool.in_use(), 0);

        let (rx, _tx) = eth.receive(NetInstant::from_millis(0)).unwrap();
        assert_eq!(phy::RxToken::consume(rx, |frame| frame[0]), 2);
        assert_eq!(mac.rx_frames(), 2);
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let mac = SimMac::new();
        let pool = PacketPool::<1, 16>::new();
        let mut eth = SimEth::new(&mac, &pool);
        mac.inject(vec![0; 17]);
        assert!(eth.receive(NetInstant::from_millis(0)).is_none());
        assert_eq!(mac.rx_pending(), 0);
    }

    #[test]
    fn test_led_toggle_tracks_level() {
        let led = SimLed::new();
        led.toggle();
        assert!(led.is_on());
        led.toggle();
        assert!(!led.is_on());
        led.set(true);
        assert!(led.is_on());
        assert_eq!(led.toggles(), 2);
    }
}
