//! # mcsync Configuration
//!
//! Compile-time constants for the firmware image. There is no command line,
//! environment or persisted configuration: addresses, ports, periods and the
//! test payload are all fixed here.

use core::net::{Ipv4Addr, SocketAddrV4};

use crate::net::NetRole;

// ---------------------------------------------------------------------------
// Cores and boot rendezvous
// ---------------------------------------------------------------------------

/// Number of cores that boot from this image.
pub const NUM_CORES: usize = 3;

/// Barrier mask every core must contribute before any core touches shared
/// hardware. Bit `i` belongs to core `i`.
pub const REQUIRED_CORES_MASK: u32 = (1 << NUM_CORES) - 1;

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Read-only register holding the number of the core that reads it.
pub const CORE_ID_ADDR: usize = 0xD000_0000;

/// Base address of the Ethernet MAC (Synopsys Ethernet QoS).
pub const ETH_BASE: usize = 0x4002_8000;

/// NVIC line of the Ethernet global interrupt.
pub const ETH_IRQ_NUMBER: u16 = 61;

/// MDIO address of the PHY.
pub const PHY_ADDRESS: u8 = 0;

/// GPIO port the board LEDs are wired to.
pub const LED_GPIO_BASE: usize = 0x5802_0400;

/// LED toggled by the ETH ISR on every receive interrupt.
pub const LED_ETH_ACTIVITY_PIN: u8 = 0;

/// LED toggled by the rate-gate consumer.
pub const LED_RATE_GATE_PIN: u8 = 7;

/// Heartbeat LED of the otherwise idle core.
pub const LED_HEARTBEAT_PIN: u8 = 14;

/// DMA descriptors per direction.
pub const ETH_DESCRIPTORS: usize = 4;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Maximum number of tasks per core, idle task included.
pub const MAX_TASKS: usize = 8;

/// SysTick frequency in Hz. One tick is one millisecond.
pub const TICK_HZ: u32 = 1000;

/// Per-task stack size in bytes. Must hold the deepest call chain plus the
/// hardware exception frame (32 bytes) and the software-saved R4–R11
/// (32 bytes).
pub const STACK_SIZE: usize = 2048;

/// Core clock in Hz.
pub const SYSTEM_CLOCK_HZ: u32 = 64_000_000;

/// Longest single sleep before a task re-checks its cancellation token.
pub const SLEEP_SLICE_MS: u32 = 10;

/// Longest a task stays blocked on a signal before it looks at the signal
/// and its cancellation token again. Covers posts from another core, whose
/// scheduler cannot be reached.
pub const WAIT_RECHECK_MS: u32 = 10;

// ---------------------------------------------------------------------------
// Task priorities (higher = more important)
// ---------------------------------------------------------------------------

/// Deferred ETH receive task. Must be the highest-priority task on its core.
pub const PRIO_ETH_RX: u8 = 5;
/// PHY link monitor. Below the receive task.
pub const PRIO_LINK_MONITOR: u8 = 4;
/// UDP client or server role.
pub const PRIO_NET_ROLE: u8 = 3;
/// Fast rate-gate task (producer).
pub const PRIO_RATE_PRODUCER: u8 = 3;
/// Slow rate-gate task (consumer).
pub const PRIO_RATE_CONSUMER: u8 = 2;
/// Heartbeat on the otherwise idle core.
pub const PRIO_HEARTBEAT: u8 = 1;

/// NVIC priority of the ETH interrupt. Numerically lower is more urgent on
/// Cortex-M; every task runs in thread mode below it.
pub const ISR_PRIORITY_ETH_IRQ: u8 = 3 << 4;

// ---------------------------------------------------------------------------
// Rate gate
// ---------------------------------------------------------------------------

/// Period of the fast task, in milliseconds.
pub const RATE_PRODUCER_PERIOD_MS: u32 = 100;

/// The fast task posts one credit every `RATE_DIVISOR` cycles.
pub const RATE_DIVISOR: u32 = 5;

/// Period of the slow task. At least `RATE_PRODUCER_PERIOD_MS * RATE_DIVISOR`.
pub const RATE_CONSUMER_PERIOD_MS: u32 = 500;

/// Heartbeat LED period on the idle core.
pub const HEARTBEAT_PERIOD_MS: u32 = 1000;

// ---------------------------------------------------------------------------
// Packet buffers
// ---------------------------------------------------------------------------

/// Number of pool-allocated packet buffers.
pub const PACKET_POOL_SLOTS: usize = 8;

/// Size of one packet buffer. Large enough for a full Ethernet frame.
pub const PACKET_BUFFER_SIZE: usize = 1536;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// MAC address of the on-chip Ethernet controller.
pub const MAC_ADDRESS: [u8; 6] = [0x00, 0x20, 0x30, 0x40, 0x50, 0x60];

/// Maximum transfer unit of the interface.
pub const MTU: usize = 1500;

/// Device address on the local subnet.
pub const DEVICE_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 123);

/// Subnet prefix length (`255.255.255.0`).
pub const PREFIX_LEN: u8 = 24;

/// Default gateway.
pub const GATEWAY_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 1);

/// Test role of the network core. The image runs exactly one of them.
pub const NET_ROLE: NetRole = NetRole::Client;

/// Well-known UDP port of the test server.
pub const UDP_SERVER_PORT: u16 = 8080;

/// Host the client role transmits to.
pub const REMOTE_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 196), UDP_SERVER_PORT);

/// Length of the client test datagram.
pub const CLIENT_PAYLOAD_LEN: usize = 10;

/// Client test datagram: first byte `1`, remaining bytes zero.
pub const CLIENT_PAYLOAD: [u8; CLIENT_PAYLOAD_LEN] = {
    let mut payload = [0u8; CLIENT_PAYLOAD_LEN];
    payload[0] = 1;
    payload
};

/// Interval between client transmissions.
pub const CLIENT_INTERVAL_MS: u32 = 1000;

/// Receive buffer of the server role. Longer datagrams are truncated.
pub const SERVER_RECV_BUFFER: usize = 128;

/// Pause after every datagram the server handles.
pub const SERVER_PAUSE_MS: u32 = 1000;

/// PHY link poll period.
pub const LINK_MONITOR_PERIOD_MS: u32 = 1000;

/// Number of UDP endpoints the stack can host at once.
pub const MAX_ENDPOINTS: usize = 2;

/// Datagram slots per endpoint direction.
pub const SOCKET_META_SLOTS: usize = 8;

/// Payload bytes per endpoint direction.
pub const SOCKET_BUFFER_SIZE: usize = 2048;

/// First port handed out for endpoints bound to port 0.
pub const EPHEMERAL_PORT_FIRST: u16 = 49152;
