//! Client role: periodic UDP transmit of the fixed test datagram.

use core::net::SocketAddrV4;
use core::sync::atomic::{AtomicU32, Ordering};

use super::Endpoint;
use super::Transport;
use crate::config::{CLIENT_INTERVAL_MS, CLIENT_PAYLOAD, REMOTE_ADDR};
use crate::context::TaskContext;
use crate::error::{PoolError, SetupError};
use crate::pool::{PacketBuffer, PacketPool};

/// Source of transmit buffers.
pub trait BufferSource: Sync {
    fn alloc(&self, len: usize) -> Result<PacketBuffer<'_>, PoolError>;
}

impl<const SLOTS: usize, const SIZE: usize> BufferSource for PacketPool<SLOTS, SIZE> {
    fn alloc(&self, len: usize) -> Result<PacketBuffer<'_>, PoolError> {
        PacketPool::alloc(self, len)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub remote: SocketAddrV4,
    pub payload: &'static [u8],
    pub interval_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote: REMOTE_ADDR,
            payload: &CLIENT_PAYLOAD,
            interval_ms: CLIENT_INTERVAL_MS,
        }
    }
}

/// Per-cycle outcome counters.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub cycles: AtomicU32,
    pub sent: AtomicU32,
    pub send_failed: AtomicU32,
    pub alloc_failed: AtomicU32,
}

impl ClientStats {
    pub const fn new() -> Self {
        Self {
            cycles: AtomicU32::new(0),
            sent: AtomicU32::new(0),
            send_failed: AtomicU32::new(0),
            alloc_failed: AtomicU32::new(0),
        }
    }
}

/// Client task body.
///
/// Setup failures are returned for the caller to fail-stop on. In steady
/// state a failed allocation skips the cycle and a failed transmit is not
/// retried; both wait for the next tick. Returns `Ok` only when cancelled.
pub fn client_task(
    ctx: &TaskContext<'_>,
    transport: &dyn Transport,
    buffers: &dyn BufferSource,
    cfg: &ClientConfig,
    stats: &ClientStats,
) -> Result<(), SetupError> {
    log::info!("{}: client init", ctx.name());

    let mut ep = Endpoint::open(transport).map_err(|source| SetupError::Bind { port: 0, source })?;
    ep.bind(0).map_err(|source| SetupError::Bind { port: 0, source })?;
    ep.connect(cfg.remote).map_err(|source| SetupError::Connect {
        remote: cfg.remote,
        source,
    })?;
    log::info!("{}: {} -> {}", ctx.name(), ep.local_addr(), cfg.remote);

    loop {
        let seq = stats.cycles.fetch_add(1, Ordering::Relaxed);
        match buffers.alloc(cfg.payload.len()) {
            Ok(mut packet) => {
                packet.copy_from_slice(cfg.payload);
                log::debug!("{}: send #{} ({} bytes)", ctx.name(), seq, packet.len());
                match ep.send(ctx, packet) {
                    Ok(_) => {
                        stats.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        log::warn!("{}: send #{} failed: {}", ctx.name(), seq, err);
                        stats.send_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(err) => {
                log::warn!("{}: cycle #{} skipped: {}", ctx.name(), seq, err);
                stats.alloc_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if ctx.sleep_ms(cfg.interval_ms).is_err() {
            log::info!("{}: cancelled after {} cycle(s)", ctx.name(), seq + 1);
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StepPort;
    use crate::context::Port;
    use crate::error::NetError;
    use crate::net::testing::MemTransport;
    use crate::sync::CancelToken;
    use core::net::Ipv4Addr;
    use std::vec::Vec;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 123);

    /// Cancels after `limit` sleeps so the loop runs a known number of cycles.
    struct CountdownPort {
        inner: StepPort,
        cancel: CancelToken,
        limit: u64,
    }

    impl Port for CountdownPort {
        fn now_ms(&self) -> u64 {
            self.inner.now_ms()
        }
        fn delay_ms(&self, ms: u32) {
            self.inner.delay_ms(ms);
            if self.inner.now_ms() >= self.limit {
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

    fn countdown(cycles: u64, interval_ms: u32) -> CountdownPort {
        CountdownPort {
            inner: StepPort::new(),
            cancel: CancelToken::new(),
            limit: cycles * u64::from(interval_ms),
        }
    }

    #[test]
    fn test_sends_fixed_payload_each_cycle() {
        let cfg = ClientConfig {
            remote: SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 196), 8080),
            interval_ms: 10,
            ..ClientConfig::default()
        };
        let port = countdown(3, cfg.interval_ms);
        let ctx = TaskContext::new("client", &port, &port.cancel);
        let transport = MemTransport::new(IP);
        let pool = PacketPool::<2, 64>::new();
        let stats = ClientStats::new();

        assert_eq!(client_task(&ctx, &transport, &pool, &cfg, &stats), Ok(()));

        let st = transport.state.lock().unwrap();
        let payloads: Vec<_> = st.egress.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(payloads.len(), 3);
        for p in &payloads {
            assert_eq!(p.as_slice(), &CLIENT_PAYLOAD);
        }
        assert!(st.egress.iter().all(|(_, to)| *to == cfg.remote));
        assert_eq!(stats.sent.load(Ordering::Relaxed), 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_exhausted_pool_skips_cycle() {
        let cfg = ClientConfig {
            interval_ms: 5,
            ..ClientConfig::default()
        };
        let port = countdown(4, cfg.interval_ms);
        let ctx = TaskContext::new("client", &port, &port.cancel);
        let transport = MemTransport::new(IP);
        let pool = PacketPool::<1, 64>::new();
        let stats = ClientStats::new();

        let held = pool.alloc(1).unwrap();
        assert_eq!(client_task(&ctx, &transport, &pool, &cfg, &stats), Ok(()));
        drop(held);

        assert_eq!(stats.alloc_failed.load(Ordering::Relaxed), 4);
        assert_eq!(stats.sent.load(Ordering::Relaxed), 0);
        assert!(transport.state.lock().unwrap().egress.is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_send_failure_not_retried() {
        let cfg = ClientConfig {
            interval_ms: 5,
            ..ClientConfig::default()
        };
        let port = countdown(2, cfg.interval_ms);
        let ctx = TaskContext::new("client", &port, &port.cancel);
        let transport = MemTransport::new(IP);
        transport.state.lock().unwrap().fail_sends = true;
        let pool = PacketPool::<2, 64>::new();
        let stats = ClientStats::new();

        assert_eq!(client_task(&ctx, &transport, &pool, &cfg, &stats), Ok(()));
        assert_eq!(stats.send_failed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.cycles.load(Ordering::Relaxed), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_connect_failure_is_fatal() {
        let cfg = ClientConfig {
            remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080),
            ..ClientConfig::default()
        };
        let port = countdown(1, 1);
        let ctx = TaskContext::new("client", &port, &port.cancel);
        let transport = MemTransport::new(IP);
        let pool = PacketPool::<2, 64>::new();
        let stats = ClientStats::new();

        assert_eq!(
            client_task(&ctx, &transport, &pool, &cfg, &stats),
            Err(SetupError::Connect {
                remote: cfg.remote,
                source: NetError::Unaddressable
            })
        );
        assert_eq!(stats.cycles.load(Ordering::Relaxed), 0);
    }
}
