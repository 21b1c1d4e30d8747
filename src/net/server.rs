//! Server role: blocking receive on the well-known port.

use core::net::SocketAddrV4;

use super::Endpoint;
use super::Transport;
use crate::config::{SERVER_PAUSE_MS, SERVER_RECV_BUFFER, UDP_SERVER_PORT};
use crate::context::TaskContext;
use crate::error::{RecvError, SetupError};

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub port: u16,
    /// Pause after handling each datagram.
    pub pause_ms: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: UDP_SERVER_PORT,
            pause_ms: SERVER_PAUSE_MS,
        }
    }
}

/// One datagram as handed to the server's observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'b> {
    pub seq: u32,
    pub from: SocketAddrV4,
    pub payload: &'b [u8],
    /// The sender's datagram did not fit the receive buffer.
    pub truncated: bool,
}

/// Server task body. `on_datagram` sees every datagram after it was logged.
///
/// A bind failure is returned for the caller to fail-stop on. Returns `Ok`
/// only when cancelled.
pub fn server_task(
    ctx: &TaskContext<'_>,
    transport: &dyn Transport,
    cfg: &ServerConfig,
    mut on_datagram: impl FnMut(&Datagram<'_>),
) -> Result<(), SetupError> {
    log::info!("{}: server init", ctx.name());

    let bind_err = |source| SetupError::Bind {
        port: cfg.port,
        source,
    };
    let mut ep = Endpoint::open(transport).map_err(bind_err)?;
    ep.bind(cfg.port).map_err(bind_err)?;
    log::info!("{}: listening on {}", ctx.name(), ep.local_addr());

    let mut buf = [0u8; SERVER_RECV_BUFFER];
    let mut seq = 0u32;
    loop {
        let meta = match ep.recv(ctx, &mut buf) {
            Ok(meta) => meta,
            Err(RecvError::Cancelled(_)) => {
                log::info!("{}: cancelled after {} datagram(s)", ctx.name(), seq);
                return Ok(());
            }
            Err(RecvError::Net(err)) => {
                log::warn!("{}: receive failed: {}", ctx.name(), err);
                if ctx.relax().is_err() {
                    return Ok(());
                }
                continue;
            }
        };

        let datagram = Datagram {
            seq,
            from: meta.from,
            payload: &buf[..meta.len],
            truncated: meta.truncated,
        };
        if datagram.truncated {
            log::warn!(
                "{}: datagram #{} from {} truncated to {} bytes",
                ctx.name(),
                seq,
                meta.from,
                meta.len
            );
        }
        log::info!(
            "{}: recv #{} from {}: {:02x?}",
            ctx.name(),
            seq,
            meta.from,
            datagram.payload
        );
        on_datagram(&datagram);
        seq = seq.wrapping_add(1);

        if ctx.sleep_ms(cfg.pause_ms).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StepPort;
    use crate::error::NetError;
    use crate::net::testing::MemTransport;
    use crate::sync::CancelToken;
    use core::net::Ipv4Addr;
    use std::vec::Vec;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 123);

    #[test]
    fn test_bind_failure_is_fatal() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let ctx = TaskContext::new("server", &port, &cancel);
        let transport = MemTransport::new(IP);
        transport.state.lock().unwrap().refuse_bind = true;

        let result = server_task(&ctx, &transport, &ServerConfig::default(), |_| {});
        assert_eq!(
            result,
            Err(SetupError::Bind {
                port: UDP_SERVER_PORT,
                source: NetError::AddrInUse(UDP_SERVER_PORT)
            })
        );
    }

    #[test]
    fn test_receives_and_reports_truncation() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let transport = MemTransport::new(IP);
        let from = SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 196), 50000);
        let cfg = ServerConfig { port: 8080, pause_ms: 0 };

        let mut seen: Vec<(u32, usize, bool, u8)> = Vec::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                while transport.state.lock().unwrap().ports.first() != Some(&Some(8080)) {
                    std::thread::yield_now();
                }
                transport.deliver(8080, &[1, 0, 0], from);
                transport.deliver(8080, &[7u8; SERVER_RECV_BUFFER + 40], from);
                while !transport.state.lock().unwrap().queues[0].is_empty() {
                    std::thread::yield_now();
                }
                cancel.cancel();
            });

            let ctx = TaskContext::new("server", &port, &cancel);
            let result = server_task(&ctx, &transport, &cfg, |d| {
                seen.push((d.seq, d.payload.len(), d.truncated, d.payload[0]));
            });
            assert_eq!(result, Ok(()));
        });

        assert_eq!(seen, [(0, 3, false, 1), (1, SERVER_RECV_BUFFER, true, 7)]);
        assert_eq!(transport.state.lock().unwrap().closed, 1);
    }
}
