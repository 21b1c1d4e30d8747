//! # UDP Test Harness
//!
//! Two fixed roles exercise the receive path end to end:
//!
//! - [`client`]: ephemeral endpoint, connected to a fixed remote, sends the
//!   10-byte test datagram once per interval.
//! - [`server`]: endpoint on the well-known port, blocking receive without
//!   timeout, logs every datagram.
//!
//! Both talk to the network through [`Transport`]. The concrete transport is
//! [`stack::SharedStack`] (smoltcp), whose receive path is itself driven by
//! the deferred ETH interrupt handoff: nothing reaches an endpoint unless
//! the deferred task drains the MAC.

use core::net::{Ipv4Addr, SocketAddrV4};

use crate::context::TaskContext;
use crate::error::{NetError, RecvError};
use crate::pool::PacketBuffer;

pub mod client;
pub mod link;
pub mod server;
pub mod stack;

/// Which test role the network core runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetRole {
    Client,
    Server,
}

/// Transport-local endpoint slot.
pub type EndpointId = usize;

/// Metadata of one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMeta {
    /// Bytes copied into the caller's buffer.
    pub len: usize,
    /// Sender.
    pub from: SocketAddrV4,
    /// The datagram was longer than the caller's buffer and got cut.
    pub truncated: bool,
}

/// Datagram service consumed by the harness.
pub trait Transport: Sync {
    /// Address of the local interface.
    fn local_ip(&self) -> Ipv4Addr;

    /// Reserve an unbound endpoint slot.
    fn open(&self) -> Result<EndpointId, NetError>;

    /// Bind to `port`; `0` picks an ephemeral port. Returns the bound port.
    fn bind(&self, id: EndpointId, port: u16) -> Result<u16, NetError>;

    /// Queue `payload` for `remote`. The payload is copied before this
    /// returns; delivery continues asynchronously.
    fn send_to(
        &self,
        id: EndpointId,
        payload: &[u8],
        remote: SocketAddrV4,
        now_ms: u64,
    ) -> Result<(), NetError>;

    /// Copy the oldest queued datagram into `buf`, if there is one.
    fn try_recv(&self, id: EndpointId, buf: &mut [u8]) -> Result<Option<RecvMeta>, NetError>;

    /// Unbind and release the slot.
    fn close(&self, id: EndpointId);
}

/// Lifecycle of an [`Endpoint`].
///
/// ```text
///   Unbound ──bind──► Bound ──connect──► Connected
///      │                │                    │
///      └────────────────┴──── close ─────────┴──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unbound,
    Bound,
    Connected,
    Closed,
}

/// UDP endpoint owned by exactly one task. Closed on drop.
pub struct Endpoint<'t> {
    transport: &'t dyn Transport,
    id: EndpointId,
    local: SocketAddrV4,
    remote: Option<SocketAddrV4>,
    state: EndpointState,
}

impl<'t> Endpoint<'t> {
    pub fn open(transport: &'t dyn Transport) -> Result<Self, NetError> {
        let id = transport.open()?;
        Ok(Self {
            transport,
            id,
            local: SocketAddrV4::new(transport.local_ip(), 0),
            remote: None,
            state: EndpointState::Unbound,
        })
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        self.state
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    /// Bind to `port` (`0` for ephemeral).
    pub fn bind(&mut self, port: u16) -> Result<SocketAddrV4, NetError> {
        if self.state != EndpointState::Unbound {
            return Err(NetError::InvalidState(self.state));
        }
        let port = self.transport.bind(self.id, port)?;
        self.local.set_port(port);
        self.state = EndpointState::Bound;
        Ok(self.local)
    }

    /// Fix the remote peer. An unbound endpoint is bound to an ephemeral
    /// port first.
    pub fn connect(&mut self, remote: SocketAddrV4) -> Result<(), NetError> {
        match self.state {
            EndpointState::Unbound => {
                self.bind(0)?;
            }
            EndpointState::Bound | EndpointState::Connected => {}
            EndpointState::Closed => return Err(NetError::InvalidState(self.state)),
        }
        if !is_unicast(remote) {
            return Err(NetError::Unaddressable);
        }
        self.remote = Some(remote);
        self.state = EndpointState::Connected;
        Ok(())
    }

    /// Transmit `packet` to the connected peer. The buffer goes back to its
    /// pool as soon as the transport took its copy, whatever the outcome.
    pub fn send(&mut self, ctx: &TaskContext<'_>, packet: PacketBuffer<'_>) -> Result<usize, NetError> {
        let remote = match (self.state, self.remote) {
            (EndpointState::Connected, Some(remote)) => remote,
            (state, _) => return Err(NetError::InvalidState(state)),
        };
        self.transport.send_to(self.id, &packet, remote, ctx.now_ms())?;
        Ok(packet.len())
    }

    /// Next datagram, if one is queued.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<RecvMeta>, NetError> {
        match self.state {
            EndpointState::Bound | EndpointState::Connected => self.transport.try_recv(self.id, buf),
            state => Err(NetError::InvalidState(state)),
        }
    }

    /// Block until a datagram arrives. No timeout; returns early only when
    /// the task is cancelled.
    pub fn recv(&mut self, ctx: &TaskContext<'_>, buf: &mut [u8]) -> Result<RecvMeta, RecvError> {
        loop {
            if let Some(meta) = self.try_recv(buf)? {
                return Ok(meta);
            }
            ctx.relax()?;
        }
    }

    /// Release the transport slot. Further operations fail.
    pub fn close(&mut self) {
        if self.state != EndpointState::Closed {
            self.transport.close(self.id);
            self.state = EndpointState::Closed;
        }
    }
}

impl Drop for Endpoint<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_unicast(addr: SocketAddrV4) -> bool {
    let ip = addr.ip();
    addr.port() != 0 && !ip.is_unspecified() && !ip.is_broadcast() && !ip.is_multicast()
}


#[cfg(test)]
mod tests {
    use super::testing::MemTransport;
    use super::*;
    use crate::context::testing::StepPort;
    use crate::pool::PacketPool;
    use crate::sync::CancelToken;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 123);

    #[test]
    fn test_endpoint_lifecycle() {
        let transport = MemTransport::new(IP);
        let mut ep = Endpoint::open(&transport).unwrap();
        assert_eq!(ep.state(), EndpointState::Unbound);

        let local = ep.bind(8080).unwrap();
        assert_eq!(local, SocketAddrV4::new(IP, 8080));
        assert_eq!(ep.state(), EndpointState::Bound);
        assert_eq!(ep.bind(8081), Err(NetError::InvalidState(EndpointState::Bound)));

        let remote = SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 196), 8080);
        ep.connect(remote).unwrap();
        assert_eq!(ep.state(), EndpointState::Connected);
        assert_eq!(ep.remote_addr(), Some(remote));

        ep.close();
        assert_eq!(ep.state(), EndpointState::Closed);
        drop(ep);
        assert_eq!(transport.state.lock().unwrap().closed, 1);
    }

    #[test]
    fn test_connect_binds_ephemeral() {
        let transport = MemTransport::new(IP);
        let mut ep = Endpoint::open(&transport).unwrap();
        ep.connect(SocketAddrV4::new(IP, 8080)).unwrap();
        assert_ne!(ep.local_addr().port(), 0);
    }

    #[test]
    fn test_connect_rejects_non_unicast() {
        let transport = MemTransport::new(IP);
        let mut ep = Endpoint::open(&transport).unwrap();
        assert_eq!(
            ep.connect(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080)),
            Err(NetError::Unaddressable)
        );
        assert_eq!(
            ep.connect(SocketAddrV4::new(IP, 0)),
            Err(NetError::Unaddressable)
        );
        assert_eq!(
            ep.connect(SocketAddrV4::new(Ipv4Addr::BROADCAST, 8080)),
            Err(NetError::Unaddressable)
        );
    }

    #[test]
    fn test_send_requires_connection_and_frees_buffer() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let ctx = TaskContext::new("t", &port, &cancel);
        let pool = PacketPool::<2, 32>::new();
        let transport = MemTransport::new(IP);
        let mut ep = Endpoint::open(&transport).unwrap();
        ep.bind(0).unwrap();

        let err = ep.send(&ctx, pool.alloc(10).unwrap()).unwrap_err();
        assert_eq!(err, NetError::InvalidState(EndpointState::Bound));
        assert_eq!(pool.in_use(), 0);

        ep.connect(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9)).unwrap();
        transport.state.lock().unwrap().fail_sends = true;
        assert_eq!(ep.send(&ctx, pool.alloc(10).unwrap()), Err(NetError::BufferFull));
        assert_eq!(pool.in_use(), 0);

        transport.state.lock().unwrap().fail_sends = false;
        assert_eq!(ep.send(&ctx, pool.alloc(10).unwrap()), Ok(10));
        assert_eq!(pool.in_use(), 0);
        assert_eq!(transport.state.lock().unwrap().egress.len(), 1);
    }

    #[test]
    fn test_recv_blocks_until_delivery() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        let transport = MemTransport::new(IP);
        let from = SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 196), 40000);

        std::thread::scope(|s| {
            let rx = s.spawn(|| {
                let ctx = TaskContext::new("srv", &port, &cancel);
                let mut ep = Endpoint::open(&transport).unwrap();
                ep.bind(8080).unwrap();
                let mut buf = [0u8; 4];
                let meta = ep.recv(&ctx, &mut buf).unwrap();
                (meta, buf)
            });
            while transport.state.lock().unwrap().ports.first() != Some(&Some(8080)) {
                std::thread::yield_now();
            }
            transport.deliver(8080, &[1, 2, 3, 4, 5, 6], from);
            let (meta, buf) = rx.join().unwrap();
            assert_eq!(meta, RecvMeta { len: 4, from, truncated: true });
            assert_eq!(buf, [1, 2, 3, 4]);
        });
    }

    #[test]
    fn test_recv_cancelled() {
        let port = StepPort::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = TaskContext::new("srv", &port, &cancel);
        let transport = MemTransport::new(IP);
        let mut ep = Endpoint::open(&transport).unwrap();
        ep.bind(8080).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ep.recv(&ctx, &mut buf), Err(RecvError::Cancelled(crate::error::Cancelled)));
    }
}
