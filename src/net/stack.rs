//! smoltcp-backed [`Transport`].
//!
//! One [`NetStack`] owns the interface, a fixed socket set and the MAC
//! device. [`SharedStack`] puts it behind a critical section so the role
//! task, the deferred receive task and the link monitor on the network core
//! can all reach it.
//!
//! Ingress only happens in [`RxDrain::drain`]. Transmits flush egress right
//! away but leave received frames in the MAC for the deferred task.

use core::net::{Ipv4Addr, SocketAddrV4};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::phy::{Device, DeviceCapabilities, Medium};
use smoltcp::socket::udp;
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address};

use super::link::LinkControl;
use super::{EndpointId, RecvMeta, Transport};
use crate::config::{
    DEVICE_ADDR, EPHEMERAL_PORT_FIRST, GATEWAY_ADDR, MAC_ADDRESS, MAX_ENDPOINTS, PREFIX_LEN,
    SOCKET_BUFFER_SIZE, SOCKET_META_SLOTS,
};
use crate::error::NetError;
use crate::eth::RxDrain;
use crate::sync::Shared;

/// Static addressing of the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub mac: [u8; 6],
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            mac: MAC_ADDRESS,
            addr: DEVICE_ADDR,
            prefix_len: PREFIX_LEN,
            gateway: Some(GATEWAY_ADDR),
        }
    }
}

/// Backing storage of one UDP endpoint.
pub struct SocketBuffers {
    rx_meta: [udp::PacketMetadata; SOCKET_META_SLOTS],
    rx_payload: [u8; SOCKET_BUFFER_SIZE],
    tx_meta: [udp::PacketMetadata; SOCKET_META_SLOTS],
    tx_payload: [u8; SOCKET_BUFFER_SIZE],
}

impl SocketBuffers {
    pub const fn new() -> Self {
        Self {
            rx_meta: [const { udp::PacketMetadata::EMPTY }; SOCKET_META_SLOTS],
            rx_payload: [0; SOCKET_BUFFER_SIZE],
            tx_meta: [const { udp::PacketMetadata::EMPTY }; SOCKET_META_SLOTS],
            tx_payload: [0; SOCKET_BUFFER_SIZE],
        }
    }
}

impl Default for SocketBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Socket storage of one stack: a socket slot and its buffers per
/// endpoint.
pub struct StackStorage<'a> {
    pub sockets: [SocketStorage<'a>; MAX_ENDPOINTS],
    pub buffers: [SocketBuffers; MAX_ENDPOINTS],
}

impl StackStorage<'_> {
    pub const fn new() -> Self {
        Self {
            sockets: [const { SocketStorage::EMPTY }; MAX_ENDPOINTS],
            buffers: [const { SocketBuffers::new() }; MAX_ENDPOINTS],
        }
    }
}

impl Default for StackStorage<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Device wrapper that counts received frames and can hold ingress back.
struct CountingDevice<D> {
    inner: D,
    received: usize,
    rx_enabled: bool,
}

impl<D: Device> Device for CountingDevice<D> {
    type RxToken<'b>
        = D::RxToken<'b>
    where
        Self: 'b;
    type TxToken<'b>
        = D::TxToken<'b>
    where
        Self: 'b;

    fn receive(&mut self, timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        if !self.rx_enabled {
            return None;
        }
        let tokens = self.inner.receive(timestamp)?;
        self.received = self.received.wrapping_add(1);
        Some(tokens)
    }

    fn transmit(&mut self, timestamp: Instant) -> Option<Self::TxToken<'_>> {
        self.inner.transmit(timestamp)
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.inner.capabilities()
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    handle: SocketHandle,
    open: bool,
}

/// Interface, sockets and MAC of the network core.
pub struct NetStack<'a, D: Device> {
    device: CountingDevice<D>,
    iface: Interface,
    sockets: SocketSet<'a>,
    slots: [Option<Slot>; MAX_ENDPOINTS],
    addr: Ipv4Addr,
    next_ephemeral: u16,
    link_up: bool,
}

impl<'a, D: Device> NetStack<'a, D> {
    /// Bring the interface up on `device`. One endpoint slot is created per
    /// entry of `buffers`, bounded by the socket storage and
    /// [`MAX_ENDPOINTS`].
    pub fn new(
        device: D,
        cfg: &InterfaceConfig,
        sockets: &'a mut [SocketStorage<'a>],
        buffers: &'a mut [SocketBuffers],
        now_ms: u64,
    ) -> Self {
        let mut device = CountingDevice {
            inner: device,
            received: 0,
            rx_enabled: true,
        };
        let hw = match device.capabilities().medium {
            Medium::Ethernet => HardwareAddress::Ethernet(EthernetAddress(cfg.mac)),
            Medium::Ip => HardwareAddress::Ip,
        };
        let mut iface = Interface::new(Config::new(hw), &mut device, timestamp(now_ms));
        iface.update_ip_addrs(|addrs| {
            let cidr = IpCidr::new(IpAddress::Ipv4(to_wire(cfg.addr)), cfg.prefix_len);
            if addrs.push(cidr).is_err() {
                log::warn!("net: no room for address {}", cfg.addr);
            }
        });
        if let Some(gateway) = cfg.gateway {
            if iface.routes_mut().add_default_ipv4_route(to_wire(gateway)).is_err() {
                log::warn!("net: route table full, no default route via {}", gateway);
            }
        }

        let capacity = sockets.len();
        let mut set = SocketSet::new(sockets);
        let mut slots = [None; MAX_ENDPOINTS];
        for (slot, storage) in slots.iter_mut().zip(buffers).take(capacity) {
            let SocketBuffers {
                rx_meta,
                rx_payload,
                tx_meta,
                tx_payload,
            } = storage;
            let rx = udp::PacketBuffer::new(&mut rx_meta[..], &mut rx_payload[..]);
            let tx = udp::PacketBuffer::new(&mut tx_meta[..], &mut tx_payload[..]);
            *slot = Some(Slot {
                handle: set.add(udp::Socket::new(rx, tx)),
                open: false,
            });
        }

        log::info!(
            "net: {}/{} via {:?}, {} endpoint slot(s)",
            cfg.addr,
            cfg.prefix_len,
            cfg.gateway,
            slots.iter().flatten().count()
        );
        Self {
            device,
            iface,
            sockets: set,
            slots,
            addr: cfg.addr,
            next_ephemeral: EPHEMERAL_PORT_FIRST,
            link_up: true,
        }
    }

    /// [`new`](Self::new) over a [`StackStorage`].
    pub fn with_storage(
        device: D,
        cfg: &InterfaceConfig,
        storage: &'a mut StackStorage<'a>,
        now_ms: u64,
    ) -> Self {
        let StackStorage { sockets, buffers } = storage;
        Self::new(device, cfg, sockets, buffers, now_ms)
    }

    #[inline]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    #[inline]
    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn set_link_up(&mut self, up: bool) {
        self.link_up = up;
    }

    /// Access to the wrapped device, e.g. for statistics.
    pub fn device(&self) -> &D {
        &self.device.inner
    }

    pub fn open(&mut self) -> Result<EndpointId, NetError> {
        let (id, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find_map(|(id, slot)| match slot {
                Some(slot) if !slot.open => Some((id, slot)),
                _ => None,
            })
            .ok_or(NetError::NoEndpoint)?;
        slot.open = true;
        Ok(id)
    }

    pub fn bind(&mut self, id: EndpointId, port: u16) -> Result<u16, NetError> {
        let slot = self.slot(id)?;
        let port = if port == 0 {
            self.ephemeral_port()?
        } else if self.port_in_use(port) {
            return Err(NetError::AddrInUse(port));
        } else {
            port
        };
        self.sockets
            .get_mut::<udp::Socket>(slot.handle)
            .bind(port)
            .map_err(|_| NetError::AddrInUse(port))?;
        log::debug!("net: endpoint {} bound to {}", id, port);
        Ok(port)
    }

    pub fn send_to(
        &mut self,
        id: EndpointId,
        payload: &[u8],
        remote: SocketAddrV4,
        now_ms: u64,
    ) -> Result<(), NetError> {
        if !self.is_link_up() {
            return Err(NetError::LinkDown);
        }
        let ip = to_wire(*remote.ip());
        if !ip.is_unicast() || remote.port() == 0 {
            return Err(NetError::Unaddressable);
        }
        let slot = self.slot(id)?;
        let sock = self.sockets.get_mut::<udp::Socket>(slot.handle);
        if !sock.is_open() {
            return Err(NetError::NotBound);
        }
        if !sock.can_send() {
            return Err(NetError::BufferFull);
        }
        sock.send_slice(payload, IpEndpoint::new(IpAddress::Ipv4(ip), remote.port()))
            .map_err(|_| NetError::BufferFull)?;
        self.flush(now_ms);
        Ok(())
    }

    pub fn try_recv(&mut self, id: EndpointId, buf: &mut [u8]) -> Result<Option<RecvMeta>, NetError> {
        let slot = self.slot(id)?;
        let sock = self.sockets.get_mut::<udp::Socket>(slot.handle);
        if !sock.is_open() {
            return Err(NetError::NotBound);
        }
        let Ok((data, meta)) = sock.recv() else {
            return Ok(None);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        let IpAddress::Ipv4(from) = meta.endpoint.addr;
        Ok(Some(RecvMeta {
            len,
            from: SocketAddrV4::new(Ipv4Addr::from(from.0), meta.endpoint.port),
            truncated: data.len() > buf.len(),
        }))
    }

    pub fn close(&mut self, id: EndpointId) {
        if let Some(Some(slot)) = self.slots.get_mut(id) {
            self.sockets.get_mut::<udp::Socket>(slot.handle).close();
            slot.open = false;
        }
    }

    /// Process every frame the MAC holds. Returns the number of frames.
    pub fn poll_ingress(&mut self, now_ms: u64) -> usize {
        let start = self.device.received;
        loop {
            let seen = self.device.received;
            let _ = self.iface.poll(timestamp(now_ms), &mut self.device, &mut self.sockets);
            if self.device.received == seen {
                break;
            }
        }
        self.device.received.wrapping_sub(start)
    }

    /// Push queued datagrams out without touching ingress.
    fn flush(&mut self, now_ms: u64) {
        self.device.rx_enabled = false;
        let _ = self.iface.poll(timestamp(now_ms), &mut self.device, &mut self.sockets);
        self.device.rx_enabled = true;
    }

    fn slot(&self, id: EndpointId) -> Result<Slot, NetError> {
        match self.slots.get(id).copied().flatten() {
            Some(slot) if slot.open => Ok(slot),
            _ => Err(NetError::NotBound),
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.slots.iter().flatten().any(|slot| {
            let sock = self.sockets.get::<udp::Socket>(slot.handle);
            sock.is_open() && sock.endpoint().port == port
        })
    }

    fn ephemeral_port(&mut self) -> Result<u16, NetError> {
        for _ in EPHEMERAL_PORT_FIRST..=u16::MAX {
            let port = self.next_ephemeral;
            self.next_ephemeral = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_FIRST);
            if !self.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(NetError::AddrInUse(0))
    }
}

/// [`NetStack`] shared by the tasks of the network core.
pub struct SharedStack<'a, D: Device> {
    addr: Ipv4Addr,
    inner: Shared<NetStack<'a, D>>,
}

impl<'a, D: Device> SharedStack<'a, D> {
    pub fn new(stack: NetStack<'a, D>) -> Self {
        Self {
            addr: stack.addr(),
            inner: Shared::new(stack),
        }
    }

    /// Run `f` with exclusive access to the stack.
    pub fn with<R>(&self, f: impl FnOnce(&mut NetStack<'a, D>) -> R) -> R {
        self.inner.lock(f)
    }
}

impl<D: Device + Send> Transport for SharedStack<'_, D> {
    fn local_ip(&self) -> Ipv4Addr {
        self.addr
    }

    fn open(&self) -> Result<EndpointId, NetError> {
        self.with(|s| s.open())
    }

    fn bind(&self, id: EndpointId, port: u16) -> Result<u16, NetError> {
        self.with(|s| s.bind(id, port))
    }

    fn send_to(
        &self,
        id: EndpointId,
        payload: &[u8],
        remote: SocketAddrV4,
        now_ms: u64,
    ) -> Result<(), NetError> {
        self.with(|s| s.send_to(id, payload, remote, now_ms))
    }

    fn try_recv(&self, id: EndpointId, buf: &mut [u8]) -> Result<Option<RecvMeta>, NetError> {
        self.with(|s| s.try_recv(id, buf))
    }

    fn close(&self, id: EndpointId) {
        self.with(|s| s.close(id))
    }
}

impl<D: Device + Send> RxDrain for SharedStack<'_, D> {
    fn drain(&self, now_ms: u64) -> usize {
        self.with(|s| s.poll_ingress(now_ms))
    }
}

impl<D: Device + Send> LinkControl for SharedStack<'_, D> {
    fn set_link_up(&self, up: bool) {
        self.with(|s| s.set_link_up(up))
    }
}

fn timestamp(now_ms: u64) -> Instant {
    Instant::from_millis(i64::try_from(now_ms).unwrap_or(i64::MAX))
}

fn to_wire(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address(addr.octets())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::{RxToken, TxToken};
    use std::collections::VecDeque;
    use std::vec::Vec;

    /// IP-medium wire that hands every transmitted packet back as received.
    #[derive(Default)]
    struct Wire {
        queue: VecDeque<Vec<u8>>,
    }

    struct WireRx(Vec<u8>);
    struct WireTx<'a>(&'a mut VecDeque<Vec<u8>>);

    impl RxToken for WireRx {
        fn consume<R, F>(mut self, f: F) -> R
        where
            F: FnOnce(&mut [u8]) -> R,
        {
            f(&mut self.0)
        }
    }

    impl TxToken for WireTx<'_> {
        fn consume<R, F>(self, len: usize, f: F) -> R
        where
            F: FnOnce(&mut [u8]) -> R,
        {
            let mut frame = vec![0u8; len];
            let r = f(&mut frame);
            self.0.push_back(frame);
            r
        }
    }

    impl Device for Wire {
        type RxToken<'b>
            = WireRx
        where
            Self: 'b;
        type TxToken<'b>
            = WireTx<'b>
        where
            Self: 'b;

        fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
            let frame = self.queue.pop_front()?;
            Some((WireRx(frame), WireTx(&mut self.queue)))
        }

        fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
            Some(WireTx(&mut self.queue))
        }

        fn capabilities(&self) -> DeviceCapabilities {
            let mut caps = DeviceCapabilities::default();
            caps.medium = Medium::Ip;
            caps.max_transmission_unit = 1500;
            caps
        }
    }

    fn storage<'a>() -> std::boxed::Box<StackStorage<'a>> {
        std::boxed::Box::new(StackStorage::new())
    }

    fn stack<'a>(storage: &'a mut StackStorage<'a>) -> NetStack<'a, Wire> {
        NetStack::with_storage(Wire::default(), &InterfaceConfig::default(), storage, 0)
    }

    #[test]
    fn test_datagram_waits_for_ingress_drain() {
        let mut st = storage();
        let mut net = stack(&mut st);
        let server = net.open().unwrap();
        assert_eq!(net.bind(server, 8080), Ok(8080));
        let client = net.open().unwrap();
        let client_port = net.bind(client, 0).unwrap();

        let to = SocketAddrV4::new(DEVICE_ADDR, 8080);
        net.send_to(client, &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0], to, 1).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(net.try_recv(server, &mut buf), Ok(None));
        assert_eq!(net.poll_ingress(2), 1);
        let meta = net.try_recv(server, &mut buf).unwrap().unwrap();
        assert_eq!(meta.len, 10);
        assert_eq!(meta.from, SocketAddrV4::new(DEVICE_ADDR, client_port));
        assert!(!meta.truncated);
        assert_eq!(buf[0], 1);
        assert_eq!(net.poll_ingress(3), 0);
    }

    #[test]
    fn test_long_datagram_truncated() {
        let mut st = storage();
        let mut net = stack(&mut st);
        let server = net.open().unwrap();
        net.bind(server, 8080).unwrap();
        let client = net.open().unwrap();
        net.bind(client, 0).unwrap();

        net.send_to(client, &[9u8; 200], SocketAddrV4::new(DEVICE_ADDR, 8080), 0)
            .unwrap();
        net.poll_ingress(0);
        let mut buf = [0u8; 128];
        let meta = net.try_recv(server, &mut buf).unwrap().unwrap();
        assert_eq!(meta.len, 128);
        assert!(meta.truncated);
    }

    #[test]
    fn test_ephemeral_ports_and_conflicts() {
        let mut st = storage();
        let mut net = stack(&mut st);
        let a = net.open().unwrap();
        let b = net.open().unwrap();
        assert_eq!(net.open(), Err(NetError::NoEndpoint));

        assert_eq!(net.bind(a, 0), Ok(EPHEMERAL_PORT_FIRST));
        assert_eq!(
            net.bind(b, EPHEMERAL_PORT_FIRST),
            Err(NetError::AddrInUse(EPHEMERAL_PORT_FIRST))
        );
        assert_eq!(net.bind(b, 0), Ok(EPHEMERAL_PORT_FIRST + 1));

        net.close(a);
        assert_eq!(net.bind(a, 0), Err(NetError::NotBound));
        assert_eq!(net.open(), Ok(a));
    }

    #[test]
    fn test_send_rejections() {
        let mut st = storage();
        let mut net = stack(&mut st);
        let id = net.open().unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 196), 8080);

        assert_eq!(net.send_to(id, &[1], remote, 0), Err(NetError::NotBound));
        net.bind(id, 0).unwrap();
        assert_eq!(
            net.send_to(id, &[1], SocketAddrV4::new(Ipv4Addr::BROADCAST, 8080), 0),
            Err(NetError::Unaddressable)
        );

        net.set_link_up(false);
        assert!(!net.is_link_up());
        assert_eq!(net.send_to(id, &[1], remote, 0), Err(NetError::LinkDown));
        net.set_link_up(true);
        assert!(net.is_link_up());
        assert_eq!(net.send_to(id, &[1], remote, 0), Ok(()));
        assert_eq!(net.device().queue.len(), 1);
    }
}
