//! # Ethernet MAC Driver
//!
//! Minimal driver for the Synopsys DesignWare Ethernet QoS MAC: one DMA
//! channel, descriptor rings in static memory, PHY behind MDIO.
//!
//! - [`Gmac`] is the `smoltcp` device the network stack owns.
//! - [`GmacDma`] is the ISR's view of the DMA channel status register.
//! - [`GmacPhy`] reads the PHY link state for the link monitor.
//!
//! ```text
//!   rx ring:  [D0 own=DMA][D1 own=DMA][D2 own=CPU][D3 own=DMA]
//!                                       ▲ next: handed to smoltcp,
//!                                         re-armed after consume
//! ```

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;

use crate::config::{ETH_BASE, ETH_DESCRIPTORS, MTU, PACKET_BUFFER_SIZE};
use crate::eth::{EthInterruptRegs, EthStatus};
use crate::net::link::LinkStatus;

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

const MACCR: usize = 0x0000;
const MACMDIOAR: usize = 0x0200;
const MACMDIODR: usize = 0x0204;
const MACA0HR: usize = 0x0300;
const MACA0LR: usize = 0x0304;
const DMAMR: usize = 0x1000;
const DMACTCR: usize = 0x1104;
const DMACRCR: usize = 0x1108;
const DMACTDLAR: usize = 0x1114;
const DMACRDLAR: usize = 0x111C;
const DMACTDTPR: usize = 0x1120;
const DMACRDTPR: usize = 0x1128;
const DMACTDRLR: usize = 0x112C;
const DMACRDRLR: usize = 0x1130;
const DMACIER: usize = 0x1134;
const DMACSR: usize = 0x1160;

const MACCR_RE: u32 = 1 << 0;
const MACCR_TE: u32 = 1 << 1;
const MACCR_DM: u32 = 1 << 13;
const MACCR_FES: u32 = 1 << 14;

const DMAMR_SWR: u32 = 1 << 0;
const DMACTCR_ST: u32 = 1 << 0;
const DMACRCR_SR: u32 = 1 << 0;

const DMACIER_TIE: u32 = 1 << 0;
const DMACIER_TBUE: u32 = 1 << 2;
const DMACIER_RIE: u32 = 1 << 6;
const DMACIER_AIE: u32 = 1 << 14;
const DMACIER_NIE: u32 = 1 << 15;

const MDIO_BUSY: u32 = 1 << 0;
const MDIO_READ: u32 = 0b11 << 2;
/// CSR clock range for a 60-100 MHz bus clock.
const MDIO_CLOCK_RANGE: u32 = 0;

/// Polls of a self-clearing bit before giving up.
const POLL_LIMIT: u32 = 100_000;

#[inline]
fn read_reg(offset: usize) -> u32 {
    // Safety: `offset` is one of the MAC register offsets above.
    unsafe { ptr::read_volatile((ETH_BASE + offset) as *const u32) }
}

#[inline]
fn write_reg(offset: usize, value: u32) {
    // Safety: as for `read_reg`.
    unsafe { ptr::write_volatile((ETH_BASE + offset) as *mut u32, value) }
}

fn wait_clear(offset: usize, mask: u32) -> bool {
    (0..POLL_LIMIT).any(|_| read_reg(offset) & mask == 0)
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

const DES3_OWN: u32 = 1 << 31;
const DES3_IOC: u32 = 1 << 30;
const DES3_FD: u32 = 1 << 29;
const DES3_LD: u32 = 1 << 28;
const DES3_BUF1V: u32 = 1 << 24;
const DES3_ES: u32 = 1 << 15;
const DES3_LEN_MASK: u32 = 0x7FFF;
const TDES2_IOC: u32 = 1 << 31;

const ETHERNET_HEADER_LEN: usize = 14;

#[repr(C, align(16))]
struct Descriptor([u32; 4]);

impl Descriptor {
    const EMPTY: Self = Self([0; 4]);

    #[inline]
    fn read(&self, word: usize) -> u32 {
        // Safety: plain read of our own memory that the DMA also writes.
        unsafe { ptr::read_volatile(&self.0[word]) }
    }

    #[inline]
    fn write(&mut self, word: usize, value: u32) {
        // Safety: as for `read`.
        unsafe { ptr::write_volatile(&mut self.0[word], value) }
    }

    fn addr(&self) -> u32 {
        self as *const Self as usize as u32
    }
}

type Buffer = [u8; PACKET_BUFFER_SIZE];

/// DMA-visible memory of the MAC. Must live in RAM the DMA can reach.
#[repr(C, align(32))]
pub struct DmaMemory {
    rx_desc: [Descriptor; ETH_DESCRIPTORS],
    tx_desc: [Descriptor; ETH_DESCRIPTORS],
    rx_buf: [Buffer; ETH_DESCRIPTORS],
    tx_buf: [Buffer; ETH_DESCRIPTORS],
    tx_scratch: Buffer,
}

impl DmaMemory {
    pub const fn new() -> Self {
        Self {
            rx_desc: [const { Descriptor::EMPTY }; ETH_DESCRIPTORS],
            tx_desc: [const { Descriptor::EMPTY }; ETH_DESCRIPTORS],
            rx_buf: [[0; PACKET_BUFFER_SIZE]; ETH_DESCRIPTORS],
            tx_buf: [[0; PACKET_BUFFER_SIZE]; ETH_DESCRIPTORS],
            tx_scratch: [0; PACKET_BUFFER_SIZE],
        }
    }
}

impl Default for DmaMemory {
    fn default() -> Self {
        Self::new()
    }
}

struct RxRing {
    desc: &'static mut [Descriptor; ETH_DESCRIPTORS],
    buf: &'static mut [Buffer; ETH_DESCRIPTORS],
    next: usize,
}

impl RxRing {
    fn arm(&mut self, i: usize) {
        let addr = self.buf[i].as_ptr() as usize as u32;
        let d = &mut self.desc[i];
        d.write(0, addr);
        d.write(1, 0);
        d.write(2, 0);
        fence(Ordering::Release);
        d.write(3, DES3_OWN | DES3_IOC | DES3_BUF1V);
    }

    /// Give the descriptor at `next` back to the DMA and advance.
    fn release(&mut self) {
        let i = self.next;
        self.arm(i);
        self.next = (i + 1) % ETH_DESCRIPTORS;
        write_reg(DMACRDTPR, self.desc[i].addr());
    }

    /// Status word of the next complete frame owned by the CPU, dropping
    /// errored and multi-buffer frames on the way.
    fn ready(&mut self) -> Option<u32> {
        loop {
            let des3 = self.desc[self.next].read(3);
            if des3 & DES3_OWN != 0 {
                return None;
            }
            fence(Ordering::Acquire);
            if des3 & DES3_ES == 0 && des3 & (DES3_FD | DES3_LD) == DES3_FD | DES3_LD {
                return Some(des3);
            }
            log::warn!("gmac: dropping bad frame (status {:#010x})", des3);
            self.release();
        }
    }
}

struct TxRing {
    desc: &'static mut [Descriptor; ETH_DESCRIPTORS],
    buf: &'static mut [Buffer; ETH_DESCRIPTORS],
    scratch: &'static mut Buffer,
    next: usize,
}

impl TxRing {
    fn is_free(&self) -> bool {
        self.desc[self.next].read(3) & DES3_OWN == 0
    }
}

// ---------------------------------------------------------------------------
// smoltcp device
// ---------------------------------------------------------------------------

/// The MAC as a `smoltcp` device.
pub struct Gmac {
    rx: RxRing,
    tx: TxRing,
}

impl Gmac {
    /// Reset the MAC, program `mac` and the rings, then start both DMA
    /// directions with interrupts on transmit complete, transmit buffer
    /// unavailable and receive.
    pub fn new(memory: &'static mut DmaMemory, mac: [u8; 6]) -> Self {
        let DmaMemory {
            rx_desc,
            tx_desc,
            rx_buf,
            tx_buf,
            tx_scratch,
        } = memory;
        let mut gmac = Self {
            rx: RxRing {
                desc: rx_desc,
                buf: rx_buf,
                next: 0,
            },
            tx: TxRing {
                desc: tx_desc,
                buf: tx_buf,
                scratch: tx_scratch,
                next: 0,
            },
        };

        write_reg(DMAMR, read_reg(DMAMR) | DMAMR_SWR);
        if !wait_clear(DMAMR, DMAMR_SWR) {
            log::warn!("gmac: DMA reset did not complete, is the PHY clock running?");
        }

        write_reg(MACA0HR, u32::from(mac[4]) | (u32::from(mac[5]) << 8));
        write_reg(MACA0LR, u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]));

        for i in 0..ETH_DESCRIPTORS {
            gmac.rx.arm(i);
            gmac.tx.desc[i] = Descriptor::EMPTY;
        }
        let last = ETH_DESCRIPTORS as u32 - 1;
        write_reg(DMACTDLAR, gmac.tx.desc[0].addr());
        write_reg(DMACRDLAR, gmac.rx.desc[0].addr());
        write_reg(DMACTDRLR, last);
        write_reg(DMACRDRLR, last);
        write_reg(DMACTDTPR, gmac.tx.desc[0].addr());
        write_reg(DMACRDTPR, gmac.rx.desc[ETH_DESCRIPTORS - 1].addr());

        write_reg(DMACIER, DMACIER_NIE | DMACIER_AIE | DMACIER_RIE | DMACIER_TBUE | DMACIER_TIE);
        write_reg(DMACRCR, ((PACKET_BUFFER_SIZE as u32) << 1) | DMACRCR_SR);
        write_reg(DMACTCR, DMACTCR_ST);
        write_reg(MACCR, read_reg(MACCR) | MACCR_RE | MACCR_TE | MACCR_DM | MACCR_FES);

        log::info!("gmac: up, {} descriptors per ring", ETH_DESCRIPTORS);
        gmac
    }
}

pub struct GmacRxToken<'a> {
    ring: &'a mut RxRing,
    status: u32,
}

pub struct GmacTxToken<'a> {
    ring: &'a mut TxRing,
}

impl phy::RxToken for GmacRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let len = ((self.status & DES3_LEN_MASK) as usize).min(PACKET_BUFFER_SIZE);
        let i = self.ring.next;
        let result = f(&mut self.ring.buf[i][..len]);
        self.ring.release();
        result
    }
}

impl phy::TxToken for GmacTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let len = len.min(PACKET_BUFFER_SIZE);
        let ring = self.ring;
        if !ring.is_free() {
            // Only reachable through the token paired with a receive.
            log::warn!("gmac: transmit ring full, dropping {}-byte frame", len);
            return f(&mut ring.scratch[..len]);
        }

        let i = ring.next;
        let result = f(&mut ring.buf[i][..len]);
        let addr = ring.buf[i].as_ptr() as usize as u32;
        let d = &mut ring.desc[i];
        d.write(0, addr);
        d.write(1, 0);
        d.write(2, len as u32 | TDES2_IOC);
        fence(Ordering::Release);
        d.write(3, DES3_OWN | DES3_FD | DES3_LD | len as u32);

        ring.next = (i + 1) % ETH_DESCRIPTORS;
        write_reg(DMACTDTPR, ring.desc[ring.next].addr());
        result
    }
}

impl Device for Gmac {
    type RxToken<'a>
        = GmacRxToken<'a>
    where
        Self: 'a;
    type TxToken<'a>
        = GmacTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let status = self.rx.ready()?;
        Some((
            GmacRxToken {
                ring: &mut self.rx,
                status,
            },
            GmacTxToken { ring: &mut self.tx },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        self.tx.is_free().then(|| GmacTxToken { ring: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = MTU + ETHERNET_HEADER_LEN;
        caps.max_burst_size = Some(ETH_DESCRIPTORS);
        caps
    }
}

// ---------------------------------------------------------------------------
// Interrupt status
// ---------------------------------------------------------------------------

/// DMA channel status register, write-one-to-clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct GmacDma;

impl EthInterruptRegs for GmacDma {
    fn pending(&self) -> EthStatus {
        EthStatus::from_bits_retain(read_reg(DMACSR))
    }

    fn clear(&self, flags: EthStatus) {
        write_reg(DMACSR, flags.bits());
    }
}

// ---------------------------------------------------------------------------
// PHY
// ---------------------------------------------------------------------------

/// Basic status register.
const PHY_BSR: u8 = 1;
const BSR_LINK_STATUS: u16 = 1 << 2;

/// PHY on the MDIO bus.
#[derive(Debug, Clone, Copy)]
pub struct GmacPhy {
    addr: u8,
}

impl GmacPhy {
    pub const fn new(addr: u8) -> Self {
        Self { addr }
    }

    /// Read PHY register `reg`. `None` if the MDIO bus stays busy.
    pub fn read(&self, reg: u8) -> Option<u16> {
        if !wait_clear(MACMDIOAR, MDIO_BUSY) {
            return None;
        }
        let cmd = (u32::from(self.addr) << 21)
            | (u32::from(reg) << 16)
            | MDIO_CLOCK_RANGE
            | MDIO_READ
            | MDIO_BUSY;
        write_reg(MACMDIOAR, cmd);
        if !wait_clear(MACMDIOAR, MDIO_BUSY) {
            return None;
        }
        Some(read_reg(MACMDIODR) as u16)
    }
}

impl LinkStatus for GmacPhy {
    fn link_up(&self) -> bool {
        // Link status latches low; the first read returns the latched value.
        let _ = self.read(PHY_BSR);
        self.read(PHY_BSR).is_some_and(|bsr| bsr & BSR_LINK_STATUS != 0)
    }
}
