//! Board LEDs on GPIO. Clocking and pin mode setup happen in the board
//! bring-up code before `main`.

use core::ptr;

use crate::eth::DigitalOutput;

/// Output data register.
const ODR: usize = 0x14;
/// Bit set/reset register: writing bit `n` sets pin `n`, bit `n + 16`
/// resets it.
const BSRR: usize = 0x18;

/// Push-pull LED on one GPIO pin.
#[derive(Debug, Clone, Copy)]
pub struct GpioLed {
    port: usize,
    pin: u8,
}

impl GpioLed {
    pub const fn new(port: usize, pin: u8) -> Self {
        Self { port, pin }
    }

    fn write_bsrr(&self, value: u32) {
        // Safety: BSRR writes are atomic in hardware and only affect the
        // pins whose bits are set.
        unsafe { ptr::write_volatile((self.port + BSRR) as *mut u32, value) }
    }
}

impl DigitalOutput for GpioLed {
    fn set(&self, on: bool) {
        let bit = if on { self.pin } else { self.pin + 16 };
        self.write_bsrr(1 << bit);
    }

    fn toggle(&self) {
        // Safety: read of the output latch.
        let odr = unsafe { ptr::read_volatile((self.port + ODR) as *const u32) };
        self.set(odr & (1 << self.pin) == 0);
    }
}
