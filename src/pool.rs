//! # Packet Buffer Pool
//!
//! Fixed set of equally sized buffers handed out as move-only
//! [`PacketBuffer`] values. A buffer goes back to the pool when it is
//! dropped, so every allocation is released exactly once on every path, and
//! no code can touch a buffer after it was returned.
//!
//! The free list is a bitmap in one atomic word: allocation and release are
//! lock-free and safe from both task and interrupt context.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::PoolError;

/// Pool of `SLOTS` buffers of `SIZE` bytes each. `SLOTS` is at most 32.
pub struct PacketPool<const SLOTS: usize, const SIZE: usize> {
    slots: [UnsafeCell<[u8; SIZE]>; SLOTS],
    /// Bit `i` set means slot `i` is free.
    free: AtomicU32,
}

// A slot is reachable only through the `PacketBuffer` that claimed its bit.
unsafe impl<const SLOTS: usize, const SIZE: usize> Sync for PacketPool<SLOTS, SIZE> {}

impl<const SLOTS: usize, const SIZE: usize> PacketPool<SLOTS, SIZE> {
    const ALL_FREE: u32 = {
        assert!(SLOTS > 0 && SLOTS <= 32, "pool supports 1..=32 slots");
        if SLOTS == 32 {
            u32::MAX
        } else {
            (1u32 << SLOTS) - 1
        }
    };

    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new([0u8; SIZE]) }; SLOTS],
            free: AtomicU32::new(Self::ALL_FREE),
        }
    }

    /// Bytes one buffer can hold.
    #[inline]
    pub const fn buffer_size(&self) -> usize {
        SIZE
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        SLOTS - self.free.load(Ordering::Acquire).count_ones() as usize
    }

    /// Claim a buffer holding `len` zeroed bytes.
    pub fn alloc(&self, len: usize) -> Result<PacketBuffer<'_>, PoolError> {
        if len > SIZE {
            return Err(PoolError::TooLarge {
                requested: len,
                capacity: SIZE,
            });
        }

        let mut free = self.free.load(Ordering::Acquire);
        let index = loop {
            if free == 0 {
                return Err(PoolError::Exhausted);
            }
            let index = free.trailing_zeros();
            let claimed = free & !(1 << index);
            match self
                .free
                .compare_exchange_weak(free, claimed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break index as usize,
                Err(current) => free = current,
            }
        };

        // SAFETY: bit `index` was cleared by us, so no other buffer aliases
        // this slot until our `PacketBuffer` drops and sets it again.
        let data = unsafe { &mut *self.slots[index].get() };
        data[..len].fill(0);
        Ok(PacketBuffer {
            data,
            len,
            slot: index as u8,
            free: &self.free,
        })
    }
}

impl<const SLOTS: usize, const SIZE: usize> Default for PacketPool<SLOTS, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusively owned pool buffer. Not `Clone`; returned to its pool on drop.
pub struct PacketBuffer<'p> {
    data: &'p mut [u8],
    len: usize,
    slot: u8,
    free: &'p AtomicU32,
}

impl PacketBuffer<'_> {
    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes the underlying slot can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Change the payload length, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Copy `bytes` in as the whole payload. Returns the bytes kept.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }
}

impl Deref for PacketBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PacketBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl fmt::Debug for PacketBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for PacketBuffer<'_> {
    fn drop(&mut self) {
        let bit = 1u32 << self.slot;
        let prev = self.free.fetch_or(bit, Ordering::AcqRel);
        debug_assert_eq!(prev & bit, 0, "packet buffer slot {} freed twice", self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    type TestPool = PacketPool<4, 64>;

    #[test]
    fn test_alloc_and_release() {
        let pool = TestPool::new();
        assert_eq!(pool.in_use(), 0);

        let buf = pool.alloc(10).unwrap();
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.capacity(), 64);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(pool.in_use(), 1);

        drop(buf);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_exhaustion_is_transient() {
        let pool = TestPool::new();
        let held: Vec<_> = (0..4).map(|_| pool.alloc(8).unwrap()).collect();
        assert_eq!(pool.alloc(8).unwrap_err(), PoolError::Exhausted);

        drop(held);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.alloc(8).is_ok());
    }

    #[test]
    fn test_too_large() {
        let pool = TestPool::new();
        assert_eq!(
            pool.alloc(65).unwrap_err(),
            PoolError::TooLarge {
                requested: 65,
                capacity: 64
            }
        );
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_reused_slot_is_zeroed() {
        let pool = PacketPool::<1, 16>::new();
        let mut buf = pool.alloc(4).unwrap();
        buf.copy_from_slice(&[9, 9, 9, 9]);
        drop(buf);

        let buf = pool.alloc(4).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_fill_from_sets_len() {
        let pool = TestPool::new();
        let mut buf = pool.alloc(0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.fill_from(&[1, 2, 3]), 3);
        assert_eq!(&buf[..], &[1, 2, 3]);
        buf.set_len(1000);
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_concurrent_alloc_never_aliases() {
        let pool = TestPool::new();
        std::thread::scope(|s| {
            for t in 0..4u8 {
                let pool = &pool;
                s.spawn(move || {
                    for _ in 0..500 {
                        if let Ok(mut buf) = pool.alloc(1) {
                            buf[0] = t;
                            std::thread::yield_now();
                            assert_eq!(buf[0], t);
                        }
                    }
                });
            }
        });
        assert_eq!(pool.in_use(), 0);
    }
}
