//! # Shared Memory
//!
//! Word-addressed memory visible to both the host and the coprocessor.
//!
//! The coprocessor addresses shared memory with 24-bit physical byte
//! addresses, so every command payload that carries an address stores it in
//! the low 24 bits of a word. [`SharedMemory`] owns an arena placed somewhere
//! below 16 MiB and is the single place where a [`PhysAddr`] is translated
//! into host-accessible storage.
//!
//! ```text
//! base                                                            base + 4*words
//! ┌──────────┬──────────────┬─────────┬──────────────┬───────────────────┐
//! │ buffer 0 │   buffer 1   │  free   │ block chunk  │       free        │
//! └──────────┴──────────────┴─────────┴──────────────┴───────────────────┘
//!   Region     Region                   Region
//! ```
//!
//! Every word is an `AtomicU32`: the host publishes with release stores, the
//! coprocessor observes with acquire loads.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{HalError, HalResult};

/// Mask of the address bits the coprocessor understands
pub const ADDR_MASK: u32 = 0x00FF_FFFF;

/// Allocation granularity in words (8 bytes, the DMA alignment)
pub const ALLOC_ALIGN_WORDS: u32 = 2;

// =============================================================================
// PHYSICAL ADDRESS
// =============================================================================

/// Byte address in the coprocessor's shared memory space
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Extract an address from the payload of a command word
    #[inline]
    pub const fn from_payload(word: u32) -> Self {
        Self(word & ADDR_MASK)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Address advanced by `words` 32-bit words
    #[inline]
    pub const fn add_words(self, words: u32) -> Self {
        Self(self.0 + words * 4)
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Check whether the address fits a 24-bit command payload
    #[inline]
    pub const fn fits_payload(self) -> bool {
        self.0 & !ADDR_MASK == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:06x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x}", self.0)
    }
}

// =============================================================================
// REGION
// =============================================================================

/// A contiguous run of words in shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: PhysAddr,
    words: u32,
}

impl Region {
    /// Describe `words` words starting at `base`
    pub const fn new(base: PhysAddr, words: u32) -> Self {
        Self { base, words }
    }

    /// First byte address
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        self.base
    }

    /// Length in words
    #[inline]
    pub const fn len(&self) -> u32 {
        self.words
    }

    /// Whether the region is empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// Length in bytes
    #[inline]
    pub const fn byte_len(&self) -> u32 {
        self.words * 4
    }

    /// Address of word `index`
    #[inline]
    pub fn word_addr(&self, index: u32) -> PhysAddr {
        assert!(index < self.words, "word {} outside region of {} words", index, self.words);
        self.base.add_words(index)
    }
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// First-fit free list over word offsets
#[derive(Debug, Default)]
struct Heap {
    /// Free runs: offset -> length
    free: BTreeMap<u32, u32>,
    /// Live allocations: offset -> length
    live: BTreeMap<u32, u32>,
}

impl Heap {
    fn new(words: u32) -> Self {
        let mut heap = Self::default();
        if words > 0 {
            heap.free.insert(0, words);
        }
        heap
    }

    fn alloc(&mut self, words: u32) -> Option<u32> {
        let words = words.div_ceil(ALLOC_ALIGN_WORDS) * ALLOC_ALIGN_WORDS;
        let (&off, &len) = self.free.iter().find(|&(_, &len)| len >= words)?;
        self.free.remove(&off);
        if len > words {
            self.free.insert(off + words, len - words);
        }
        self.live.insert(off, words);
        Some(off)
    }

    fn free(&mut self, off: u32) -> Option<u32> {
        let len = self.live.remove(&off)?;
        let mut start = off;
        let mut end = off + len;

        let prev = self.free.range(..off).next_back().map(|(&k, &v)| (k, v));
        if let Some((prev, prev_len)) = prev {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }
        self.free.insert(start, end - start);
        Some(len)
    }

    fn free_words(&self) -> u32 {
        self.free.values().sum()
    }
}

// =============================================================================
// SHARED MEMORY
// =============================================================================

/// Shared memory arena with a word allocator
pub struct SharedMemory {
    base: PhysAddr,
    words: Box<[AtomicU32]>,
    heap: Mutex<Heap>,
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("base", &self.base)
            .field("words", &self.words.len())
            .field("free_words", &self.free_words())
            .finish()
    }
}

impl SharedMemory {
    /// Create an arena of `words` zeroed words at physical address `base`
    pub fn new(base: PhysAddr, words: u32) -> HalResult<Self> {
        if !base.is_aligned(ALLOC_ALIGN_WORDS * 4) {
            return Err(HalError::MisalignedAddress(base));
        }
        let end = (base.raw() as u64) + (words as u64) * 4;
        if end > (ADDR_MASK as u64) + 1 {
            return Err(HalError::ArenaTooLarge);
        }

        let words: Vec<AtomicU32> = (0..words).map(|_| AtomicU32::new(0)).collect();
        let count = words.len() as u32;
        log::debug!("hal: shared memory {} words at {}", count, base);
        Ok(Self {
            base,
            words: words.into_boxed_slice(),
            heap: Mutex::new(Heap::new(count)),
        })
    }

    /// Base address of the arena
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Arena size in words
    pub fn len(&self) -> u32 {
        self.words.len() as u32
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Words currently available for allocation
    pub fn free_words(&self) -> u32 {
        self.heap.lock().free_words()
    }

    /// Whether `addr` is a word inside the arena
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.index(addr).is_some()
    }

    fn index(&self, addr: PhysAddr) -> Option<usize> {
        let off = addr.raw().checked_sub(self.base.raw())?;
        let idx = (off / 4) as usize;
        (off % 4 == 0 && idx < self.words.len()).then_some(idx)
    }

    /// Allocate `words` zeroed words aligned for DMA
    pub fn alloc(&self, words: u32) -> HalResult<Region> {
        let off = self
            .heap
            .lock()
            .alloc(words.max(1))
            .ok_or(HalError::OutOfMemory { words })?;
        let region = Region::new(self.base.add_words(off), words);
        self.zero(region);

        #[cfg(feature = "debug")]
        log::trace!("hal: alloc {} words at {}", words, region.addr());

        Ok(region)
    }

    /// Allocate a region and copy `data` into it
    pub fn upload(&self, data: &[u32]) -> HalResult<Region> {
        let region = self.alloc(data.len() as u32)?;
        self.copy_in(region.addr(), data);
        Ok(region)
    }

    /// Release an allocation by its base address, returning its size in words
    pub fn free(&self, addr: PhysAddr) -> HalResult<u32> {
        let off = addr
            .raw()
            .checked_sub(self.base.raw())
            .ok_or(HalError::InvalidAddress(addr))?;
        self.heap
            .lock()
            .free(off / 4)
            .ok_or(HalError::NotAllocated(addr))
    }

    /// Translate an address into its backing word.
    ///
    /// Panics if the address is outside the arena or misaligned: a bad
    /// translation means some queue structure is corrupted.
    pub fn word(&self, addr: PhysAddr) -> &AtomicU32 {
        match self.try_word(addr) {
            Ok(word) => word,
            Err(err) => panic!("shared memory access failed: {}", err),
        }
    }

    /// Fallible translation of an address into its backing word
    pub fn try_word(&self, addr: PhysAddr) -> HalResult<&AtomicU32> {
        if !addr.is_aligned(4) {
            return Err(HalError::MisalignedAddress(addr));
        }
        self.index(addr)
            .map(|idx| &self.words[idx])
            .ok_or(HalError::InvalidAddress(addr))
    }

    /// Read a word with acquire ordering
    #[inline]
    pub fn read(&self, addr: PhysAddr) -> u32 {
        self.word(addr).load(Ordering::Acquire)
    }

    /// Write a word with release ordering
    #[inline]
    pub fn write(&self, addr: PhysAddr, value: u32) {
        self.word(addr).store(value, Ordering::Release);
    }

    /// Zero every word of a region
    pub fn zero(&self, region: Region) {
        for i in 0..region.len() {
            self.word(region.addr().add_words(i)).store(0, Ordering::Relaxed);
        }
    }

    /// Copy words into shared memory starting at `addr`
    pub fn copy_in(&self, addr: PhysAddr, src: &[u32]) {
        for (i, &value) in src.iter().enumerate() {
            self.word(addr.add_words(i as u32)).store(value, Ordering::Relaxed);
        }
        core::sync::atomic::fence(Ordering::Release);
    }

    /// Copy words out of shared memory starting at `addr`
    pub fn copy_out(&self, addr: PhysAddr, dst: &mut [u32]) {
        core::sync::atomic::fence(Ordering::Acquire);
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.word(addr.add_words(i as u32)).load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> SharedMemory {
        SharedMemory::new(PhysAddr::new(0x10_0000), 256).unwrap()
    }

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let mem = arena();
        let a = mem.alloc(3).unwrap();
        mem.write(a.word_addr(2), 0xDEAD_BEEF);
        mem.free(a.addr()).unwrap();

        let b = mem.alloc(3).unwrap();
        assert_eq!(b.addr(), a.addr());
        assert_eq!(mem.read(b.word_addr(2)), 0);
        assert!(b.addr().is_aligned(8));
        assert!(mem.alloc(1).unwrap().addr().is_aligned(8));
    }

    #[test]
    fn test_free_coalesces() {
        let mem = arena();
        let a = mem.alloc(64).unwrap();
        let b = mem.alloc(64).unwrap();
        let c = mem.alloc(64).unwrap();
        mem.free(b.addr()).unwrap();
        mem.free(a.addr()).unwrap();
        mem.free(c.addr()).unwrap();
        assert_eq!(mem.free_words(), 256);
        assert_eq!(mem.alloc(256).unwrap().addr(), mem.base());
    }

    #[test]
    fn test_out_of_memory() {
        let mem = arena();
        let _a = mem.alloc(200).unwrap();
        assert_eq!(mem.alloc(100), Err(HalError::OutOfMemory { words: 100 }));
    }

    #[test]
    fn test_double_free_rejected() {
        let mem = arena();
        let a = mem.alloc(8).unwrap();
        assert_eq!(mem.free(a.addr()), Ok(8));
        assert_eq!(mem.free(a.addr()), Err(HalError::NotAllocated(a.addr())));
    }

    #[test]
    fn test_arena_must_fit_payload() {
        assert_eq!(
            SharedMemory::new(PhysAddr::new(0x00FF_0000), 0x1_0000).unwrap_err(),
            HalError::ArenaTooLarge
        );
        assert!(SharedMemory::new(PhysAddr::new(0x00FF_0000), 0x4000).is_ok());
    }

    #[test]
    fn test_upload_and_copy_out() {
        let mem = arena();
        let region = mem.upload(&[1, 2, 3, 4]).unwrap();
        let mut out = [0u32; 4];
        mem.copy_out(region.addr(), &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "shared memory access failed")]
    fn test_translation_outside_arena_panics() {
        let mem = arena();
        let _ = mem.read(PhysAddr::new(0x20_0000));
    }
}
