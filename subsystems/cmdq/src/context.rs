//! # Queue Context
//!
//! Write state of one lane: the buffer currently being filled, the cursor
//! and the sentinel past which a maximum-size command no longer fits.
//!
//! ```text
//!  active region
//! ┌──────────────────────────────┬──────┬─────────────┬────────────────┐
//! │ committed commands           │ IDLE │ 0 0 0 0 ... │ (max command)  │
//! └──────────────────────────────┴──────┴─────────────┴────────────────┘
//!                                 ▲ cur                ▲ sentinel
//! ```
//!
//! The word at the cursor is always the IDLE terminator, and every word past
//! it is zero.

use core::sync::atomic::Ordering;

use helix_hal::{barrier, HalResult, PhysAddr, Region, SharedMemory, Signal};

use crate::opcode::TERMINATOR;

/// Write `words` at index `at` of `region`, followed by a terminator.
///
/// The first word replaces the previous terminator and is stored last, with
/// release ordering, so the coprocessor can never observe a partial command.
/// Returns the index of the new terminator.
pub(crate) fn publish(mem: &SharedMemory, region: Region, at: u32, words: &[u32]) -> u32 {
    let Some((&head, tail)) = words.split_first() else {
        return at;
    };
    let end = at + words.len() as u32;

    for (i, &word) in tail.iter().enumerate() {
        mem.word(region.word_addr(at + 1 + i as u32)).store(word, Ordering::Relaxed);
    }
    mem.word(region.word_addr(end)).store(TERMINATOR, Ordering::Relaxed);
    barrier::write();
    mem.word(region.word_addr(at)).store(head, Ordering::Release);

    #[cfg(feature = "trace-commands")]
    log::trace!("cmdq: {} <- {:08x?}", region.word_addr(at), words);

    end
}

/// Write state of one lane
#[derive(Debug, Clone)]
pub(crate) struct QueueContext {
    /// The two ping-pong ring buffers of the lane
    pub(crate) buffers: [Region; 2],
    /// Index of the ring buffer being filled
    pub(crate) buf_idx: usize,
    /// Region the cursor points into (a ring buffer or a block chunk)
    pub(crate) active: Region,
    /// Word index of the terminator
    pub(crate) cur: u32,
    /// Last cursor position at which a maximum-size command still fits
    pub(crate) sentinel: u32,
    /// Signal raised by the engine when it leaves a buffer
    pub(crate) bufdone: Signal,
}

impl QueueContext {
    /// Allocate both ring buffers of a lane
    pub(crate) fn new(
        mem: &SharedMemory,
        words: u32,
        bufdone: Signal,
        max_command_words: u32,
    ) -> HalResult<Self> {
        let first = mem.alloc(words)?;
        let second = match mem.alloc(words) {
            Ok(region) => region,
            Err(err) => {
                mem.free(first.addr())?;
                return Err(err);
            },
        };
        for buffer in [first, second] {
            mem.write(buffer.addr(), TERMINATOR);
        }

        Ok(Self {
            buffers: [first, second],
            buf_idx: 0,
            active: first,
            cur: 0,
            sentinel: words - max_command_words,
            bufdone,
        })
    }

    /// Shared memory address of the cursor
    pub(crate) fn cursor_addr(&self) -> PhysAddr {
        self.active.word_addr(self.cur)
    }

    /// Whether a command of `words` words fits before the sentinel
    pub(crate) fn fits(&self, words: u32) -> bool {
        self.cur + words <= self.sentinel
    }

    /// Append a command at the cursor
    pub(crate) fn append(&mut self, mem: &SharedMemory, words: &[u32]) {
        self.cur = publish(mem, self.active, self.cur, words);
    }

    /// Move the cursor to the start of `region`.
    ///
    /// Returns the previous region and cursor so the caller can link them
    /// to the new region.
    pub(crate) fn switch_to(
        &mut self,
        mem: &SharedMemory,
        region: Region,
        max_command_words: u32,
    ) -> (Region, u32) {
        mem.write(region.addr(), TERMINATOR);
        let prev = (self.active, self.cur);
        self.active = region;
        self.cur = 0;
        self.sentinel = region.len() - max_command_words;
        prev
    }

    /// Release both ring buffers
    pub(crate) fn free(&self, mem: &SharedMemory) -> HalResult<()> {
        for buffer in self.buffers {
            mem.free(buffer.addr())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use helix_hal::Signal;

    use super::*;
    use crate::opcode::Opcode;

    fn arena() -> SharedMemory {
        SharedMemory::new(PhysAddr::new(0x10_0000), 1024).unwrap()
    }

    #[test]
    fn test_new_places_terminators() {
        let mem = arena();
        let ctx = QueueContext::new(&mem, 64, Signal::new(5), 16).unwrap();
        assert_eq!(mem.read(ctx.buffers[0].addr()), TERMINATOR);
        assert_eq!(mem.read(ctx.buffers[1].addr()), TERMINATOR);
        assert_eq!(ctx.sentinel, 48);
        assert_eq!(ctx.cursor_addr(), ctx.buffers[0].addr());
    }

    #[test]
    fn test_append_keeps_terminator_at_cursor() {
        let mem = arena();
        let mut ctx = QueueContext::new(&mem, 64, Signal::new(5), 16).unwrap();
        ctx.append(&mem, &[Opcode::Noop.word(0)]);
        ctx.append(&mem, &[0x4000_0001, 0xAAAA_AAAA, 0xBBBB_BBBB]);
        assert_eq!(ctx.cur, 4);

        let mut words = [0u32; 6];
        mem.copy_out(ctx.active.addr(), &mut words);
        assert_eq!(words, [0x0700_0000, 0x4000_0001, 0xAAAA_AAAA, 0xBBBB_BBBB, TERMINATOR, 0]);
    }

    #[test]
    fn test_fits_respects_sentinel() {
        let mem = arena();
        let mut ctx = QueueContext::new(&mem, 64, Signal::new(5), 16).unwrap();
        ctx.cur = 40;
        assert!(ctx.fits(8));
        assert!(!ctx.fits(9));
    }

    #[test]
    fn test_switch_to_returns_previous() {
        let mem = arena();
        let mut ctx = QueueContext::new(&mem, 64, Signal::new(5), 16).unwrap();
        ctx.append(&mem, &[Opcode::Noop.word(0)]);
        let chunk = mem.alloc(128).unwrap();
        let (prev, prev_cur) = ctx.switch_to(&mem, chunk, 16);
        assert_eq!(prev, ctx.buffers[0]);
        assert_eq!(prev_cur, 1);
        assert_eq!(ctx.sentinel, 112);
        assert_eq!(mem.read(chunk.addr()), TERMINATOR);
    }

    #[test]
    fn test_new_releases_on_failure() {
        let mem = SharedMemory::new(PhysAddr::new(0x10_0000), 100).unwrap();
        assert!(QueueContext::new(&mem, 64, Signal::new(5), 16).is_err());
        assert_eq!(mem.free_words(), 100);
    }
}
