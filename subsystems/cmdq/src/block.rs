//! # Blocks
//!
//! A block is a recorded command sequence that can be replayed any number of
//! times with a single `CALL`. While recording, the queue writes into a chain
//! of chunks instead of the ring buffers:
//!
//! ```text
//!  chunk 0 (min)           chunk 1 (2 x min)               chunk 2 (capped)
//! ┌────────────────┬──────┐ ┌──────────────────────┬──────┐ ┌─────────┬─────┬──────┐
//! │ commands ...   │ JUMP ├►│ commands ...         │ JUMP ├►│ ...     │ RET │ IDLE │
//! └────────────────┴──────┘ └──────────────────────┴──────┘ └─────────┴─────┴──────┘
//! ```
//!
//! The final `RET` carries the block's nesting level: a block that runs
//! other blocks returns through a call slot above every slot its callees use.

use helix_hal::{Coprocessor, PhysAddr, Region};

use crate::config::MAX_BLOCK_NESTING_LEVEL;
use crate::context::publish;
use crate::opcode::{addr_payload, opcode_of, slot, Opcode};
use crate::queue::CommandQueue;

/// A recorded, replayable command sequence
///
/// Must be released with [`CommandQueue::block_free`].
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    first: Region,
    nesting_level: u32,
}

impl Block {
    /// Address the block is called at
    pub fn addr(&self) -> PhysAddr {
        self.first.addr()
    }

    /// Call slot the block returns through
    pub fn nesting_level(&self) -> u32 {
        self.nesting_level
    }
}

/// State of the block being recorded
#[derive(Debug, Clone)]
pub(crate) struct BlockRecording {
    first: Region,
    chunk_words: u32,
    nesting_level: u32,
}

impl<C: Coprocessor> CommandQueue<C> {
    /// Start recording a block.
    ///
    /// Commands written until [`block_end`](Self::block_end) go into the
    /// block instead of the queue.
    pub fn block_begin(&mut self) {
        assert!(self.block.is_none(), "a block is already being recorded");
        assert!(!self.is_highpri, "cannot record a block in high-priority mode");

        let words = self.config.block_min_words;
        let first = self.alloc_chunk(words);
        self.lowpri = self.current.clone();
        self.current
            .switch_to(&self.mem, first, self.config.max_command_words);
        self.block = Some(BlockRecording {
            first,
            chunk_words: words,
            nesting_level: 0,
        });
        self.stats.block_chunks += 1;
        log::debug!("cmdq: recording block at {}", first.addr());
    }

    /// Finish recording and return the block
    pub fn block_end(&mut self) -> Block {
        let level = match &self.block {
            Some(rec) => rec.nesting_level,
            None => panic!("no block is being recorded"),
        };
        self.emit(&[Opcode::Ret.word(slot(level))]);

        let Some(rec) = self.block.take() else {
            unreachable!("recording ended while emitting its return")
        };
        self.current = self.lowpri.clone();
        self.stats.blocks_recorded += 1;
        log::debug!(
            "cmdq: recorded block at {} (nesting level {})",
            rec.first.addr(),
            rec.nesting_level
        );

        Block {
            first: rec.first,
            nesting_level: rec.nesting_level,
        }
    }

    /// Enqueue a call to a recorded block.
    ///
    /// When recording, the enclosing block's nesting level is raised above
    /// the callee's.
    pub fn block_run(&mut self, block: &Block) {
        self.emit(&[
            Opcode::Call.word(addr_payload(block.addr())),
            slot(block.nesting_level),
        ]);

        if let Some(rec) = self.block.as_mut() {
            if rec.nesting_level <= block.nesting_level {
                rec.nesting_level = block.nesting_level + 1;
                assert!(
                    rec.nesting_level < MAX_BLOCK_NESTING_LEVEL,
                    "reached the maximum number of nested block runs ({})",
                    MAX_BLOCK_NESTING_LEVEL
                );
            }
        }
    }

    /// Release a block and all of its chunks
    pub fn block_free(&mut self, block: Block) {
        let mut words = self.config.block_min_words;
        let mut chunk = block.first;

        loop {
            let last = self.chunk_terminator(chunk);
            if let Err(err) = self.mem.free(chunk.addr()) {
                panic!("corrupted block at {}: {}", chunk.addr(), err);
            }
            match Opcode::from_word(last) {
                Some(Opcode::Jump) => {
                    words = self.config.next_chunk_words(words);
                    chunk = Region::new(PhysAddr::from_payload(last), words);
                },
                Some(Opcode::Ret) => break,
                _ => panic!("corrupted block at {}: invalid terminator {:#010x}", chunk.addr(), last),
            }
        }
        log::debug!("cmdq: freed block at {}", block.addr());
    }

    /// Last command of a chunk: the final non-zero word before the terminator
    fn chunk_terminator(&self, chunk: Region) -> u32 {
        let mut idx = chunk.len();
        let mut word = 0;
        while word == 0 {
            assert!(idx > 0, "corrupted block at {}: empty chunk", chunk.addr());
            idx -= 1;
            word = self.mem.read(chunk.word_addr(idx));
        }
        if opcode_of(word) == Opcode::Idle as u8 {
            assert!(idx > 0, "corrupted block at {}: bare terminator", chunk.addr());
            word = self.mem.read(chunk.word_addr(idx - 1));
        }
        word
    }

    /// Continue the block being recorded in a larger chunk
    pub(crate) fn next_block_chunk(&mut self) {
        let words = match self.block.as_mut() {
            Some(rec) => {
                rec.chunk_words = self.config.next_chunk_words(rec.chunk_words);
                rec.chunk_words
            },
            None => unreachable!("block chunk requested outside a recording"),
        };
        let chunk = self.alloc_chunk(words);
        let (prev, prev_cur) =
            self.current
                .switch_to(&self.mem, chunk, self.config.max_command_words);
        publish(
            &self.mem,
            prev,
            prev_cur,
            &[Opcode::Jump.word(addr_payload(chunk.addr()))],
        );
        self.stats.block_chunks += 1;
    }

    fn alloc_chunk(&self, words: u32) -> Region {
        match self.mem.alloc(words) {
            Ok(region) => region,
            Err(err) => panic!("cannot allocate a {}-word block chunk: {}", words, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::sim::{self, Tally};

    #[test]
    fn test_block_replay_matches_inline() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        h.queue.block_begin();
        for value in 0..5 {
            h.queue.write(1, Tally::PUSH, &[value]);
        }
        let block = h.queue.block_end();
        assert_eq!(block.nesting_level(), 0);

        h.queue.block_run(&block);
        h.queue.block_run(&block);
        for value in 0..5 {
            h.queue.write(1, Tally::PUSH, &[value]);
        }
        h.queue.wait_idle();

        let values = tally.values(&h.mem);
        let expected: Vec<u32> = (0..5).chain(0..5).chain(0..5).collect();
        assert_eq!(values, expected);
        h.queue.block_free(block);
    }

    #[test]
    fn test_large_block_spans_chunks_and_frees_them() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);
        let free_before = h.mem.free_words();

        h.queue.block_begin();
        for value in 0..600 {
            h.queue.write(1, Tally::PUSH, &[value]);
        }
        let block = h.queue.block_end();
        assert!(h.queue.stats().block_chunks >= 4);

        h.queue.block_run(&block);
        h.queue.wait_idle();
        assert!(tally.values(&h.mem).into_iter().eq(0..600));

        h.queue.block_free(block);
        assert_eq!(h.mem.free_words(), free_before);
    }

    #[test]
    fn test_nesting_levels_increase_toward_caller() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        h.queue.block_begin();
        h.queue.write(1, Tally::PUSH, &[3]);
        let c = h.queue.block_end();

        h.queue.block_begin();
        h.queue.write(1, Tally::PUSH, &[2]);
        h.queue.block_run(&c);
        let b = h.queue.block_end();

        h.queue.block_begin();
        h.queue.write(1, Tally::PUSH, &[1]);
        h.queue.block_run(&b);
        h.queue.block_run(&c);
        let a = h.queue.block_end();

        assert_eq!(c.nesting_level(), 0);
        assert_eq!(b.nesting_level(), 1);
        assert_eq!(a.nesting_level(), 2);

        h.queue.block_run(&a);
        h.queue.wait_idle();
        assert_eq!(tally.values(&h.mem), [1, 2, 3, 3]);

        for block in [a, b, c] {
            h.queue.block_free(block);
        }
    }

    #[test]
    #[should_panic(expected = "maximum number of nested block runs")]
    fn test_nesting_bound() {
        let mut h = sim::harness(sim::test_config());
        h.queue.block_begin();
        h.queue.noop();
        let mut inner = h.queue.block_end();
        for _ in 0..MAX_BLOCK_NESTING_LEVEL {
            h.queue.block_begin();
            h.queue.block_run(&inner);
            inner = h.queue.block_end();
        }
    }

    #[test]
    fn test_flush_ignored_while_recording() {
        let mut h = sim::harness(sim::test_config());
        h.queue.wait_idle();
        let executed = h.sim.executed();
        h.queue.block_begin();
        h.queue.noop();
        h.queue.flush();
        let block = h.queue.block_end();
        assert_eq!(h.sim.executed(), executed);
        h.queue.block_free(block);
    }

    #[test]
    #[should_panic(expected = "already being recorded")]
    fn test_begin_twice_panics() {
        let mut h = sim::harness(sim::test_config());
        h.queue.block_begin();
        h.queue.block_begin();
    }

    #[test]
    #[should_panic(expected = "no block is being recorded")]
    fn test_end_without_begin_panics() {
        let mut h = sim::harness(sim::test_config());
        let _ = h.queue.block_end();
    }

    #[test]
    #[should_panic(expected = "corrupted block")]
    fn test_corrupted_block_detected() {
        let mut h = sim::harness(sim::test_config());
        h.queue.block_begin();
        h.queue.noop();
        let block = h.queue.block_end();
        // Overwrite the RET with a NOOP.
        h.mem.write(block.addr().add_words(1), Opcode::Noop.word(0));
        h.queue.block_free(block);
    }
}
