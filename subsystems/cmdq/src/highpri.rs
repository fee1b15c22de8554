//! # High-Priority Lane
//!
//! Commands written between [`highpri_begin`](CommandQueue::highpri_begin)
//! and [`highpri_end`](CommandQueue::highpri_end) go to a second pair of
//! ring buffers. The engine checks `SIG_HIGHPRI` at every command boundary
//! of the low-priority lane and switches over as soon as it is raised.
//!
//! Every session leaves an epilog that hands control back:
//!
//! ```text
//!  end        end+1  end+2                 end+3          end+4    end+5    end+6
//! ┌──────────┬──────┬─────────────────────┬──────────────┬────────┬────────┬──────┐
//! │ JUMP e+2 │ IDLE │ SET_STATUS ~RUNNING │ SWAP_BUFFERS │ LOWPRI │ CHECK  │ IDLE │
//! └──────────┴──────┴─────────────────────┴──────────────┴────────┴────────┴──────┘
//!                                                                  cursor ▲
//! ```
//!
//! If the next session starts before the engine ran the epilog, the five
//! words ahead of the cursor are blanked (zero, then NOOP, left to right)
//! so the engine keeps executing the new session without leaving the lane.

use core::sync::atomic::Ordering;

use helix_hal::{barrier, Coprocessor};

use crate::config::{HIGHPRI_CALL_SLOT, LOWPRI_CALL_SLOT};
use crate::context::publish;
use crate::layout::signals;
use crate::opcode::{addr_payload, opcode_of, slot, Opcode};
use crate::queue::CommandQueue;

/// Words of the previous epilog cleared when sessions merge
const EPILOG_MERGE_WORDS: u32 = 5;

/// Words from the session end to the cursor left after the epilog
const EPILOG_WORDS: u32 = 6;

impl<C: Coprocessor> CommandQueue<C> {
    /// Switch producers to the high-priority lane and ask the engine to
    /// preempt the low-priority one.
    pub fn highpri_begin(&mut self) {
        assert!(!self.is_highpri, "already in high-priority mode");
        assert!(
            self.block.is_none(),
            "cannot switch to high-priority mode while recording a block"
        );

        self.lowpri = core::mem::replace(&mut self.current, self.highpri.clone());
        self.is_highpri = true;
        self.merge_previous_epilog();

        self.emit(&[Opcode::SetStatus.word(
            signals::HIGHPRI_REQUESTED
                .clear()
                .union(signals::HIGHPRI_RUNNING.set())
                .bits(),
        )]);

        barrier::mmio_write();
        self.coproc.write_status(signals::HIGHPRI_REQUESTED.set());
        self.flush_internal();
        self.stats.highpri_sessions += 1;
    }

    /// Blank the epilog of the previous session if it is still ahead of the
    /// engine.
    fn merge_previous_epilog(&mut self) {
        let cur = self.current.cur;
        if cur < EPILOG_MERGE_WORDS {
            return;
        }
        let region = self.current.active;
        let word = |idx: u32| self.mem.word(region.word_addr(idx));

        let at_epilog = opcode_of(word(cur).load(Ordering::Acquire)) == Opcode::Idle as u8
            && opcode_of(word(cur - 3).load(Ordering::Acquire)) == Opcode::SwapBuffers as u8;
        if !at_epilog {
            return;
        }

        // The engine may be fetching these words right now. Left to right it
        // sees either zeros (and waits) or a prefix of the old epilog followed
        // by zeros, never a torn SWAP_BUFFERS.
        for idx in cur - EPILOG_MERGE_WORDS..cur {
            word(idx).store(0, Ordering::SeqCst);
            barrier::full();
        }
        for idx in cur - EPILOG_MERGE_WORDS..cur {
            word(idx).store(Opcode::Noop.word(0), Ordering::SeqCst);
            barrier::full();
        }
        log::trace!("cmdq: merged high-priority session at {}", region.word_addr(cur));
    }

    /// Terminate the session with the epilog and return to low priority
    pub fn highpri_end(&mut self) {
        assert!(self.is_highpri, "not in high-priority mode");

        // The cursor must stay within the sentinel so that a later buffer
        // switch still has room for its own jump.
        if !self.current.fits(EPILOG_WORDS) {
            self.next_buffer();
        }

        let region = self.current.active;
        let end = self.current.cur;
        let epilog = end + 2;

        // The epilog is written two words past the terminator, so the engine
        // only reaches it through the JUMP below.
        publish(
            &self.mem,
            region,
            epilog,
            &[
                Opcode::SetStatus.word(signals::HIGHPRI_RUNNING.clear().bits()),
                Opcode::SwapBuffers.word(slot(LOWPRI_CALL_SLOT)),
                slot(HIGHPRI_CALL_SLOT),
                signals::HIGHPRI_REQUESTED.status().bits(),
            ],
        );
        barrier::write();
        publish(
            &self.mem,
            region,
            end,
            &[Opcode::Jump.word(addr_payload(region.word_addr(epilog)))],
        );
        self.current.cur = end + EPILOG_WORDS;
        self.flush_internal();

        self.highpri = core::mem::replace(&mut self.current, self.lowpri.clone());
        self.is_highpri = false;
    }

    /// Wait until the engine has executed every high-priority session
    pub fn highpri_sync(&mut self) {
        assert!(!self.is_highpri, "highpri_sync() cannot be called in high-priority mode");

        let busy = signals::HIGHPRI_REQUESTED
            .status()
            .union(signals::HIGHPRI_RUNNING.status());
        self.wait_for("highpri sync", |q| !q.coproc.status().intersects(busy));
    }
}

#[cfg(test)]
mod tests {
    use helix_hal::Status;

    use super::*;
    use crate::opcode::TERMINATOR;
    use crate::sim::{self, Tally};

    #[test]
    fn test_highpri_session_runs() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        h.queue.highpri_begin();
        assert!(h.queue.is_highpri());
        h.queue.write(1, Tally::PUSH, &[7]);
        h.queue.highpri_end();
        h.queue.highpri_sync();

        assert_eq!(tally.values(&h.mem), [7]);
        let status = h.sim.status();
        assert!(!status.contains(signals::HIGHPRI_REQUESTED.status()));
        assert!(!status.contains(signals::HIGHPRI_RUNNING.status()));
        assert!(!h.queue.is_highpri());
    }

    #[test]
    fn test_epilog_layout() {
        let mut h = sim::harness(sim::test_config());
        h.queue.highpri_begin();
        let region = h.queue.current.active;
        let end = h.queue.current.cur;
        h.queue.highpri_end();

        let mut words = [0u32; 7];
        h.mem.copy_out(region.word_addr(end), &mut words);
        assert_eq!(opcode_of(words[0]), Opcode::Jump as u8);
        assert_eq!(words[0] & 0x00FF_FFFF, region.word_addr(end + 2).raw());
        assert_eq!(words[1], TERMINATOR);
        assert_eq!(words[3], Opcode::SwapBuffers.word(slot(LOWPRI_CALL_SLOT)));
        assert_eq!(words[4], slot(HIGHPRI_CALL_SLOT));
        assert_eq!(words[6], TERMINATOR);
        assert_eq!(h.queue.highpri.cur, end + 6);
        h.queue.highpri_sync();
    }

    #[test]
    fn test_session_filled_to_sentinel() {
        let config = crate::QueueConfig {
            lowpri_buffer_words: 16,
            highpri_buffer_words: 16,
            max_command_words: 8,
            block_min_words: 16,
            block_max_words: 32,
            ..sim::test_config()
        };
        let mut h = sim::harness(config);

        for _ in 0..3 {
            h.queue.highpri_begin();
            while h.queue.current.cur < h.queue.current.sentinel {
                h.queue.noop();
            }
            h.queue.highpri_end();
            assert!(h.queue.highpri.cur <= h.queue.highpri.sentinel);
            h.queue.highpri_sync();
        }
        h.queue.wait_idle();
        assert!(h.queue.stats().buffer_swaps >= 3);
    }

    #[test]
    #[should_panic(expected = "coprocessor crash @ highpri sync")]
    fn test_highpri_sync_watchdog_crashes() {
        let config = crate::QueueConfig { watchdog_ms: 20, ..sim::test_config() };
        let mut h = sim::harness(config);
        h.sim.set_paused(true);
        h.queue.highpri_begin();
        h.queue.noop();
        h.queue.highpri_end();
        h.queue.highpri_sync();
    }

    #[test]
    fn test_back_to_back_sessions() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        for value in 0..40 {
            h.queue.highpri_begin();
            h.queue.write(1, Tally::PUSH, &[value]);
            h.queue.highpri_end();
        }
        h.queue.highpri_sync();

        assert!(tally.values(&h.mem).into_iter().eq(0..40));
        assert!(h.queue.stats().buffer_swaps >= 1);
    }

    #[test]
    fn test_merge_blanks_pending_epilog() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        // Pause the engine so the first epilog is still pending when the
        // second session opens.
        h.sim.set_paused(true);
        h.queue.highpri_begin();
        h.queue.write(1, Tally::PUSH, &[1]);
        h.queue.highpri_end();
        let region = h.queue.highpri.active;
        let cur = h.queue.highpri.cur;

        h.queue.highpri_begin();
        for idx in cur - 5..cur {
            assert_eq!(h.mem.read(region.word_addr(idx)), Opcode::Noop.word(0));
        }
        h.queue.write(1, Tally::PUSH, &[2]);
        h.queue.highpri_end();
        h.sim.set_paused(false);
        h.queue.highpri_sync();

        assert_eq!(tally.values(&h.mem), [1, 2]);
    }

    #[test]
    fn test_lowpri_resumes_after_highpri() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        for value in 0..20 {
            h.queue.write(1, Tally::PUSH, &[value]);
        }
        h.queue.highpri_begin();
        h.queue.write(1, Tally::PUSH, &[1000]);
        h.queue.highpri_end();
        for value in 20..40 {
            h.queue.write(1, Tally::PUSH, &[value]);
        }
        h.queue.wait_idle();

        let values = tally.values(&h.mem);
        assert_eq!(values.len(), 41);
        let lowpri: alloc::vec::Vec<u32> = values.iter().copied().filter(|&v| v != 1000).collect();
        assert!(lowpri.into_iter().eq(0..40));
        assert!(!h.sim.status().contains(Status::SIG2));
    }

    #[test]
    #[should_panic(expected = "already in high-priority mode")]
    fn test_begin_twice_panics() {
        let mut h = sim::harness(sim::test_config());
        h.queue.highpri_begin();
        h.queue.highpri_begin();
    }

    #[test]
    #[should_panic(expected = "cannot be called in high-priority mode")]
    fn test_sync_inside_session_panics() {
        let mut h = sim::harness(sim::test_config());
        h.queue.highpri_begin();
        h.queue.highpri_sync();
    }

    #[test]
    #[should_panic(expected = "while recording a block")]
    fn test_begin_while_recording_panics() {
        let mut h = sim::harness(sim::test_config());
        h.queue.block_begin();
        h.queue.highpri_begin();
    }

    #[test]
    #[should_panic(expected = "cannot record a block in high-priority mode")]
    fn test_record_inside_session_panics() {
        let mut h = sim::harness(sim::test_config());
        h.queue.highpri_begin();
        h.queue.block_begin();
    }
}
