//! # Command Queue
//!
//! The host side of the command stream: lane contexts, buffer switching,
//! wake-ups and the engine state uploaded at start.
//!
//! ```text
//!                 ┌──────────────┐  reserve/commit   ┌───────────────────┐
//!  producer ────► │ CommandQueue │ ────────────────► │ current context   │
//!                 └──────┬───────┘                   │ (lowpri, highpri  │
//!                        │ flush: SIG_MORE + unhalt  │  or block chunk)  │
//!                        ▼                           └─────────┬─────────┘
//!                 ┌──────────────┐        fetch / execute      │
//!                 │ Coprocessor  │ ◄───────────────────────────┘
//!                 └──────────────┘
//! ```
//!
//! Each lane owns two ring buffers. When the cursor reaches the sentinel the
//! lane switches to the other buffer, first waiting for the engine to signal
//! that it left it. The old buffer is terminated with
//! `SET_STATUS(set BUFDONE)` followed by a `JUMP` to the new one.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::hint;

use helix_hal::timer::poll_until;
use helix_hal::{barrier, Coprocessor, SharedMemory, Status, WStatus};

use crate::block::BlockRecording;
use crate::config::{QueueConfig, HIGHPRI_CALL_SLOT};
use crate::context::{publish, QueueContext};
use crate::crash;
use crate::error::{CmdqError, Result};
use crate::layout::{self, signals};
use crate::opcode::{addr_payload, Opcode};
use crate::overlay::OverlayTables;
use crate::syncpoint::SyncpointCounter;
use crate::writer::CommandWriter;

/// Status write issued when the engine starts
const START_STATUS: WStatus = WStatus::CLEAR_SIG0
    .union(WStatus::CLEAR_SIG1)
    .union(signals::HIGHPRI_RUNNING.clear())
    .union(signals::SYNCPOINT.clear())
    .union(signals::BUFDONE_LOWPRI.set())
    .union(signals::BUFDONE_HIGHPRI.set())
    .union(signals::HIGHPRI_REQUESTED.clear())
    .union(signals::MORE.clear());

/// Status write that wakes the engine
const KICK: WStatus = signals::MORE
    .set()
    .union(WStatus::CLEAR_HALT)
    .union(WStatus::CLEAR_BROKE);

/// Spins between the two kicks of a flush
const KICK_DELAY_SPINS: u32 = 10;

// =============================================================================
// STATISTICS
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Ring buffer switches
    pub buffer_swaps: u64,
    /// Switches that had to wait for the engine
    pub swap_stalls: u64,
    /// Block chunks allocated
    pub block_chunks: u64,
    /// Blocks recorded
    pub blocks_recorded: u64,
    /// Syncpoints issued
    pub syncpoints: u64,
    /// High-priority sessions
    pub highpri_sessions: u64,
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Host side of the coprocessor command stream
pub struct CommandQueue<C: Coprocessor> {
    pub(crate) coproc: Arc<C>,
    pub(crate) mem: Arc<SharedMemory>,
    pub(crate) config: QueueConfig,
    /// Context commands are written to
    pub(crate) current: QueueContext,
    /// Saved low-priority context while in high-priority or block mode
    pub(crate) lowpri: QueueContext,
    /// Parked high-priority context while in low-priority mode
    pub(crate) highpri: QueueContext,
    pub(crate) overlays: OverlayTables,
    pub(crate) block: Option<BlockRecording>,
    pub(crate) is_highpri: bool,
    pub(crate) running: bool,
    pub(crate) syncpoints: Arc<SyncpointCounter>,
    pub(crate) syncpoints_issued: u32,
    pub(crate) stats: QueueStats,
}

impl<C: Coprocessor> fmt::Debug for CommandQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("cursor", &self.current.cursor_addr())
            .field("is_highpri", &self.is_highpri)
            .field("recording", &self.block.is_some())
            .field("running", &self.running)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<C: Coprocessor> CommandQueue<C> {
    /// Allocate the lanes and overlay tables, install the syncpoint
    /// interrupt handler and start the engine.
    pub fn init(coproc: Arc<C>, mem: Arc<SharedMemory>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        if !coproc.try_claim() {
            return Err(CmdqError::AlreadyInitialized);
        }

        let mut queue = match Self::build(coproc.clone(), mem, config) {
            Ok(queue) => queue,
            Err(err) => {
                coproc.release();
                return Err(err);
            },
        };
        queue
            .coproc
            .set_interrupt_handler(Some(queue.syncpoints.clone()));
        queue.start();

        log::info!(
            "cmdq: initialized (lowpri 2x{}w @ {}, highpri 2x{}w @ {})",
            queue.config.lowpri_buffer_words,
            queue.current.buffers[0].addr(),
            queue.config.highpri_buffer_words,
            queue.highpri.buffers[0].addr()
        );
        Ok(queue)
    }

    fn build(coproc: Arc<C>, mem: Arc<SharedMemory>, config: QueueConfig) -> Result<Self> {
        let max = config.max_command_words;
        let lowpri = QueueContext::new(
            &mem,
            config.lowpri_buffer_words,
            layout::bufdone_signal(false),
            max,
        )?;
        let highpri = match QueueContext::new(
            &mem,
            config.highpri_buffer_words,
            layout::bufdone_signal(true),
            max,
        ) {
            Ok(ctx) => ctx,
            Err(err) => {
                lowpri.free(&mem)?;
                return Err(err.into());
            },
        };
        let overlays = match OverlayTables::new(&mem) {
            Ok(tables) => tables,
            Err(err) => {
                lowpri.free(&mem)?;
                highpri.free(&mem)?;
                return Err(err.into());
            },
        };

        Ok(Self {
            coproc,
            mem,
            config,
            current: lowpri.clone(),
            lowpri,
            highpri,
            overlays,
            block: None,
            is_highpri: false,
            running: false,
            syncpoints: Arc::new(SyncpointCounter::new()),
            syncpoints_issued: 0,
            stats: QueueStats::default(),
        })
    }

    /// Engine state uploaded to local memory at start
    fn local_image(&self) -> Vec<u32> {
        let mut image = vec![0u32; layout::HEADER_WORDS];
        image[..layout::TABLES_WORDS].copy_from_slice(&self.overlays.encode());

        let lowpri = self.current.cursor_addr().raw();
        let highpri = self.highpri.cursor_addr().raw();
        image[layout::POINTER_STACK + HIGHPRI_CALL_SLOT as usize] = highpri;
        image[layout::DRAM_LOWPRI_ADDR] = lowpri;
        image[layout::DRAM_HIGHPRI_ADDR] = highpri;
        image[layout::DRAM_CURRENT_ADDR] = lowpri;
        image[layout::CURRENT_OVERLAY] = 0;
        image[layout::PRIMODE_STATUS_CHECK] = signals::HIGHPRI_REQUESTED.status().bits();
        image
    }

    /// Upload the engine state and start executing the low-priority lane.
    ///
    /// Does nothing if the engine is already running.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        assert!(
            !self.is_highpri && self.block.is_none(),
            "the queue can only be started in low-priority mode"
        );

        self.wait_for("start", |q| q.coproc.status().contains(Status::HALTED));
        self.coproc.load_local(0, &self.local_image());

        barrier::mmio_write();
        self.coproc.write_status(START_STATUS);
        self.coproc.run();
        self.running = true;
        log::info!("cmdq: engine started at {}", self.current.cursor_addr());
    }

    /// Let the engine drain the queue, then halt it
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        assert!(
            !self.is_highpri && self.block.is_none(),
            "the queue can only be stopped in low-priority mode"
        );

        self.flush_internal();
        self.wait_for("stop", |q| {
            let status = q.coproc.status();
            status.contains(Status::HALTED) && !status.contains(signals::MORE.status())
        });
        barrier::mmio_write();
        self.coproc.write_status(WStatus::SET_HALT);
        self.running = false;
        log::info!("cmdq: engine stopped at {}", self.current.cursor_addr());
    }

    /// Stop the engine, remove the interrupt handler and release the lanes
    pub fn close(mut self) {
        self.stop();
        self.coproc.set_interrupt_handler(None);

        let released = self
            .current
            .free(&self.mem)
            .and_then(|()| self.highpri.free(&self.mem))
            .and_then(|()| self.overlays.free(&self.mem));
        if let Err(err) = released {
            log::warn!("cmdq: failed to release queue memory: {}", err);
        }

        self.coproc.release();
        log::info!("cmdq: closed ({:?})", self.stats);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Coprocessor driven by this queue
    pub fn coprocessor(&self) -> &Arc<C> {
        &self.coproc
    }

    /// Shared memory the queue lives in
    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.mem
    }

    /// Active configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Statistics
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Whether the engine was started
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether commands currently go to the high-priority lane
    pub fn is_highpri(&self) -> bool {
        self.is_highpri
    }

    /// Whether a block is being recorded
    pub fn is_recording(&self) -> bool {
        self.block.is_some()
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Reserve room for a command of up to `words` words at the cursor.
    ///
    /// Switches buffer first if the command would cross the sentinel.
    pub fn reserve(&mut self, words: u32) -> CommandWriter<'_, C> {
        self.make_room(words);
        CommandWriter::new(self, words)
    }

    /// Write a complete command
    pub(crate) fn emit(&mut self, words: &[u32]) {
        self.make_room(words.len() as u32);
        self.current.append(&self.mem, words);
    }

    fn make_room(&mut self, words: u32) {
        assert!(words > 0, "empty command reservation");
        assert!(
            words <= self.config.max_command_words,
            "command of {} words exceeds the maximum of {}",
            words,
            self.config.max_command_words
        );
        if !self.current.fits(words) {
            self.next_buffer();
        }
    }

    /// Enqueue a one-word command given as its opcode byte
    pub fn queue_u8(&mut self, cmd: u8) {
        self.emit(&[(cmd as u32) << 24]);
    }

    /// Enqueue a one-word command given as its top half-word
    pub fn queue_u16(&mut self, cmd: u16) {
        self.emit(&[(cmd as u32) << 16]);
    }

    /// Enqueue a one-word command
    pub fn queue_u32(&mut self, cmd: u32) {
        self.emit(&[cmd]);
    }

    /// Enqueue a two-word command, most significant word first
    pub fn queue_u64(&mut self, cmd: u64) {
        self.emit(&[(cmd >> 32) as u32, cmd as u32]);
    }

    /// Enqueue a command that does nothing
    pub fn noop(&mut self) {
        self.emit(&[Opcode::Noop.word(0)]);
    }

    /// Enqueue a write of the user signals SIG0 and SIG1
    pub fn signal(&mut self, mask: WStatus) {
        let allowed = signals::USER0
            .set()
            .union(signals::USER0.clear())
            .union(signals::USER1.set())
            .union(signals::USER1.clear());
        assert!(
            allowed.contains(mask),
            "signal() only modifies the user signals SIG0 and SIG1 (mask {:#x})",
            mask.bits()
        );
        self.emit(&[Opcode::SetStatus.word(mask.bits())]);
    }

    // =========================================================================
    // Buffer management
    // =========================================================================

    /// Wake the engine so it fetches the commands written so far.
    ///
    /// Ignored while recording a block.
    pub fn flush(&mut self) {
        if self.block.is_some() {
            return;
        }
        self.flush_internal();
    }

    /// Raise SIG_MORE and unhalt the engine.
    ///
    /// The engine may have checked SIG_MORE just before halting, so the
    /// write is issued a second time a few cycles later.
    pub(crate) fn flush_internal(&self) {
        barrier::mmio_write();
        self.coproc.write_status(KICK);
        for _ in 0..KICK_DELAY_SPINS {
            hint::spin_loop();
        }
        self.coproc.write_status(KICK);
    }

    /// Continue the current stream in a fresh buffer
    pub(crate) fn next_buffer(&mut self) {
        if self.block.is_some() {
            self.next_block_chunk();
            return;
        }

        let bufdone = self.current.bufdone;
        barrier::full();
        if !self.coproc.status().contains(bufdone.status()) {
            self.stats.swap_stalls += 1;
            self.flush_internal();
            self.wait_for("buffer swap", |q| q.coproc.status().contains(bufdone.status()));
        }
        barrier::mmio_write();
        self.coproc.write_status(bufdone.clear());

        self.current.buf_idx ^= 1;
        let next = self.current.buffers[self.current.buf_idx];
        self.mem.zero(next);

        let max = self.config.max_command_words;
        let (prev, prev_cur) = self.current.switch_to(&self.mem, next, max);
        publish(
            &self.mem,
            prev,
            prev_cur,
            &[
                Opcode::SetStatus.word(bufdone.set().bits()),
                Opcode::Jump.word(addr_payload(next.addr())),
            ],
        );
        self.flush_internal();

        self.stats.buffer_swaps += 1;
        log::debug!(
            "cmdq: {} lane switched to buffer {} at {}",
            if self.is_highpri { "highpri" } else { "lowpri" },
            self.current.buf_idx,
            next.addr()
        );
    }

    /// Busy-wait until `cond` holds, producing a crash report on timeout
    pub(crate) fn wait_for<F>(&self, site: &str, mut cond: F)
    where
        F: FnMut(&Self) -> bool,
    {
        if poll_until(self.coproc.clock(), self.config.watchdog_ms, || cond(self)).is_err() {
            crash::crash(&*self.coproc, site);
        }
    }
}

#[cfg(test)]
mod tests {
    use helix_hal::{PhysAddr, Signal};

    use super::*;
    use crate::opcode::TERMINATOR;
    use crate::sim::{self, SimCoprocessor, Tally};

    #[test]
    fn test_init_uploads_engine_state() {
        let h = sim::harness(sim::test_config());
        let q = &h.queue;
        assert!(q.is_running());
        let coproc = q.coprocessor();
        assert_eq!(
            coproc.read_local(layout::DRAM_LOWPRI_ADDR),
            q.current.buffers[0].addr().raw()
        );
        assert_eq!(
            coproc.read_local(layout::POINTER_STACK + HIGHPRI_CALL_SLOT as usize),
            q.highpri.buffers[0].addr().raw()
        );
        assert_eq!(
            coproc.read_local(layout::PRIMODE_STATUS_CHECK),
            signals::HIGHPRI_REQUESTED.status().bits()
        );
    }

    #[test]
    fn test_second_init_rejected() {
        let h = sim::harness(sim::test_config());
        let again = CommandQueue::init(h.sim.clone(), h.mem.clone(), sim::test_config());
        assert_eq!(again.err(), Some(CmdqError::AlreadyInitialized));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mem = Arc::new(SharedMemory::new(PhysAddr::new(0x10_0000), 0x4000).unwrap());
        let coproc = Arc::new(SimCoprocessor::new(mem.clone()));
        let config = QueueConfig { watchdog_ms: 0, ..sim::test_config() };
        assert!(matches!(
            CommandQueue::init(coproc.clone(), mem, config),
            Err(CmdqError::InvalidConfig(_))
        ));
        assert!(coproc.try_claim());
    }

    #[test]
    fn test_out_of_memory_at_init() {
        let mem = Arc::new(SharedMemory::new(PhysAddr::new(0x10_0000), 0x100).unwrap());
        let coproc = Arc::new(SimCoprocessor::new(mem.clone()));
        let err = CommandQueue::init(coproc.clone(), mem.clone(), sim::test_config()).unwrap_err();
        assert!(matches!(err, CmdqError::Hal(_)));
        assert_eq!(mem.free_words(), 0x100);
        assert!(coproc.try_claim());
    }

    #[test]
    fn test_commit_publishes_command_and_terminator() {
        let mut h = sim::harness(sim::test_config());
        let start = h.queue.current.cur;
        let region = h.queue.current.active;
        let mut w = h.queue.reserve(3);
        w.push(Opcode::Noop.word(0));
        w.commit();

        assert_eq!(h.queue.current.cur, start + 1);
        assert_eq!(h.mem.read(region.word_addr(start)), Opcode::Noop.word(0));
        assert_eq!(h.mem.read(region.word_addr(start + 1)), TERMINATOR);
        assert_eq!(h.mem.read(region.word_addr(start + 2)), 0);
    }

    #[test]
    fn test_dropped_writer_commits() {
        let mut h = sim::harness(sim::test_config());
        let start = h.queue.current.cur;
        {
            let mut w = h.queue.reserve(2);
            w.extend(&[Opcode::Noop.word(0), Opcode::Noop.word(0)]);
        }
        assert_eq!(h.queue.current.cur, start + 2);
        {
            let _abandoned = h.queue.reserve(2);
        }
        assert_eq!(h.queue.current.cur, start + 2);
    }

    #[test]
    #[should_panic(expected = "write past the end of a 2-word reservation")]
    fn test_write_outside_reservation_panics() {
        let mut h = sim::harness(sim::test_config());
        let mut w = h.queue.reserve(2);
        w.extend(&[Opcode::Noop.word(0), 0, 0]);
    }

    #[test]
    #[should_panic(expected = "exceeds the maximum")]
    fn test_oversized_reservation_panics() {
        let mut h = sim::harness(sim::test_config());
        let max = h.queue.config().max_command_words;
        let _ = h.queue.reserve(max + 1);
    }

    #[test]
    fn test_flush_wakes_engine() {
        let mut h = sim::harness(sim::test_config());
        h.queue.noop();
        h.queue.flush();
        h.queue.wait_for("test", |q| {
            q.coprocessor().read_local(layout::DRAM_CURRENT_ADDR)
                == q.current.cursor_addr().raw()
        });
        assert!(h.sim.executed() >= 1);
    }

    #[test]
    fn test_fifo_across_buffer_swaps() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        let count = 3 * h.queue.config().lowpri_buffer_words;
        for value in 0..count {
            h.queue.write(1, Tally::PUSH, &[value]);
        }
        h.queue.wait_idle();

        let values = tally.values(&h.mem);
        assert_eq!(values.len() as u32, count);
        assert!(values.iter().copied().eq(0..count));
        assert!(h.queue.stats().buffer_swaps >= 2);
    }

    #[test]
    #[should_panic(expected = "coprocessor crash @ buffer swap")]
    fn test_swap_watchdog_crashes() {
        let config = QueueConfig { watchdog_ms: 20, ..sim::test_config() };
        let mut h = sim::harness(config);
        h.sim.set_paused(true);

        for _ in 0..3 * h.queue.config().lowpri_buffer_words {
            h.queue.noop();
        }
    }

    #[test]
    fn test_multiword_commands_survive_swaps() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);

        for value in 0..500u32 {
            h.queue.write(1, Tally::PUSH_WIDE, &[0, value | 0xAB00_0000]);
        }
        h.queue.wait_idle();

        let values = tally.values(&h.mem);
        assert_eq!(values.len(), 500);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(*value, i as u32 | 0xAB00_0000);
        }
    }

    #[test]
    fn test_signal_sets_user_bits() {
        let mut h = sim::harness(sim::test_config());
        h.queue.signal(signals::USER1.set());
        h.queue.wait_idle();
        assert!(h.sim.status().contains(Signal::new(1).status()));
        h.queue.signal(signals::USER1.clear());
        h.queue.wait_idle();
        assert!(!h.sim.status().contains(Status::SIG1));
    }

    #[test]
    #[should_panic(expected = "only modifies the user signals")]
    fn test_signal_rejects_protocol_bits() {
        let mut h = sim::harness(sim::test_config());
        h.queue.signal(signals::MORE.set());
    }

    #[test]
    fn test_raw_helpers() {
        let mut h = sim::harness(sim::test_config());
        let start = h.queue.current.cur;
        let region = h.queue.current.active;
        h.queue.queue_u8(0x07);
        h.queue.queue_u16(0x0700);
        h.queue.queue_u64(0x0700_0000_0700_0000);
        let mut words = [0u32; 5];
        h.mem.copy_out(region.word_addr(start), &mut words);
        assert_eq!(words, [0x0700_0000, 0x0700_0000, 0x0700_0000, 0x0700_0000, TERMINATOR]);
        h.queue.wait_idle();
    }

    #[test]
    fn test_stop_and_restart() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(1);
        h.queue.write(1, Tally::PUSH, &[1]);
        h.queue.stop();
        assert!(!h.queue.is_running());
        assert_eq!(tally.values(&h.mem), vec![1]);

        h.queue.start();
        h.queue.write(1, Tally::PUSH, &[2]);
        h.queue.wait_idle();
        assert_eq!(tally.values(&h.mem), vec![1, 2]);
    }

    #[test]
    fn test_close_releases_memory() {
        let h = sim::harness(sim::test_config());
        let sim::Harness { queue, sim, mem } = h;
        let before = mem.free_words();
        queue.close();
        assert!(mem.free_words() > before);
        assert!(sim.try_claim());
    }
}
