//! # Software Coprocessor
//!
//! A threaded model of the coprocessor running the queue engine. It keeps
//! the status register with its set/clear write semantics, a local memory
//! image, the call stack and the DMA registers, and executes the command
//! stream out of [`SharedMemory`] exactly as the microcode would.
//!
//! ```text
//!   host thread                           engine thread
//!  ┌──────────────┐  write_status/unpark ┌──────────────────────────┐
//!  │ CommandQueue │ ───────────────────▶ │ fetch window (16 words)  │
//!  └──────┬───────┘                      │ priority check           │
//!         │ publish                      │ dispatch internal ops    │
//!         ▼                              │ dispatch overlay ops ────┼──▶ OverlayProgram
//!  ┌──────────────┐       fetch / DMA    └────────────┬─────────────┘
//!  │ SharedMemory │ ◀─────────────────────────────────┘
//!  └──────────────┘
//! ```
//!
//! Overlay code is not interpreted: the word at an overlay's code address is
//! a signature that selects an installed [`OverlayProgram`].

mod engine;
mod programs;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use helix_hal::{
    Clock, Coprocessor, DmaRegisters, InterruptHandler, PhysAddr, SharedMemory, Status, WStatus,
};
use spin::{Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub use programs::{tally_microcode, OverlayContext, OverlayProgram, Tally, TallyState};

use crate::config::QueueConfig;
use crate::layout::LOCAL_WORDS;
use crate::queue::CommandQueue;

// =============================================================================
// CLOCK
// =============================================================================

/// Monotonic clock backed by the host's `Instant`
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    epoch: Instant,
}

impl SimClock {
    fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State visible to both the host side and the engine thread
pub(crate) struct SimShared {
    pub(crate) mem: Arc<SharedMemory>,
    status: AtomicU32,
    pub(crate) pc: AtomicU32,
    pub(crate) dma: Mutex<DmaRegisters>,
    pub(crate) local: Box<[AtomicU32]>,
    handler: Mutex<Option<Arc<dyn InterruptHandler>>>,
    irq_enabled: AtomicBool,
    irq_pending: AtomicBool,
    pub(crate) programs: RwLock<Vec<Arc<dyn OverlayProgram>>>,
    pub(crate) paused: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) restart: AtomicBool,
    claimed: AtomicBool,
    pub(crate) executed: AtomicU64,
}

impl SimShared {
    fn new(mem: Arc<SharedMemory>) -> Self {
        Self {
            mem,
            status: AtomicU32::new(Status::HALTED.bits()),
            pc: AtomicU32::new(0),
            dma: Mutex::new(DmaRegisters::default()),
            local: (0..LOCAL_WORDS).map(|_| AtomicU32::new(0)).collect(),
            handler: Mutex::new(None),
            irq_enabled: AtomicBool::new(true),
            irq_pending: AtomicBool::new(false),
            programs: RwLock::new(Vec::new()),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            executed: AtomicU64::new(0),
        }
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_bits_retain(self.status.load(Ordering::SeqCst))
    }

    /// Atomically update the status register, returning the previous value
    /// if `f` accepted it
    pub(crate) fn update_status<F>(&self, mut f: F) -> Option<Status>
    where
        F: FnMut(Status) -> Option<Status>,
    {
        self.status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                f(Status::from_bits_retain(bits)).map(|s| s.bits())
            })
            .ok()
            .map(Status::from_bits_retain)
    }

    /// Apply a write mask, raising the interrupt if it asks to
    pub(crate) fn write_status(&self, w: WStatus) {
        self.update_status(|s| Some(s.apply(w)));
        if w.contains(WStatus::SET_INTR) {
            self.raise_interrupt();
        }
    }

    pub(crate) fn raise_interrupt(&self) {
        self.irq_pending.store(true, Ordering::SeqCst);
        if self.irq_enabled.load(Ordering::SeqCst) {
            self.deliver_pending();
        }
    }

    fn deliver_pending(&self) {
        if !self.irq_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            let ack = handler.handle(self.status());
            self.write_status(ack.difference(WStatus::SET_INTR));
        }
    }

    pub(crate) fn local(&self, index: usize) -> u32 {
        self.local[index].load(Ordering::SeqCst)
    }

    pub(crate) fn set_local(&self, index: usize, value: u32) {
        self.local[index].store(value, Ordering::SeqCst);
    }
}

// =============================================================================
// SIMULATED COPROCESSOR
// =============================================================================

/// Software coprocessor with its engine running on a host thread
pub struct SimCoprocessor {
    shared: Arc<SimShared>,
    clock: SimClock,
    thread: Option<JoinHandle<()>>,
}

impl core::fmt::Debug for SimCoprocessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimCoprocessor")
            .field("status", &self.shared.status())
            .field("executed", &self.executed())
            .finish()
    }
}

impl SimCoprocessor {
    /// Create a halted coprocessor attached to `mem`
    pub fn new(mem: Arc<SharedMemory>) -> Self {
        let shared = Arc::new(SimShared::new(mem));
        let state = shared.clone();
        let thread = thread::spawn(move || engine::run(state));
        Self {
            shared,
            clock: SimClock::new(),
            thread: Some(thread),
        }
    }

    fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    /// Make overlay code carrying `program`'s signature executable
    pub fn install(&self, program: Arc<dyn OverlayProgram>) {
        self.shared.programs.write().push(program);
    }

    /// Gate interrupt delivery; a pending interrupt is delivered on enable
    pub fn set_interrupts_enabled(&self, enabled: bool) {
        self.shared.irq_enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.shared.deliver_pending();
        }
    }

    /// Freeze the engine between two commands without halting it
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
        self.wake();
    }

    /// Number of commands executed so far
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::SeqCst)
    }

    /// Shared memory the engine fetches from
    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.shared.mem
    }
}

impl Coprocessor for SimCoprocessor {
    type Clock = SimClock;

    fn status(&self) -> Status {
        self.shared.status()
    }

    fn write_status(&self, w: WStatus) {
        self.shared.write_status(w);
        self.wake();
    }

    fn program_counter(&self) -> u32 {
        self.shared.pc.load(Ordering::SeqCst)
    }

    fn dma_registers(&self) -> DmaRegisters {
        *self.shared.dma.lock()
    }

    fn read_local(&self, index: usize) -> u32 {
        self.shared.local(index)
    }

    fn load_local(&self, index: usize, data: &[u32]) {
        for (i, &word) in data.iter().enumerate() {
            self.shared.set_local(index + i, word);
        }
    }

    fn run(&self) {
        // The engine reloads its position before it can observe the cleared
        // halt bit.
        self.shared.restart.store(true, Ordering::SeqCst);
        self.write_status(WStatus::CLEAR_HALT | WStatus::CLEAR_BROKE);
    }

    fn try_claim(&self) -> bool {
        self.shared
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.shared.claimed.store(false, Ordering::Release);
    }

    fn set_interrupt_handler(&self, handler: Option<Arc<dyn InterruptHandler>>) {
        *self.shared.handler.lock() = handler;
    }

    fn interrupts_enabled(&self) -> bool {
        self.shared.irq_enabled.load(Ordering::SeqCst)
    }

    fn clock(&self) -> &SimClock {
        &self.clock
    }
}

impl Drop for SimCoprocessor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("sim: engine thread panicked");
            }
        }
    }
}

// =============================================================================
// TEST HARNESS
// =============================================================================

/// Physical address of the harness arena
pub const ARENA_BASE: u32 = 0x10_0000;

/// Size of the harness arena in words
pub const ARENA_WORDS: u32 = 0x10000;

/// Small configuration that forces frequent buffer switches
pub fn test_config() -> QueueConfig {
    QueueConfig {
        lowpri_buffer_words: 128,
        highpri_buffer_words: 64,
        max_command_words: 16,
        block_min_words: 32,
        block_max_words: 256,
        watchdog_ms: 2000,
    }
}

/// A running queue on a software coprocessor
#[derive(Debug)]
pub struct Harness {
    /// The queue under test
    pub queue: CommandQueue<SimCoprocessor>,
    /// The coprocessor it drives
    pub sim: Arc<SimCoprocessor>,
    /// Shared memory arena
    pub mem: Arc<SharedMemory>,
}

impl Harness {
    /// Upload a [`Tally`] overlay, register it under `id` and return a view
    /// of its state.
    ///
    /// Waits until the engine loaded the new overlay table, so the id is
    /// usable from the high-priority lane as well.
    pub fn install_tally(&mut self, id: u8) -> TallyState {
        let ucode = tally_microcode(&self.mem);
        self.sim.install(Arc::new(Tally));
        self.queue.overlay_register(&ucode, id);
        self.queue.wait_idle();
        TallyState::new(self.queue.overlay_state(&ucode))
    }
}

/// Create an arena, a software coprocessor and a started queue
pub fn harness(config: QueueConfig) -> Harness {
    let mem = match SharedMemory::new(PhysAddr::new(ARENA_BASE), ARENA_WORDS) {
        Ok(mem) => Arc::new(mem),
        Err(err) => panic!("cannot create the harness arena: {}", err),
    };
    let sim = Arc::new(SimCoprocessor::new(mem.clone()));
    let queue = match CommandQueue::init(sim.clone(), mem.clone(), config) {
        Ok(queue) => queue,
        Err(err) => panic!("cannot initialize the harness queue: {}", err),
    };
    Harness { queue, sim, mem }
}

#[cfg(test)]
mod tests {
    use helix_hal::timer::poll_until;

    use super::*;
    use crate::layout;
    use crate::opcode::Opcode;

    #[test]
    fn test_status_writes_apply_masks() {
        let mem = Arc::new(SharedMemory::new(PhysAddr::new(ARENA_BASE), 64).unwrap());
        let sim = SimCoprocessor::new(mem);
        assert!(sim.status().contains(Status::HALTED));
        sim.write_status(WStatus::SET_SIG0 | WStatus::SET_SIG7);
        assert!(sim.status().contains(Status::SIG0 | Status::SIG7));
        sim.write_status(WStatus::CLEAR_SIG7);
        assert!(!sim.status().contains(Status::SIG7));
    }

    #[test]
    fn test_unknown_opcode_breaks_engine() {
        let mut h = harness(test_config());
        h.queue.wait_idle();
        let bad = h.queue.current.cursor_addr();
        h.queue.queue_u32(0x0A00_0000);
        let sp = h.queue.syncpoint_new();
        h.queue.flush();

        let passed = poll_until(h.sim.clock(), 50, || h.queue.syncpoint_check(sp));
        assert!(passed.is_err());
        assert!(h.sim.status().contains(Status::HALTED | Status::BROKE));
        assert_eq!(h.sim.read_local(layout::DRAM_CURRENT_ADDR), bad.raw());
    }

    #[test]
    fn test_interrupt_without_handler_is_dropped() {
        let mem = Arc::new(SharedMemory::new(PhysAddr::new(ARENA_BASE), 64).unwrap());
        let sim = SimCoprocessor::new(mem);
        sim.write_status(WStatus::SET_INTR);
        sim.set_interrupts_enabled(false);
        sim.set_interrupts_enabled(true);
        assert!(!sim.shared.irq_pending.load(Ordering::SeqCst));
    }

    #[test]
    fn test_harness_queue_drains() {
        let mut h = harness(test_config());
        for _ in 0..10 {
            h.queue.emit(&[Opcode::Noop.word(0)]);
        }
        h.queue.wait_idle();
        assert!(h.sim.executed() >= 11);
    }
}
