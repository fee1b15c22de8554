//! # Syncpoints
//!
//! A syncpoint is a marker in the command stream. When the engine reaches
//! it, it raises `SIG_SYNCPOINT` and the coprocessor interrupt; the handler
//! acknowledges the signal and bumps a completion counter. Ids are issued in
//! stream order, so a syncpoint is reached once the counter has caught up
//! with its id.
//!
//! The marker is a `TAS_STATUS` that first waits for `SIG_SYNCPOINT` to be
//! clear: two back-to-back syncpoints never collapse into one interrupt.

use core::sync::atomic::{AtomicU32, Ordering};

use helix_hal::{Coprocessor, InterruptHandler, Status, WStatus};

use crate::layout::signals;
use crate::opcode::Opcode;
use crate::queue::CommandQueue;

/// Handle to a position in the command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Syncpoint(u32);

impl Syncpoint {
    /// Sequence number of the syncpoint
    pub fn id(self) -> u32 {
        self.0
    }
}

// =============================================================================
// INTERRUPT HANDLER
// =============================================================================

/// Completion counter bumped from interrupt context
#[derive(Debug, Default)]
pub struct SyncpointCounter {
    done: AtomicU32,
}

impl SyncpointCounter {
    /// Create a counter with no syncpoint reached
    pub const fn new() -> Self {
        Self { done: AtomicU32::new(0) }
    }

    /// Number of syncpoints reached so far
    pub fn done(&self) -> u32 {
        self.done.load(Ordering::Acquire)
    }

    /// Whether `sp` was reached
    pub fn reached(&self, sp: Syncpoint) -> bool {
        sp.0 <= self.done()
    }
}

impl InterruptHandler for SyncpointCounter {
    fn handle(&self, status: Status) -> WStatus {
        if !status.contains(signals::SYNCPOINT.status()) {
            return WStatus::CLEAR_INTR;
        }
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("cmdq: syncpoint {} reached", done);
        signals::SYNCPOINT.clear().union(WStatus::CLEAR_INTR)
    }
}

// =============================================================================
// QUEUE OPERATIONS
// =============================================================================

impl<C: Coprocessor> CommandQueue<C> {
    /// Enqueue a syncpoint and return its handle
    pub fn syncpoint_new(&mut self) -> Syncpoint {
        assert!(self.block.is_none(), "cannot create a syncpoint while recording a block");

        self.emit(&[
            Opcode::TasStatus.word(WStatus::SET_INTR.union(signals::SYNCPOINT.set()).bits()),
            signals::SYNCPOINT.status().bits(),
        ]);
        self.syncpoints_issued += 1;
        self.stats.syncpoints += 1;
        Syncpoint(self.syncpoints_issued)
    }

    /// Whether the engine has passed `sp`
    pub fn syncpoint_check(&self, sp: Syncpoint) -> bool {
        self.syncpoints.reached(sp)
    }

    /// Wait until the engine has passed `sp`
    pub fn syncpoint_wait(&mut self, sp: Syncpoint) {
        if self.syncpoint_check(sp) {
            return;
        }
        assert!(
            self.coproc.interrupts_enabled(),
            "deadlock: interrupts are disabled while waiting for syncpoint {}",
            sp.0
        );

        self.flush_internal();
        self.wait_for("syncpoint wait", |q| q.syncpoint_check(sp));
    }

    /// Wait until every command written so far was executed
    pub fn wait_idle(&mut self) {
        let sp = self.syncpoint_new();
        self.syncpoint_wait(sp);
    }
}
