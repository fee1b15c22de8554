//! # Coprocessor Interface
//!
//! The [`Coprocessor`] trait is the seam between the command queue and the
//! hardware (or a software model of it). It exposes the status register,
//! the debug registers used by crash reports, local memory, the interrupt
//! line and a clock.

use alloc::sync::Arc;

use crate::status::{Status, WStatus};
use crate::timer::Clock;

// =============================================================================
// INTERRUPTS
// =============================================================================

/// Coprocessor interrupt handler
///
/// Runs in interrupt context: it must not block and must not allocate.
pub trait InterruptHandler: Send + Sync {
    /// Handle an interrupt raised while the register read `status`.
    ///
    /// Returns the status write that acknowledges it.
    fn handle(&self, status: Status) -> WStatus;
}

// =============================================================================
// DEBUG REGISTERS
// =============================================================================

/// DMA engine registers, as shown in crash reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaRegisters {
    /// Local memory byte offset of the last transfer
    pub local_addr: u32,
    /// Shared memory address of the last transfer
    pub shared_addr: u32,
    /// Length register for transfers into local memory
    pub read_len: u32,
    /// Length register for transfers out of local memory
    pub write_len: u32,
}

// =============================================================================
// COPROCESSOR
// =============================================================================

/// A vector coprocessor running the queue engine
pub trait Coprocessor: Send + Sync {
    /// Clock used to bound waits on this coprocessor
    type Clock: Clock;

    /// Read the status register
    fn status(&self) -> Status;

    /// Write the status register
    fn write_status(&self, w: WStatus);

    /// Program counter; only meaningful while halted
    fn program_counter(&self) -> u32;

    /// DMA engine registers
    fn dma_registers(&self) -> DmaRegisters;

    /// Read one word of local memory
    fn read_local(&self, index: usize) -> u32;

    /// Copy words into local memory; the coprocessor must be halted
    fn load_local(&self, index: usize, data: &[u32]);

    /// Start the queue engine from its entry point
    fn run(&self);

    /// Take exclusive ownership of the queue engine.
    ///
    /// Returns `false` if another owner holds it.
    fn try_claim(&self) -> bool;

    /// Give up ownership taken with [`Coprocessor::try_claim`]
    fn release(&self);

    /// Install or remove the interrupt handler
    fn set_interrupt_handler(&self, handler: Option<Arc<dyn InterruptHandler>>);

    /// Whether the host currently accepts coprocessor interrupts
    fn interrupts_enabled(&self) -> bool;

    /// Clock for watchdogs
    fn clock(&self) -> &Self::Clock;
}
