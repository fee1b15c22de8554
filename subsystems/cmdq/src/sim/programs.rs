//! Overlay programs run by the software coprocessor.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use helix_hal::{PhysAddr, SharedMemory};

use crate::layout::OVERLAY_DATA_ADDR;
use crate::overlay::{Microcode, ENGINE_PROLOGUE};

/// What an overlay command sees while it runs
#[derive(Debug)]
pub struct OverlayContext<'a> {
    /// Shared memory
    pub mem: &'a SharedMemory,
    /// The overlay's state buffer
    pub state: PhysAddr,
}

/// Host implementation of an overlay's microcode
pub trait OverlayProgram: Send + Sync {
    /// Word found at the overlay's code address
    fn signature(&self) -> u32;

    /// Length of `command` in words
    fn command_words(&self, command: u8) -> u32;

    /// Execute `command`; `args[0]` holds the 24-bit payload of the first word
    fn execute(&self, command: u8, args: &[u32], ctx: &OverlayContext<'_>);
}

// =============================================================================
// TALLY
// =============================================================================

/// Overlay that appends the values it receives to its state buffer.
///
/// State layout: word 0 is the count, the values follow.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tally;

impl Tally {
    /// Code signature
    pub const SIGNATURE: u32 = 0x5441_4C59;
    /// Append the 24-bit payload
    pub const PUSH: u8 = 0;
    /// Append the full second word
    pub const PUSH_WIDE: u8 = 1;
    /// Size of the state buffer in words
    pub const STATE_WORDS: u32 = 1100;
}

impl OverlayProgram for Tally {
    fn signature(&self) -> u32 {
        Self::SIGNATURE
    }

    fn command_words(&self, command: u8) -> u32 {
        match command {
            Self::PUSH_WIDE => 2,
            _ => 1,
        }
    }

    fn execute(&self, command: u8, args: &[u32], ctx: &OverlayContext<'_>) {
        let value = match command {
            Self::PUSH => args[0],
            Self::PUSH_WIDE => args[1],
            _ => return,
        };
        let count = ctx.mem.word(ctx.state);
        let n = count.load(Ordering::Acquire);
        if n + 1 >= Self::STATE_WORDS {
            log::warn!("sim: tally state full, dropping {:#x}", value);
            return;
        }
        ctx.mem.write(ctx.state.add_words(1 + n), value);
        count.store(n + 1, Ordering::Release);
    }
}

/// Host view of a [`Tally`] state buffer
#[derive(Debug, Clone, Copy)]
pub struct TallyState(PhysAddr);

impl TallyState {
    /// View the state buffer at `state`
    pub fn new(state: PhysAddr) -> Self {
        Self(state)
    }

    /// Values pushed so far, in execution order
    pub fn values(&self, mem: &SharedMemory) -> Vec<u32> {
        let count = mem.read(self.0);
        (0..count).map(|i| mem.read(self.0.add_words(1 + i))).collect()
    }
}

/// Upload a fresh copy of the [`Tally`] microcode
pub fn tally_microcode(mem: &SharedMemory) -> Microcode {
    let mut text = ENGINE_PROLOGUE.to_vec();
    text.extend_from_slice(&[Tally::SIGNATURE, 0, 0, 0]);

    let mut data = vec![0u32; 2 + Tally::STATE_WORDS as usize];
    data[0] = OVERLAY_DATA_ADDR + 8;
    data[1] = (Tally::STATE_WORDS * 4) << 16;

    match Microcode::upload(mem, &text, &data) {
        Ok(ucode) => ucode,
        Err(err) => panic!("cannot upload the tally microcode: {}", err),
    }
}
