//! # Local Memory Layout
//!
//! Word offsets of the queue engine's state in coprocessor-local memory,
//! and the assignment of status signals to protocol roles.
//!
//! ```text
//! word
//! 0x000  ┌──────────────────────────────┐
//!        │ overlay table (16 x u8)      │  4 words
//! 0x004  ├──────────────────────────────┤
//!        │ overlay descriptors (8 x 4)  │  32 words
//! 0x024  ├──────────────────────────────┤
//!        │ call stack (nesting + 2)     │  10 words
//! 0x02E  ├──────────────────────────────┤
//!        │ lowpri / highpri / current   │  shared memory addresses
//!        │ current overlay              │
//!        │ priority check mask          │
//! 0x033  ├──────────────────────────────┤
//!        :                              :
//! 0x0F8  ├──────────────────────────────┤
//!        │ command window (64 words)    │  last fetched commands
//! 0x138  ├──────────────────────────────┤
//!        :                              :
//! 0x180  ├──────────────────────────────┤
//!        │ overlay data                 │
//!        └──────────────────────────────┘
//! ```
//!
//! The first [`TABLES_WORDS`] words mirror the overlay tables kept in
//! shared memory and are refreshed with a queued DMA on every registration.

use helix_hal::{PhysAddr, Signal};
use static_assertions::const_assert;

use crate::config::{MAX_BLOCK_NESTING_LEVEL, MAX_OVERLAY_COUNT, OVERLAY_TABLE_SIZE};

// =============================================================================
// OFFSETS
// =============================================================================

/// Overlay id to descriptor slot table
pub const OVERLAY_TABLE: usize = 0;
/// Descriptor array
pub const OVERLAY_DESCRIPTORS: usize = OVERLAY_TABLE + OVERLAY_TABLE_SIZE / 4;
/// Size of the tables mirrored from shared memory
pub const TABLES_WORDS: usize = OVERLAY_DESCRIPTORS + MAX_OVERLAY_COUNT * OverlayDescriptor::WORDS;
/// Return addresses of block calls, plus the two lane slots
pub const POINTER_STACK: usize = TABLES_WORDS;
/// Number of call stack slots
pub const POINTER_STACK_SLOTS: usize = MAX_BLOCK_NESTING_LEVEL as usize + 2;
/// Address the low-priority lane resumes at
pub const DRAM_LOWPRI_ADDR: usize = POINTER_STACK + POINTER_STACK_SLOTS;
/// Address the high-priority lane resumes at
pub const DRAM_HIGHPRI_ADDR: usize = DRAM_LOWPRI_ADDR + 1;
/// Address of the command being fetched
pub const DRAM_CURRENT_ADDR: usize = DRAM_HIGHPRI_ADDR + 1;
/// Descriptor slot of the last overlay that executed
pub const CURRENT_OVERLAY: usize = DRAM_CURRENT_ADDR + 1;
/// Status bits that trigger a switch to the high-priority lane
pub const PRIMODE_STATUS_CHECK: usize = CURRENT_OVERLAY + 1;
/// Size of the engine state uploaded at start
pub const HEADER_WORDS: usize = PRIMODE_STATUS_CHECK + 1;

/// Copy of the most recently fetched commands
pub const COMMAND_WINDOW: usize = 0xF8;
/// Size of the command window
pub const COMMAND_WINDOW_WORDS: usize = 64;

/// Byte offset where overlay data is loaded
pub const OVERLAY_DATA_ADDR: u32 = 0x600;

/// Local memory size in words
pub const LOCAL_WORDS: usize = 1024;

const_assert!(OVERLAY_TABLE_SIZE % 4 == 0);
const_assert!(HEADER_WORDS <= COMMAND_WINDOW);
const_assert!(COMMAND_WINDOW + COMMAND_WINDOW_WORDS <= (OVERLAY_DATA_ADDR / 4) as usize);
const_assert!(((OVERLAY_DATA_ADDR / 4) as usize) < LOCAL_WORDS);

// =============================================================================
// SIGNALS
// =============================================================================

/// Assignment of status signals to protocol roles
pub mod signals {
    use helix_hal::Signal;

    /// Free for producers
    pub const USER0: Signal = Signal::new(0);
    /// Free for producers
    pub const USER1: Signal = Signal::new(1);
    /// The engine is executing the high-priority lane
    pub const HIGHPRI_RUNNING: Signal = Signal::new(2);
    /// High-priority lane finished its previous buffer
    pub const BUFDONE_HIGHPRI: Signal = Signal::new(3);
    /// A syncpoint was reached and not yet acknowledged
    pub const SYNCPOINT: Signal = Signal::new(4);
    /// Low-priority lane finished its previous buffer
    pub const BUFDONE_LOWPRI: Signal = Signal::new(5);
    /// The host requests a switch to the high-priority lane
    pub const HIGHPRI_REQUESTED: Signal = Signal::new(6);
    /// New commands were written since the engine last fetched
    pub const MORE: Signal = Signal::new(7);
}

/// Signal a lane waits on before reusing a buffer
pub const fn bufdone_signal(highpri: bool) -> Signal {
    if highpri {
        signals::BUFDONE_HIGHPRI
    } else {
        signals::BUFDONE_LOWPRI
    }
}

// =============================================================================
// OVERLAY TABLES
// =============================================================================

/// Where and how large an overlay's code, data and state are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayDescriptor {
    /// Code address (past the shared engine prologue)
    pub code: PhysAddr,
    /// Data segment address
    pub data: PhysAddr,
    /// State buffer address
    pub state: PhysAddr,
    /// Code size in bytes, minus one
    pub code_size: u16,
    /// Data size in bytes, minus one
    pub data_size: u16,
}

impl OverlayDescriptor {
    /// Encoded size in words
    pub const WORDS: usize = 4;

    /// Encode for local memory
    pub fn encode(&self) -> [u32; Self::WORDS] {
        [
            self.code.raw(),
            self.data.raw(),
            self.state.raw(),
            ((self.code_size as u32) << 16) | self.data_size as u32,
        ]
    }

    /// Decode from local memory
    pub fn decode(words: &[u32]) -> Self {
        Self {
            code: PhysAddr::new(words[0]),
            data: PhysAddr::new(words[1]),
            state: PhysAddr::new(words[2]),
            code_size: (words[3] >> 16) as u16,
            data_size: words[3] as u16,
        }
    }
}

/// Byte shift of table entry `id` inside its word (entries are big-endian)
#[inline]
const fn entry_shift(id: usize) -> u32 {
    24 - 8 * (id % 4) as u32
}

/// Read overlay table entry `id` from the table words
pub fn table_entry(table: &[u32], id: usize) -> u8 {
    (table[OVERLAY_TABLE + id / 4] >> entry_shift(id)) as u8
}

/// Store overlay table entry `id` into the table words
pub fn set_table_entry(table: &mut [u32], id: usize, slot: u8) {
    let word = &mut table[OVERLAY_TABLE + id / 4];
    let shift = entry_shift(id);
    *word = (*word & !(0xFF << shift)) | ((slot as u32) << shift);
}
