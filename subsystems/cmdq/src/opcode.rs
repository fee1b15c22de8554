//! # Command Wire Format
//!
//! Commands are sequences of 32-bit words. The top byte of the first word is
//! the opcode; its high nibble selects the overlay and its low nibble the
//! command inside that overlay. The remaining 24 bits are payload.
//!
//! ```text
//!  31      28 27      24 23                                   0
//! ┌──────────┬──────────┬──────────────────────────────────────┐
//! │ overlay  │ command  │               payload                │
//! └──────────┴──────────┴──────────────────────────────────────┘
//! ```
//!
//! Overlay 0 is the queue engine itself. A word whose opcode is zero is
//! memory the host has not written yet; the engine treats it like the IDLE
//! terminator and refetches.

use core::fmt;

use helix_hal::memory::ADDR_MASK;
use helix_hal::{PhysAddr, Status};

/// Mask of the payload bits of a command word
pub const PAYLOAD_MASK: u32 = 0x00FF_FFFF;

// =============================================================================
// INTERNAL OPCODES
// =============================================================================

/// Commands implemented by the queue engine itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Terminator: nothing more to execute for now
    Idle = 0x01,
    /// Write the status register with the payload mask
    SetStatus = 0x02,
    /// Push the return address into a call slot and jump
    Call = 0x03,
    /// Continue fetching at the payload address
    Jump = 0x04,
    /// Continue at the address stored in a call slot
    Ret = 0x05,
    /// Exchange the current stream with the one in a call slot
    SwapBuffers = 0x06,
    /// Do nothing
    Noop = 0x07,
    /// Wait for status bits to clear, then write the status register
    TasStatus = 0x08,
    /// Transfer between shared and local memory
    Dma = 0x09,
}

impl Opcode {
    /// Decode an internal opcode byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::Idle,
            0x02 => Self::SetStatus,
            0x03 => Self::Call,
            0x04 => Self::Jump,
            0x05 => Self::Ret,
            0x06 => Self::SwapBuffers,
            0x07 => Self::Noop,
            0x08 => Self::TasStatus,
            0x09 => Self::Dma,
            _ => return None,
        })
    }

    /// Decode the opcode of a command's first word
    pub const fn from_word(word: u32) -> Option<Self> {
        Self::from_byte(opcode_of(word))
    }

    /// Command length in words
    pub const fn words(self) -> u32 {
        match self {
            Self::Idle | Self::SetStatus | Self::Jump | Self::Ret | Self::Noop => 1,
            Self::Call | Self::TasStatus => 2,
            Self::SwapBuffers => 3,
            Self::Dma => 4,
        }
    }

    /// First word of this command with the given payload
    pub const fn word(self, payload: u32) -> u32 {
        ((self as u32) << 24) | (payload & PAYLOAD_MASK)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::SetStatus => "SET_STATUS",
            Self::Call => "CALL",
            Self::Jump => "JUMP",
            Self::Ret => "RET",
            Self::SwapBuffers => "SWAP_BUFFERS",
            Self::Noop => "NOOP",
            Self::TasStatus => "TAS_STATUS",
            Self::Dma => "DMA",
        };
        f.write_str(name)
    }
}

/// The IDLE terminator word that always follows the last written command
pub const TERMINATOR: u32 = Opcode::Idle.word(0);

// =============================================================================
// WORD HELPERS
// =============================================================================

/// Opcode byte of a command word
#[inline]
pub const fn opcode_of(word: u32) -> u8 {
    (word >> 24) as u8
}

/// Overlay id of an opcode byte
#[inline]
pub const fn overlay_of(opcode: u8) -> u8 {
    opcode >> 4
}

/// Command index of an opcode byte
#[inline]
pub const fn command_of(opcode: u8) -> u8 {
    opcode & 0x0F
}

/// Whether a word stops the engine (terminator or unwritten memory)
#[inline]
pub const fn is_idle(word: u32) -> bool {
    matches!(opcode_of(word), 0x00 | 0x01)
}

/// Encode a call stack slot operand
#[inline]
pub const fn slot(n: u32) -> u32 {
    n << 2
}

/// Decode a call stack slot operand
#[inline]
pub const fn slot_index(operand: u32) -> u32 {
    (operand & PAYLOAD_MASK) >> 2
}

/// Address payload, asserting it fits 24 bits
#[inline]
pub fn addr_payload(addr: PhysAddr) -> u32 {
    assert!(addr.fits_payload(), "address {} does not fit a command payload", addr);
    addr.raw() & ADDR_MASK
}

// =============================================================================
// DMA FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Flags word of a DMA command
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// Wait until the DMA engine is idle after the transfer
        const WAIT_BUSY = Status::DMA_BUSY.bits();
        /// Wait until the DMA queue has room after the transfer
        const WAIT_FULL = Status::DMA_FULL.bits();
        /// Transfer from local memory out to shared memory
        const TO_SHARED = 0xFFFF_8000;
    }
}

impl DmaFlags {
    /// Flags for a synchronous transfer
    pub const WAIT_IDLE: Self = Self::WAIT_BUSY.union(Self::WAIT_FULL);

    /// Whether the transfer writes shared memory
    pub fn is_outbound(self) -> bool {
        self.bits() & 0x8000 != 0
    }
}
