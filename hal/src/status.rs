//! # Coprocessor Status Register
//!
//! The status register is read and written through two different layouts.
//! Reads return [`Status`]; writes take [`WStatus`], where every stateful bit
//! has a dedicated "set" and "clear" bit so that host and coprocessor can
//! update disjoint bits without a read-modify-write race.
//!
//! ```text
//! read  : ...  SIG7 .. SIG0 | INTR_BREAK SSTEP IO_FULL DMA_FULL DMA_BUSY BROKE HALTED
//!              14       7     6          5     4       3        2        1     0
//! write : ...  SET_SIG7 CLR_SIG7 .. SET_SIG0 CLR_SIG0 | SET/CLR INTR_BREAK, SSTEP,
//!              24       23          10       9          INTR, BROKE, HALT
//! ```

use static_assertions::const_assert_eq;

// =============================================================================
// READ LAYOUT
// =============================================================================

bitflags::bitflags! {
    /// Status register as read back from the coprocessor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Status: u32 {
        /// Coprocessor is halted
        const HALTED = 1 << 0;
        /// Coprocessor executed a break instruction
        const BROKE = 1 << 1;
        /// A DMA transfer is in progress
        const DMA_BUSY = 1 << 2;
        /// The DMA queue is full
        const DMA_FULL = 1 << 3;
        /// IO is full
        const IO_FULL = 1 << 4;
        /// Single-step mode
        const SSTEP = 1 << 5;
        /// Raise an interrupt when a break is executed
        const INTR_BREAK = 1 << 6;
        /// Signal 0
        const SIG0 = 1 << 7;
        /// Signal 1
        const SIG1 = 1 << 8;
        /// Signal 2
        const SIG2 = 1 << 9;
        /// Signal 3
        const SIG3 = 1 << 10;
        /// Signal 4
        const SIG4 = 1 << 11;
        /// Signal 5
        const SIG5 = 1 << 12;
        /// Signal 6
        const SIG6 = 1 << 13;
        /// Signal 7
        const SIG7 = 1 << 14;
    }
}

// =============================================================================
// WRITE LAYOUT
// =============================================================================

bitflags::bitflags! {
    /// Status register write mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WStatus: u32 {
        /// Resume execution
        const CLEAR_HALT = 1 << 0;
        /// Stop execution
        const SET_HALT = 1 << 1;
        /// Clear the break flag
        const CLEAR_BROKE = 1 << 2;
        /// Acknowledge the coprocessor interrupt
        const CLEAR_INTR = 1 << 3;
        /// Raise the coprocessor interrupt
        const SET_INTR = 1 << 4;
        /// Leave single-step mode
        const CLEAR_SSTEP = 1 << 5;
        /// Enter single-step mode
        const SET_SSTEP = 1 << 6;
        /// Do not interrupt on break
        const CLEAR_INTR_BREAK = 1 << 7;
        /// Interrupt on break
        const SET_INTR_BREAK = 1 << 8;
        /// Clear signal 0
        const CLEAR_SIG0 = 1 << 9;
        /// Set signal 0
        const SET_SIG0 = 1 << 10;
        /// Clear signal 1
        const CLEAR_SIG1 = 1 << 11;
        /// Set signal 1
        const SET_SIG1 = 1 << 12;
        /// Clear signal 2
        const CLEAR_SIG2 = 1 << 13;
        /// Set signal 2
        const SET_SIG2 = 1 << 14;
        /// Clear signal 3
        const CLEAR_SIG3 = 1 << 15;
        /// Set signal 3
        const SET_SIG3 = 1 << 16;
        /// Clear signal 4
        const CLEAR_SIG4 = 1 << 17;
        /// Set signal 4
        const SET_SIG4 = 1 << 18;
        /// Clear signal 5
        const CLEAR_SIG5 = 1 << 19;
        /// Set signal 5
        const SET_SIG5 = 1 << 20;
        /// Clear signal 6
        const CLEAR_SIG6 = 1 << 21;
        /// Set signal 6
        const SET_SIG6 = 1 << 22;
        /// Clear signal 7
        const CLEAR_SIG7 = 1 << 23;
        /// Set signal 7
        const SET_SIG7 = 1 << 24;
    }
}

// Every write mask must fit a 24-bit command payload.
const_assert_eq!(WStatus::all().bits() >> 25, 0);

/// Pairs of (clear, set, affected) bits for the stateful part of the register
const TRANSITIONS: [(WStatus, WStatus, Status); 12] = [
    (WStatus::CLEAR_HALT, WStatus::SET_HALT, Status::HALTED),
    (WStatus::CLEAR_BROKE, WStatus::empty(), Status::BROKE),
    (WStatus::CLEAR_SSTEP, WStatus::SET_SSTEP, Status::SSTEP),
    (WStatus::CLEAR_INTR_BREAK, WStatus::SET_INTR_BREAK, Status::INTR_BREAK),
    (WStatus::CLEAR_SIG0, WStatus::SET_SIG0, Status::SIG0),
    (WStatus::CLEAR_SIG1, WStatus::SET_SIG1, Status::SIG1),
    (WStatus::CLEAR_SIG2, WStatus::SET_SIG2, Status::SIG2),
    (WStatus::CLEAR_SIG3, WStatus::SET_SIG3, Status::SIG3),
    (WStatus::CLEAR_SIG4, WStatus::SET_SIG4, Status::SIG4),
    (WStatus::CLEAR_SIG5, WStatus::SET_SIG5, Status::SIG5),
    (WStatus::CLEAR_SIG6, WStatus::SET_SIG6, Status::SIG6),
    (WStatus::CLEAR_SIG7, WStatus::SET_SIG7, Status::SIG7),
];

impl Status {
    /// Apply a write mask to this status value.
    ///
    /// A bit with both its set and clear request present is left untouched.
    /// The interrupt line bits of `w` do not live in the status register and
    /// are ignored here.
    pub fn apply(self, w: WStatus) -> Status {
        let mut out = self;
        for (clear, set, bit) in TRANSITIONS {
            match (w.contains(clear), !set.is_empty() && w.contains(set)) {
                (true, false) => out.remove(bit),
                (false, true) => out.insert(bit),
                _ => {},
            }
        }
        out
    }
}

// =============================================================================
// SIGNALS
// =============================================================================

/// One of the eight general purpose signal bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(u8);

impl Signal {
    /// Create a signal handle; `n` must be below 8
    pub const fn new(n: u8) -> Self {
        assert!(n < 8, "signal index out of range");
        Self(n)
    }

    /// Signal index
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Bit in the read layout
    pub const fn status(self) -> Status {
        Status::from_bits_retain(1 << (7 + self.0 as u32))
    }

    /// Write mask that sets this signal
    pub const fn set(self) -> WStatus {
        WStatus::from_bits_retain(1 << (10 + 2 * self.0 as u32))
    }

    /// Write mask that clears this signal
    pub const fn clear(self) -> WStatus {
        WStatus::from_bits_retain(1 << (9 + 2 * self.0 as u32))
    }
}
