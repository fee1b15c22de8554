//! # HAL Error Handling
//!
//! Errors raised at the hardware seams. They are `no_std` and `Copy` so they
//! can travel through interrupt paths without allocation.

use core::fmt;

use crate::memory::PhysAddr;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// HAL Result type alias
pub type HalResult<T> = core::result::Result<T, HalError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// HAL error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HalError {
    /// Shared memory cannot satisfy an allocation of this many words
    OutOfMemory {
        /// Requested size in words
        words: u32,
    },
    /// Address does not belong to the shared memory arena
    InvalidAddress(PhysAddr),
    /// Address is not aligned for the requested access
    MisalignedAddress(PhysAddr),
    /// Address was not returned by a previous allocation
    NotAllocated(PhysAddr),
    /// Arena does not fit the coprocessor's 24-bit address space
    ArenaTooLarge,
    /// A polled condition did not become true before its deadline
    Timeout,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { words } => {
                write!(f, "out of shared memory ({} words requested)", words)
            },
            Self::InvalidAddress(addr) => write!(f, "invalid shared memory address {}", addr),
            Self::MisalignedAddress(addr) => write!(f, "misaligned address {}", addr),
            Self::NotAllocated(addr) => write!(f, "address {} is not an allocation", addr),
            Self::ArenaTooLarge => write!(f, "arena exceeds the 24-bit address space"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;

    use super::*;

    #[test]
    fn test_display_mentions_address() {
        let msg = HalError::NotAllocated(PhysAddr::new(0x1234)).to_string();
        assert!(msg.contains("0x001234"));
    }

    #[test]
    fn test_display_out_of_memory() {
        let msg = HalError::OutOfMemory { words: 64 }.to_string();
        assert_eq!(msg, "out of shared memory (64 words requested)");
    }
}
