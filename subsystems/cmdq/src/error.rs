//! # Command Queue Errors
//!
//! Only construction-time failures are reported through [`Result`]. Misuse of
//! the queue (wrong mode, oversized commands, unregistered overlays) is a
//! logic bug and panics with a diagnostic; a coprocessor that stops
//! responding produces a crash report.

use core::fmt;

use helix_hal::HalError;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Command queue Result type alias
pub type Result<T> = core::result::Result<T, CmdqError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Command queue error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CmdqError {
    /// Another queue already owns this coprocessor
    AlreadyInitialized,
    /// Configuration rejected by [`QueueConfig::validate`](crate::QueueConfig::validate)
    InvalidConfig(&'static str),
    /// Microcode image is malformed
    InvalidMicrocode(&'static str),
    /// Hardware layer error
    Hal(HalError),
}

impl fmt::Display for CmdqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "command queue already initialized"),
            Self::InvalidConfig(why) => write!(f, "invalid queue configuration: {}", why),
            Self::InvalidMicrocode(why) => write!(f, "invalid microcode: {}", why),
            Self::Hal(err) => write!(f, "hal: {}", err),
        }
    }
}

impl From<HalError> for CmdqError {
    fn from(err: HalError) -> Self {
        Self::Hal(err)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;

    use super::*;

    #[test]
    fn test_hal_error_converts() {
        let err: CmdqError = HalError::OutOfMemory { words: 16 }.into();
        assert_eq!(err, CmdqError::Hal(HalError::OutOfMemory { words: 16 }));
        assert_eq!(err.to_string(), "hal: out of shared memory (16 words requested)");
    }
}
