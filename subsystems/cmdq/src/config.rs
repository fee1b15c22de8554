//! # Queue Configuration
//!
//! Tunable sizes live in [`QueueConfig`]; protocol limits shared with the
//! queue engine are compile-time constants.

use static_assertions::const_assert;

use crate::error::{CmdqError, Result};

// =============================================================================
// PROTOCOL LIMITS
// =============================================================================

/// Number of overlay ids (the top nibble of an opcode)
pub const OVERLAY_TABLE_SIZE: usize = 16;

/// Maximum number of distinct overlay descriptors, including the internal one
pub const MAX_OVERLAY_COUNT: usize = 8;

/// Maximum nesting level of block calls
pub const MAX_BLOCK_NESTING_LEVEL: u32 = 8;

/// Call stack slot holding the low-priority return address
pub const LOWPRI_CALL_SLOT: u32 = MAX_BLOCK_NESTING_LEVEL;

/// Call stack slot holding the high-priority resume address
pub const HIGHPRI_CALL_SLOT: u32 = MAX_BLOCK_NESTING_LEVEL + 1;

/// Smallest allowed maximum command size, above the 4-word internal DMA command
pub const MIN_COMMAND_WORDS: u32 = 8;

/// Largest allowed maximum command size
pub const MAX_COMMAND_WORDS: usize = 64;

/// Default watchdog for every bounded wait
pub const DEFAULT_WATCHDOG_MS: u32 = 50;

const_assert!(MAX_OVERLAY_COUNT <= OVERLAY_TABLE_SIZE);
const_assert!(OVERLAY_TABLE_SIZE <= 16);
const_assert!(MIN_COMMAND_WORDS as usize <= MAX_COMMAND_WORDS);

// =============================================================================
// QUEUE CONFIGURATION
// =============================================================================

/// Command queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Size of each low-priority ring buffer, in words
    pub lowpri_buffer_words: u32,
    /// Size of each high-priority ring buffer, in words
    pub highpri_buffer_words: u32,
    /// Largest command a producer may reserve, in words
    pub max_command_words: u32,
    /// Size of the first chunk of a block, in words
    pub block_min_words: u32,
    /// Cap on the size of block chunks, in words
    pub block_max_words: u32,
    /// Watchdog for waits on the coprocessor, in milliseconds
    pub watchdog_ms: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lowpri_buffer_words: 0x400,
            highpri_buffer_words: 0x80,
            max_command_words: 16,
            block_min_words: 64,
            block_max_words: 4096,
            watchdog_ms: DEFAULT_WATCHDOG_MS,
        }
    }
}

impl QueueConfig {
    /// Check the configuration against the protocol limits
    pub fn validate(&self) -> Result<()> {
        let max = self.max_command_words;
        if max < MIN_COMMAND_WORDS || max as usize > MAX_COMMAND_WORDS {
            return Err(CmdqError::InvalidConfig("max_command_words out of range"));
        }
        // A full command must always fit a freshly switched buffer, ahead of
        // the sentinel.
        if self.lowpri_buffer_words < 2 * max || self.highpri_buffer_words < 2 * max {
            return Err(CmdqError::InvalidConfig("ring buffer smaller than two commands"));
        }
        if self.lowpri_buffer_words % 2 != 0 || self.highpri_buffer_words % 2 != 0 {
            return Err(CmdqError::InvalidConfig("ring buffer size must be even"));
        }
        if self.block_min_words < 2 * max {
            return Err(CmdqError::InvalidConfig("block chunk smaller than two commands"));
        }
        if self.block_max_words < self.block_min_words {
            return Err(CmdqError::InvalidConfig("block_max_words below block_min_words"));
        }
        if self.watchdog_ms == 0 {
            return Err(CmdqError::InvalidConfig("watchdog must be non-zero"));
        }
        Ok(())
    }

    /// Size of the chunk following one of `words` words
    pub fn next_chunk_words(&self, words: u32) -> u32 {
        if words < self.block_max_words {
            (words * 2).min(self.block_max_words)
        } else {
            words
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(QueueConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_small_command_window() {
        let config = QueueConfig { max_command_words: 4, ..Default::default() };
        assert!(matches!(config.validate(), Err(CmdqError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_tiny_buffers() {
        let config = QueueConfig { highpri_buffer_words: 24, ..Default::default() };
        assert!(config.validate().is_err());
        let config = QueueConfig { block_min_words: 16, ..Default::default() };
        assert!(config.validate().is_err());
        let config = QueueConfig { block_max_words: 32, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_growth_is_capped() {
        let config = QueueConfig { block_min_words: 64, block_max_words: 200, ..Default::default() };
        assert_eq!(config.next_chunk_words(64), 128);
        assert_eq!(config.next_chunk_words(128), 200);
        assert_eq!(config.next_chunk_words(200), 200);
    }
}
