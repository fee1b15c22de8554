//! # Command Writer
//!
//! A [`CommandWriter`] is an open reservation of up to `n` words at the
//! cursor of the current lane. Words are staged locally and published on
//! commit: the payload first, then the trailing terminator, and the opcode
//! word last with release ordering.

use arrayvec::ArrayVec;
use helix_hal::Coprocessor;

use crate::config::MAX_COMMAND_WORDS;
use crate::opcode::opcode_of;
use crate::queue::CommandQueue;

/// Open reservation in the command stream
///
/// Dropping a writer that holds words commits them; dropping an empty one
/// abandons the reservation.
pub struct CommandWriter<'q, C: Coprocessor> {
    queue: &'q mut CommandQueue<C>,
    words: ArrayVec<u32, MAX_COMMAND_WORDS>,
    reserved: u32,
    done: bool,
}

impl<C: Coprocessor> core::fmt::Debug for CommandWriter<'_, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandWriter")
            .field("words", &self.words.as_slice())
            .field("reserved", &self.reserved)
            .finish()
    }
}

impl<'q, C: Coprocessor> CommandWriter<'q, C> {
    pub(crate) fn new(queue: &'q mut CommandQueue<C>, reserved: u32) -> Self {
        Self {
            queue,
            words: ArrayVec::new(),
            reserved,
            done: false,
        }
    }

    /// Append one word
    pub fn push(&mut self, word: u32) -> &mut Self {
        assert!(
            (self.words.len() as u32) < self.reserved,
            "write past the end of a {}-word reservation",
            self.reserved
        );
        self.words.push(word);
        self
    }

    /// Append several words
    pub fn extend(&mut self, words: &[u32]) -> &mut Self {
        for &word in words {
            self.push(word);
        }
        self
    }

    /// Words written so far
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Words still available in the reservation
    pub fn remaining(&self) -> u32 {
        self.reserved - self.words.len() as u32
    }

    /// Publish the command and advance the cursor
    pub fn commit(mut self) {
        assert!(!self.words.is_empty(), "committed an empty command");
        self.publish();
    }

    fn publish(&mut self) {
        self.done = true;
        assert!(
            opcode_of(self.words[0]) != 0,
            "command word {:#010x} has a null opcode",
            self.words[0]
        );
        let queue = &mut *self.queue;
        queue.current.append(&queue.mem, &self.words);
    }
}

impl<C: Coprocessor> Drop for CommandWriter<'_, C> {
    fn drop(&mut self) {
        if !self.done && !self.words.is_empty() {
            self.publish();
        }
    }
}
