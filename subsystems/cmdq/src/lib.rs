//! # Helix Command Queue
//!
//! Streams commands from the host CPU to an autonomous coprocessor through
//! ring buffers in shared memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Command Queue                              │
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐   │
//! │  │   Producer   │   │ low priority │   │                      │   │
//! │  │ reserve/     │──▶│ 2 x ring buf │──▶│                      │   │
//! │  │ commit/write │   └──────────────┘   │    Queue engine      │   │
//! │  └──────┬───────┘   ┌──────────────┐   │  (on coprocessor)    │   │
//! │         │           │ high priority│──▶│                      │   │
//! │         │           │ 2 x ring buf │   │  fetch / dispatch    │   │
//! │         │           └──────────────┘   │  overlays / DMA      │   │
//! │         │           ┌──────────────┐   │                      │   │
//! │         └──────────▶│ block chunks │──▶│                      │   │
//! │                     └──────────────┘   └──────────┬───────────┘   │
//! │                                                   │ SIG_SYNCPOINT │
//! │  ┌──────────────┐                                 ▼ + interrupt   │
//! │  │ Syncpoints   │◀──────────────── SyncpointCounter               │
//! │  └──────────────┘                                                 │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! 1. [`CommandQueue::init`] claims the coprocessor, allocates both lanes and
//!    starts the engine
//! 2. Producers enqueue commands; [`CommandQueue::flush`] wakes the engine
//! 3. Syncpoints track completion; blocks record replayable sequences
//! 4. [`CommandQueue::close`] drains the queue and releases everything

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "sim"))]
extern crate std;

pub mod block;
pub mod config;
pub(crate) mod context;
pub mod crash;
pub mod error;
pub mod highpri;
pub mod layout;
pub mod opcode;
pub mod overlay;
pub mod queue;
pub mod syncpoint;
pub mod writer;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports
pub use block::Block;
pub use config::QueueConfig;
pub use crash::{set_crash_sink, CrashReport, CrashSink};
pub use error::{CmdqError, Result};
pub use opcode::Opcode;
pub use overlay::{Microcode, OverlayHeader};
pub use queue::{CommandQueue, QueueStats};
pub use syncpoint::{Syncpoint, SyncpointCounter};
pub use writer::CommandWriter;
