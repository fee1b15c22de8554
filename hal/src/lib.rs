//! # Helix HAL - Coprocessor Seams
//!
//! Hardware abstraction for an autonomous vector coprocessor that executes
//! command streams out of memory shared with the host CPU.
//!
//! ```text
//! ┌──────────────────────┐        status register        ┌──────────────────┐
//! │        Host CPU      │ ◄───────────────────────────► │   Coprocessor    │
//! │  (command producer)  │   SIGn / HALT / BROKE / INTR  │  (queue engine)  │
//! └──────────┬───────────┘                               └────────┬─────────┘
//!            │ writes commands                         fetches / DMA │
//!            ▼                                                        ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     SharedMemory (24-bit physical)                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The crate only describes the seams: the status register bit layout
//! ([`status`]), the [`Coprocessor`] trait a driver or model implements,
//! shared memory with its address translation ([`memory`]), a monotonic
//! [`Clock`] for watchdogs ([`timer`]) and ordering [`barrier`]s.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod barrier;
pub mod coproc;
pub mod error;
pub mod memory;
pub mod status;
pub mod timer;

pub use coproc::{Coprocessor, DmaRegisters, InterruptHandler};
pub use error::{HalError, HalResult};
pub use memory::{PhysAddr, Region, SharedMemory};
pub use status::{Signal, Status, WStatus};
pub use timer::{Clock, Watchdog};
