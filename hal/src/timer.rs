//! # Clock and Watchdog
//!
//! Every host-side wait on the coprocessor is a bounded busy-poll. The bound
//! is measured with a monotonic [`Clock`]; [`Watchdog`] tracks one deadline.

use core::hint;

use crate::error::{HalError, HalResult};

/// Monotonic microsecond clock
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin
    fn now_us(&self) -> u64;
}

/// Deadline for a single bounded wait
#[derive(Debug)]
pub struct Watchdog<'a, K: Clock + ?Sized> {
    clock: &'a K,
    deadline: u64,
}

impl<'a, K: Clock + ?Sized> Watchdog<'a, K> {
    /// Arm a watchdog expiring `timeout_ms` from now
    pub fn start(clock: &'a K, timeout_ms: u32) -> Self {
        Self {
            clock,
            deadline: clock.now_us().saturating_add(timeout_ms as u64 * 1000),
        }
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        self.clock.now_us() > self.deadline
    }
}

/// Spin until `cond` holds or `timeout_ms` elapses
pub fn poll_until<K, F>(clock: &K, timeout_ms: u32, mut cond: F) -> HalResult<()>
where
    K: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let watchdog = Watchdog::start(clock, timeout_ms);
    loop {
        if cond() {
            return Ok(());
        }
        if watchdog.expired() {
            // One last look: the condition may have become true while the
            // clock was being read.
            return if cond() { Ok(()) } else { Err(HalError::Timeout) };
        }
        hint::spin_loop();
    }
}
