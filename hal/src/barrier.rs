//! # Memory Barriers
//!
//! Ordering primitives between host writes to shared memory and the
//! coprocessor. Shared memory words are atomics, so the portable fences are
//! always issued; the status register is a device register and needs the
//! architecture barrier before it is written.

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Compiler fence (prevents reordering)
#[inline(always)]
pub fn compiler() {
    compiler_fence(Ordering::SeqCst);
}

/// Order all previous shared memory stores before any later store
#[inline(always)]
pub fn write() {
    fence(Ordering::Release);
}

/// Full barrier
#[inline(always)]
pub fn full() {
    fence(Ordering::SeqCst);
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        /// Barrier before a status register write
        #[inline(always)]
        pub fn mmio_write() {
            // Stores retire in program order on x86.
            compiler();
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Barrier before a status register write
        #[inline(always)]
        pub fn mmio_write() {
            full();
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dmb st", options(nostack, preserves_flags));
            }
        }
    } else {
        /// Barrier before a status register write
        #[inline(always)]
        pub fn mmio_write() {
            full();
        }
    }
}
