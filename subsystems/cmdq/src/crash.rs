//! # Crash Reports
//!
//! When a wait on the coprocessor exceeds its watchdog, the queue halts the
//! engine, collects its state and terminates. The report goes to the log at
//! error level and to an optional [`CrashSink`] (a console, a framebuffer).
//!
//! ```text
//! COPROCESSOR CRASH @ syncpoint wait
//! PC:0x0C0  STATUS:0x00000001
//! flags: | HALTED |
//! DMA: local=0x000 shared=0x100040 read=0x08f write=0x000
//! lowpri=0x100000 highpri=0x100800 current=0x10001c
//! overlay: slot 1
//! command window:
//! 0x0F8: 07000000 07000000 08001200 00000800 01000000 00000000 ...
//! ```

use alloc::boxed::Box;
use core::fmt::{self, Write};

use heapless::String;
use helix_hal::timer::poll_until;
use helix_hal::{Coprocessor, DmaRegisters, Status, WStatus};
use spin::Mutex;

use crate::layout::{
    COMMAND_WINDOW, COMMAND_WINDOW_WORDS, CURRENT_OVERLAY, DRAM_CURRENT_ADDR, DRAM_HIGHPRI_ADDR,
    DRAM_LOWPRI_ADDR,
};

/// Milliseconds to wait for the engine to acknowledge the halt
const HALT_TIMEOUT_MS: u32 = 10;

/// Longest line of a report; the flags line with every status bit set and
/// an unacknowledged halt is 158 characters
const LINE_CAPACITY: usize = 160;

// =============================================================================
// CRASH SINK
// =============================================================================

/// Destination for crash report lines
pub trait CrashSink: Send {
    /// Write one line of the report
    fn write_line(&mut self, line: &str);
}

/// Installed crash sink
static CRASH_SINK: Mutex<Option<Box<dyn CrashSink>>> = Mutex::new(None);

/// Install the sink crash reports are written to, returning the previous one
pub fn set_crash_sink(sink: Option<Box<dyn CrashSink>>) -> Option<Box<dyn CrashSink>> {
    core::mem::replace(&mut *CRASH_SINK.lock(), sink)
}

// =============================================================================
// CRASH REPORT
// =============================================================================

/// Snapshot of the engine taken after it was halted
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// Where the host was waiting
    pub site: heapless::String<32>,
    /// Status register after the halt
    pub status: Status,
    /// Whether the engine acknowledged the halt
    pub halted: bool,
    /// Program counter
    pub pc: u32,
    /// DMA registers
    pub dma: DmaRegisters,
    /// Resume address of the low-priority lane
    pub lowpri: u32,
    /// Resume address of the high-priority lane
    pub highpri: u32,
    /// Address being fetched
    pub current: u32,
    /// Descriptor slot of the last overlay that ran
    pub overlay: u32,
    /// Copy of the engine's command window
    pub window: [u32; COMMAND_WINDOW_WORDS],
}

impl CrashReport {
    /// Halt the engine and collect its state
    pub fn capture<C: Coprocessor + ?Sized>(coproc: &C, site: &str) -> Self {
        coproc.write_status(WStatus::SET_HALT);
        let clock = coproc.clock();
        let halted =
            poll_until(clock, HALT_TIMEOUT_MS, || coproc.status().contains(Status::HALTED)).is_ok();
        let dma_busy = Status::DMA_BUSY | Status::DMA_FULL;
        let _ = poll_until(clock, HALT_TIMEOUT_MS, || !coproc.status().intersects(dma_busy));

        let mut window = [0u32; COMMAND_WINDOW_WORDS];
        for (i, word) in window.iter_mut().enumerate() {
            *word = coproc.read_local(COMMAND_WINDOW + i);
        }

        let mut name = heapless::String::new();
        for ch in site.chars() {
            if name.push(ch).is_err() {
                break;
            }
        }

        Self {
            site: name,
            status: coproc.status(),
            halted,
            pc: coproc.program_counter(),
            dma: coproc.dma_registers(),
            lowpri: coproc.read_local(DRAM_LOWPRI_ADDR),
            highpri: coproc.read_local(DRAM_HIGHPRI_ADDR),
            current: coproc.read_local(DRAM_CURRENT_ADDR),
            overlay: coproc.read_local(CURRENT_OVERLAY),
            window,
        }
    }

    /// Render the report line by line
    pub fn for_each_line<F: FnMut(&str)>(&self, mut emit: F) {
        let mut line: String<LINE_CAPACITY> = String::new();
        let mut flush = |line: &mut String<LINE_CAPACITY>| {
            emit(line.as_str());
            line.clear();
        };

        let _ = write!(line, "COPROCESSOR CRASH @ {}", self.site);
        flush(&mut line);

        let _ = write!(line, "PC:0x{:03x}  STATUS:0x{:08x}", self.pc, self.status.bits());
        flush(&mut line);

        let _ = write!(line, "flags: |");
        for (name, _) in self.status.iter_names() {
            let _ = write!(line, " {} |", name);
        }
        if !self.halted {
            let _ = write!(line, " (halt not acknowledged)");
        }
        flush(&mut line);

        let _ = write!(
            line,
            "DMA: local=0x{:03x} shared=0x{:06x} read=0x{:03x} write=0x{:03x}",
            self.dma.local_addr, self.dma.shared_addr, self.dma.read_len, self.dma.write_len
        );
        flush(&mut line);

        let _ = write!(
            line,
            "lowpri=0x{:06x} highpri=0x{:06x} current=0x{:06x}",
            self.lowpri, self.highpri, self.current
        );
        flush(&mut line);

        let _ = write!(line, "overlay: slot {}", self.overlay);
        flush(&mut line);

        let _ = write!(line, "command window:");
        flush(&mut line);
        for (row, words) in self.window.chunks(8).enumerate() {
            let _ = write!(line, "0x{:03X}:", COMMAND_WINDOW + row * 8);
            for word in words {
                let _ = write!(line, " {:08x}", word);
            }
            flush(&mut line);
        }
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = Ok(());
        self.for_each_line(|line| {
            if result.is_ok() {
                result = writeln!(f, "{}", line);
            }
        });
        result
    }
}

/// Report a coprocessor crash and terminate
pub fn crash<C: Coprocessor + ?Sized>(coproc: &C, site: &str) -> ! {
    let report = CrashReport::capture(coproc, site);
    let mut sink = CRASH_SINK.lock();
    report.for_each_line(|line| {
        log::error!("{}", line);
        if let Some(sink) = sink.as_mut() {
            sink.write_line(line);
        }
    });
    drop(sink);

    panic!(
        "coprocessor crash @ {}: status {:#010x}, pc {:#05x}",
        site,
        report.status.bits(),
        report.pc
    );
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::ToString;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use super::*;
    use crate::sim;

    #[test]
    fn test_report_lists_status_flags() {
        let h = sim::harness(sim::test_config());
        let report = CrashReport::capture(&*h.sim, "unit test");
        assert!(report.halted);
        let text = report.to_string();
        assert!(text.starts_with("COPROCESSOR CRASH @ unit test\n"));
        assert!(text.contains("| HALTED |"));
        assert!(text.contains("command window:"));
        assert_eq!(text.lines().count(), 7 + COMMAND_WINDOW_WORDS / 8);
    }

    #[test]
    fn test_report_lists_every_flag() {
        let report = CrashReport {
            site: heapless::String::new(),
            status: Status::all(),
            halted: false,
            pc: 0,
            dma: DmaRegisters::default(),
            lowpri: 0,
            highpri: 0,
            current: 0,
            overlay: 0,
            window: [0; COMMAND_WINDOW_WORDS],
        };
        let text = report.to_string();
        let flags = text.lines().nth(2).unwrap();
        for (name, _) in Status::all().iter_names() {
            assert!(flags.contains(&alloc::format!(" {} |", name)), "{} missing", name);
        }
        assert!(flags.ends_with("| SIG7 | (halt not acknowledged)"));
    }

    #[test]
    fn test_report_site_is_truncated() {
        let h = sim::harness(sim::test_config());
        let site = "x".repeat(100);
        let report = CrashReport::capture(&*h.sim, &site);
        assert_eq!(report.site.len(), 32);
    }

    #[test]
    #[should_panic(expected = "coprocessor crash @ syncpoint wait")]
    fn test_watchdog_expiry_crashes() {
        let config = crate::QueueConfig { watchdog_ms: 20, ..sim::test_config() };
        let mut h = sim::harness(config);
        h.sim.set_paused(true);
        h.queue.wait_idle();
    }

    #[test]
    fn test_sink_receives_lines() {
        struct Collect(Arc<spin::Mutex<Vec<std::string::String>>>);
        impl CrashSink for Collect {
            fn write_line(&mut self, line: &str) {
                self.0.lock().push(line.to_string());
            }
        }

        let h = sim::harness(sim::test_config());
        let report = CrashReport::capture(&*h.sim, "sink");
        let lines = Arc::new(spin::Mutex::new(Vec::new()));
        let mut sink = Collect(lines.clone());
        report.for_each_line(|line| sink.write_line(line));
        assert_eq!(lines.lock()[0], "COPROCESSOR CRASH @ sink");
    }
}
