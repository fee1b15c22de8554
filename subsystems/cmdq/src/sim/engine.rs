//! Engine thread of the software coprocessor.
//!
//! Fetches commands through a small window, with one word of lookahead past
//! the command being executed. A multi-word command is executed only if its
//! first word is still in memory after the arguments were read; otherwise
//! the window is refetched.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use helix_hal::{PhysAddr, Status, WStatus};

use super::{OverlayContext, OverlayProgram, SimShared};
use crate::config::{HIGHPRI_CALL_SLOT, LOWPRI_CALL_SLOT, MAX_OVERLAY_COUNT};
use crate::layout::{self, signals, table_entry, OverlayDescriptor};
use crate::opcode::{
    command_of, is_idle, opcode_of, overlay_of, slot_index, DmaFlags, Opcode, PAYLOAD_MASK,
};

/// Words fetched at once
const WINDOW_WORDS: usize = 16;

/// Sleep while halted, cut short by an unpark
const HALTED_PARK: Duration = Duration::from_micros(500);

/// Sleep while paused
const PAUSED_SLEEP: Duration = Duration::from_micros(100);

/// Program counter reported while dispatching internal commands
const DISPATCH_PC: u32 = 0x0C0;

/// Program counter reported while running overlay code
const OVERLAY_PC: u32 = 0x400;

/// Reason the engine broke
#[derive(Debug)]
enum Fault {
    UnknownOpcode(u32),
    UnregisteredOverlay(u8),
    MissingProgram(u32),
    BadAddress(PhysAddr),
    BadSlot(u32),
    LocalOverflow { offset: u32, len: u32 },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(word) => write!(f, "unknown command {:#010x}", word),
            Self::UnregisteredOverlay(id) => write!(f, "overlay {:#x} is not in the table", id),
            Self::MissingProgram(sig) => write!(f, "no overlay program with signature {:#010x}", sig),
            Self::BadAddress(addr) => write!(f, "fetch outside shared memory at {}", addr),
            Self::BadSlot(slot) => write!(f, "call stack slot {} out of range", slot),
            Self::LocalOverflow { offset, len } => {
                write!(f, "DMA of {} bytes at local {:#x} overflows local memory", len, offset)
            },
        }
    }
}

type Exec<T> = core::result::Result<T, Fault>;

/// Commands fetched from shared memory
#[derive(Debug, Default)]
struct Window {
    base: PhysAddr,
    words: [u32; WINDOW_WORDS],
    len: usize,
    valid: bool,
}

struct Engine {
    sim: Arc<SimShared>,
    pos: PhysAddr,
    window: Window,
}

/// Engine thread entry point
pub(super) fn run(sim: Arc<SimShared>) {
    let mut engine = Engine {
        sim,
        pos: PhysAddr::default(),
        window: Window::default(),
    };
    engine.main_loop();
}

impl Engine {
    fn main_loop(&mut self) {
        loop {
            if self.sim.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if self.sim.status().contains(Status::HALTED) {
                thread::park_timeout(HALTED_PARK);
                continue;
            }
            if self.sim.restart.swap(false, Ordering::SeqCst) {
                self.pos = PhysAddr::new(self.sim.local(layout::DRAM_CURRENT_ADDR));
                self.window.valid = false;
            }
            if self.sim.paused.load(Ordering::SeqCst) {
                thread::sleep(PAUSED_SLEEP);
                continue;
            }
            if let Err(fault) = self.step() {
                self.fault(fault);
            }
        }
    }

    fn fault(&mut self, fault: Fault) {
        log::error!("sim: engine broke at {}: {}", self.pos, fault);
        self.sim
            .update_status(|s| Some(s | Status::HALTED | Status::BROKE));
        self.window.valid = false;
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    /// Index of the current position inside the window, if it is covered
    fn window_offset(&self) -> Option<usize> {
        let off = self.pos.raw().checked_sub(self.window.base.raw())? as usize / 4;
        (self.window.valid && off < self.window.len).then_some(off)
    }

    /// Make sure `words` words at the current position, plus one word of
    /// lookahead, are in the window.
    fn ensure(&mut self, words: usize) -> Exec<usize> {
        let covered = |engine: &Self| {
            let avail = engine.arena_words_from(engine.pos);
            engine
                .window_offset()
                .filter(|&off| off + (words + 1).min(avail) <= engine.window.len)
        };
        if let Some(off) = covered(self) {
            return Ok(off);
        }
        self.refill()?;
        match self.window_offset() {
            Some(off) if off + words <= self.window.len => Ok(off),
            _ => Err(Fault::BadAddress(self.pos.add_words(words as u32))),
        }
    }

    /// Words of shared memory from `addr` to the end of the arena
    fn arena_words_from(&self, addr: PhysAddr) -> usize {
        let mem = &self.sim.mem;
        let end = mem.base().raw() + mem.len() * 4;
        (end.saturating_sub(addr.raw()) / 4) as usize
    }

    fn refill(&mut self) -> Exec<()> {
        let mem = &self.sim.mem;
        if !mem.contains(self.pos) {
            return Err(Fault::BadAddress(self.pos));
        }
        let len = self.arena_words_from(self.pos).min(WINDOW_WORDS);
        for i in 0..len {
            let addr = self.pos.add_words(i as u32);
            let word = mem.word(addr).load(Ordering::SeqCst);
            self.window.words[i] = word;
            self.sim.set_local(layout::COMMAND_WINDOW + i, word);
        }
        self.window.base = self.pos;
        self.window.len = len;
        self.window.valid = true;
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn step(&mut self) -> Exec<()> {
        let check = self.sim.local(layout::PRIMODE_STATUS_CHECK);
        if check != 0 && self.sim.status().bits() & check != 0 {
            self.enter_highpri();
        }
        self.sim.set_local(layout::DRAM_CURRENT_ADDR, self.pos.raw());
        self.sim.pc.store(DISPATCH_PC, Ordering::SeqCst);

        let off = self.ensure(1)?;
        let head = self.window.words[off];
        if is_idle(head) {
            self.idle();
            return Ok(());
        }

        let op = opcode_of(head);
        let overlay = overlay_of(op);
        let program = if overlay == 0 {
            None
        } else {
            Some(self.lookup_overlay(overlay)?)
        };
        let words = match &program {
            Some((_, program)) => program.command_words(command_of(op)).max(1) as usize,
            None => match Opcode::from_byte(op) {
                Some(opcode) => opcode.words() as usize,
                None => return Err(Fault::UnknownOpcode(head)),
            },
        };

        let off = self.ensure(words)?;
        if self.window.words[off] != head {
            return Ok(());
        }
        let mut args: Vec<u32> = self.window.words[off + 1..off + words].to_vec();
        if words > 1 && self.sim.mem.word(self.pos).load(Ordering::SeqCst) != head {
            self.window.valid = false;
            return Ok(());
        }

        match program {
            Some((slot, program)) => {
                self.sim.executed.fetch_add(1, Ordering::SeqCst);
                args.insert(0, head & PAYLOAD_MASK);
                self.run_overlay(slot, &*program, command_of(op), &args);
                self.advance(words);
                Ok(())
            },
            None => self.execute(head, &args),
        }
    }

    /// The current position holds a terminator: continue if the host wrote
    /// more commands since the last fetch, otherwise halt.
    fn idle(&mut self) {
        let more = signals::MORE.status();
        self.sim.update_status(|s| {
            Some(if s.contains(more) {
                s - more
            } else {
                s | Status::HALTED | Status::BROKE
            })
        });
        self.window.valid = false;
    }

    fn enter_highpri(&mut self) {
        let pos = self.pos.raw();
        self.set_stack(LOWPRI_CALL_SLOT, pos);
        self.sim.set_local(layout::DRAM_LOWPRI_ADDR, pos);
        self.pos = PhysAddr::new(self.stack(HIGHPRI_CALL_SLOT));
        self.sim.set_local(layout::PRIMODE_STATUS_CHECK, 0);
        self.window.valid = false;
    }

    fn advance(&mut self, words: usize) {
        self.pos = self.pos.add_words(words as u32);
    }

    fn jump(&mut self, target: u32) {
        self.pos = PhysAddr::from_payload(target);
        self.window.valid = false;
    }

    fn stack(&self, slot: u32) -> u32 {
        self.sim.local(layout::POINTER_STACK + slot as usize)
    }

    fn set_stack(&self, slot: u32, value: u32) {
        self.sim.set_local(layout::POINTER_STACK + slot as usize, value);
    }

    fn checked_slot(operand: u32) -> Exec<u32> {
        let slot = slot_index(operand);
        if (slot as usize) < layout::POINTER_STACK_SLOTS {
            Ok(slot)
        } else {
            Err(Fault::BadSlot(slot))
        }
    }

    // =========================================================================
    // Internal commands
    // =========================================================================

    fn execute(&mut self, head: u32, args: &[u32]) -> Exec<()> {
        let payload = head & PAYLOAD_MASK;
        let Some(opcode) = Opcode::from_word(head) else {
            return Err(Fault::UnknownOpcode(head));
        };

        if opcode == Opcode::TasStatus {
            return self.test_and_set(payload, args[0]);
        }
        self.sim.executed.fetch_add(1, Ordering::SeqCst);

        match opcode {
            Opcode::SetStatus => {
                self.sim.write_status(WStatus::from_bits_retain(payload));
                self.advance(1);
            },
            Opcode::Call => {
                let slot = Self::checked_slot(args[0])?;
                self.set_stack(slot, self.pos.add_words(2).raw());
                self.jump(payload);
            },
            Opcode::Jump => self.jump(payload),
            Opcode::Ret => {
                let slot = Self::checked_slot(payload)?;
                self.jump(self.stack(slot));
            },
            Opcode::SwapBuffers => {
                let load = Self::checked_slot(payload)?;
                let save = Self::checked_slot(args[0])?;
                let next = self.stack(load);
                self.set_stack(save, self.pos.add_words(3).raw());
                self.sim.set_local(layout::PRIMODE_STATUS_CHECK, args[1]);
                self.sim
                    .set_local(layout::DRAM_LOWPRI_ADDR, self.stack(LOWPRI_CALL_SLOT));
                self.sim
                    .set_local(layout::DRAM_HIGHPRI_ADDR, self.stack(HIGHPRI_CALL_SLOT));
                self.jump(next);
            },
            Opcode::Noop => self.advance(1),
            Opcode::Dma => {
                self.dma(PhysAddr::from_payload(payload), args[0], args[1] + 1, args[2])?;
                self.advance(4);
            },
            Opcode::Idle | Opcode::TasStatus => unreachable!("handled before dispatch"),
        }
        Ok(())
    }

    /// Write the status register once none of `wait` is set
    fn test_and_set(&mut self, payload: u32, wait: u32) -> Exec<()> {
        let wait = Status::from_bits_retain(wait);
        let w = WStatus::from_bits_retain(payload);
        let applied = self
            .sim
            .update_status(|s| (!s.intersects(wait)).then(|| s.apply(w)));
        if applied.is_none() {
            thread::yield_now();
            return Ok(());
        }

        self.sim.executed.fetch_add(1, Ordering::SeqCst);
        if w.contains(WStatus::SET_INTR) {
            self.sim.raise_interrupt();
        }
        self.advance(2);
        Ok(())
    }

    fn dma(&mut self, shared: PhysAddr, local: u32, len: u32, flags: u32) -> Exec<()> {
        let flags = DmaFlags::from_bits_retain(flags);
        let words = len.div_ceil(4) as usize;
        let first = (local / 4) as usize;
        if first + words > self.sim.local.len() {
            return Err(Fault::LocalOverflow { offset: local, len });
        }

        let mem = &self.sim.mem;
        for i in 0..words {
            let addr = shared.add_words(i as u32);
            let word = mem.try_word(addr).map_err(|_| Fault::BadAddress(addr))?;
            if flags.is_outbound() {
                word.store(self.sim.local(first + i), Ordering::SeqCst);
            } else {
                self.sim.set_local(first + i, word.load(Ordering::SeqCst));
            }
        }

        let mut regs = self.sim.dma.lock();
        regs.local_addr = local;
        regs.shared_addr = shared.raw();
        if flags.is_outbound() {
            regs.write_len = len - 1;
        } else {
            regs.read_len = len - 1;
        }
        Ok(())
    }

    // =========================================================================
    // Overlays
    // =========================================================================

    fn lookup_overlay(&self, id: u8) -> Exec<(usize, Arc<dyn OverlayProgram>)> {
        let table: [u32; 4] = core::array::from_fn(|i| self.sim.local(layout::OVERLAY_TABLE + i));
        let slot = table_entry(&table, id as usize) as usize;
        if slot == 0 || slot >= MAX_OVERLAY_COUNT {
            return Err(Fault::UnregisteredOverlay(id));
        }

        let at = layout::OVERLAY_DESCRIPTORS + slot * OverlayDescriptor::WORDS;
        let words: [u32; OverlayDescriptor::WORDS] = core::array::from_fn(|i| self.sim.local(at + i));
        let desc = OverlayDescriptor::decode(&words);
        let signature = self
            .sim
            .mem
            .try_word(desc.code)
            .map_err(|_| Fault::BadAddress(desc.code))?
            .load(Ordering::SeqCst);

        let programs = self.sim.programs.read();
        match programs.iter().find(|p| p.signature() == signature) {
            Some(program) => Ok((slot, program.clone())),
            None => Err(Fault::MissingProgram(signature)),
        }
    }

    fn run_overlay(&mut self, slot: usize, program: &dyn OverlayProgram, command: u8, args: &[u32]) {
        let at = layout::OVERLAY_DESCRIPTORS + slot * OverlayDescriptor::WORDS;
        let state = PhysAddr::new(self.sim.local(at + 2));
        self.sim.pc.store(OVERLAY_PC, Ordering::SeqCst);
        let ctx = OverlayContext {
            mem: &self.sim.mem,
            state,
        };
        program.execute(command, args, &ctx);
        self.sim.set_local(layout::CURRENT_OVERLAY, slot as u32);
    }
}
