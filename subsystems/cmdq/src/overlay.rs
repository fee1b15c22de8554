//! # Overlays
//!
//! An overlay is a microcode module that implements up to 16 commands. It is
//! registered under an id (the high nibble of its opcodes) and is loaded by
//! the engine on demand the first time one of its commands is fetched.
//!
//! ```text
//!  text                                        data
//! ┌──────────────────┬──────────────────────┐  ┌─────────────┬──────────────┐
//! │ engine prologue  │ overlay code ...     │  │ header (2w) │ state ...    │
//! └──────────────────┴──────────────────────┘  └─────────────┴──────────────┘
//!                     ▲ descriptor.code                        ▲ descriptor.state
//! ```
//!
//! The overlay table maps ids to descriptor slots. Several ids may share one
//! slot when they name the same code. Slot 0 describes the engine itself.
//! The tables live in shared memory and every registration enqueues a DMA
//! that refreshes the engine's local copy, so registrations are ordered like
//! any other command.

use arrayvec::ArrayVec;
use helix_hal::{Coprocessor, HalResult, PhysAddr, Region, SharedMemory};

use crate::config::{MAX_OVERLAY_COUNT, OVERLAY_TABLE_SIZE};
use crate::error::{CmdqError, Result};
use crate::layout::{self, set_table_entry, OverlayDescriptor, OVERLAY_DATA_ADDR, TABLES_WORDS};
use crate::opcode::{addr_payload, DmaFlags, Opcode, PAYLOAD_MASK};
use crate::queue::CommandQueue;

/// Text every overlay image starts with: the queue engine entry code
pub const ENGINE_PROLOGUE: [u32; 4] = [0x4845_4C58, 0x434D_4451, 0x0000_0001, 0x0000_0000];

/// Words of the data segment header
const DATA_HEADER_WORDS: u32 = 2;

/// Words of the engine's own state buffer
const INTERNAL_STATE_WORDS: u32 = 2;

// =============================================================================
// MICROCODE
// =============================================================================

/// Header at the start of an overlay's data segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayHeader {
    /// Local byte address the state buffer is loaded at
    pub state_start: u32,
    /// State buffer size in bytes
    pub state_size: u16,
    /// First command index handled by the overlay
    pub command_base: u16,
}

/// A microcode image uploaded to shared memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microcode {
    text: Region,
    data: Region,
}

impl Microcode {
    /// Upload the text and data segments of an image
    pub fn upload(mem: &SharedMemory, text: &[u32], data: &[u32]) -> Result<Self> {
        if text.len() <= ENGINE_PROLOGUE.len() {
            return Err(CmdqError::InvalidMicrocode("text shorter than the engine prologue"));
        }
        if data.len() < DATA_HEADER_WORDS as usize {
            return Err(CmdqError::InvalidMicrocode("data segment has no header"));
        }

        let text = mem.upload(text)?;
        let data = match mem.upload(data) {
            Ok(region) => region,
            Err(err) => {
                mem.free(text.addr())?;
                return Err(err.into());
            },
        };
        Ok(Self { text, data })
    }

    /// Text segment
    pub fn text(&self) -> Region {
        self.text
    }

    /// Data segment
    pub fn data(&self) -> Region {
        self.data
    }

    /// Decode the data segment header
    pub fn header(&self, mem: &SharedMemory) -> OverlayHeader {
        let word = mem.read(self.data.word_addr(1));
        OverlayHeader {
            state_start: mem.read(self.data.addr()),
            state_size: (word >> 16) as u16,
            command_base: word as u16,
        }
    }

    /// Shared memory address of the state buffer inside the data segment
    pub fn state_addr(&self, mem: &SharedMemory) -> PhysAddr {
        let header = self.header(mem);
        let offset = (header.state_start & 0xFFF).wrapping_sub(OVERLAY_DATA_ADDR);
        assert!(
            offset % 4 == 0 && offset + header.state_size as u32 <= self.data.byte_len(),
            "overlay state ({:#x} + {} bytes) lies outside its data segment",
            header.state_start,
            header.state_size
        );
        PhysAddr::new(self.data.addr().raw() + offset)
    }

    /// Release both segments
    pub fn free(self, mem: &SharedMemory) -> HalResult<()> {
        mem.free(self.text.addr())?;
        mem.free(self.data.addr())?;
        Ok(())
    }
}

// =============================================================================
// OVERLAY TABLES
// =============================================================================

/// Host copy of the overlay table and descriptors
#[derive(Debug)]
pub(crate) struct OverlayTables {
    /// Shared memory image the engine copies from
    region: Region,
    /// Id to slot
    table: [u8; OVERLAY_TABLE_SIZE],
    /// Descriptors by slot
    descriptors: ArrayVec<OverlayDescriptor, MAX_OVERLAY_COUNT>,
    /// State buffer of the engine itself
    internal_state: Region,
}

impl OverlayTables {
    /// Allocate the tables with the engine's own descriptor in slot 0
    pub(crate) fn new(mem: &SharedMemory) -> HalResult<Self> {
        let region = mem.alloc(TABLES_WORDS as u32)?;
        let internal_state = match mem.alloc(INTERNAL_STATE_WORDS) {
            Ok(state) => state,
            Err(err) => {
                mem.free(region.addr())?;
                return Err(err);
            },
        };

        let mut descriptors = ArrayVec::new();
        descriptors.push(OverlayDescriptor {
            state: internal_state.addr(),
            data_size: (internal_state.byte_len() - 1) as u16,
            ..Default::default()
        });
        let tables = Self {
            region,
            table: [0; OVERLAY_TABLE_SIZE],
            descriptors,
            internal_state,
        };
        tables.sync(mem);
        Ok(tables)
    }

    /// Encode the tables in the local memory layout
    pub(crate) fn encode(&self) -> [u32; TABLES_WORDS] {
        let mut words = [0u32; TABLES_WORDS];
        for (id, &slot) in self.table.iter().enumerate() {
            set_table_entry(&mut words, id, slot);
        }
        for (slot, desc) in self.descriptors.iter().enumerate() {
            let at = layout::OVERLAY_DESCRIPTORS + slot * OverlayDescriptor::WORDS;
            words[at..at + OverlayDescriptor::WORDS].copy_from_slice(&desc.encode());
        }
        words
    }

    /// Descriptor slot an overlay id is mapped to, if registered
    pub(crate) fn slot_of(&self, id: u8) -> Option<u8> {
        match self.table.get(id as usize) {
            Some(&slot) if id != 0 && slot != 0 => Some(slot),
            _ => None,
        }
    }

    /// Slot of the descriptor whose code lives at `code`
    fn find(&self, code: PhysAddr) -> Option<u8> {
        self.descriptors
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, desc)| desc.code == code)
            .map(|(slot, _)| slot as u8)
    }

    /// Refresh the shared memory image
    fn sync(&self, mem: &SharedMemory) {
        mem.copy_in(self.region.addr(), &self.encode());
    }

    /// Release the shared memory image and the engine state buffer
    pub(crate) fn free(&self, mem: &SharedMemory) -> HalResult<()> {
        mem.free(self.region.addr())?;
        mem.free(self.internal_state.addr())?;
        Ok(())
    }
}

// =============================================================================
// QUEUE OPERATIONS
// =============================================================================

impl<C: Coprocessor> CommandQueue<C> {
    /// Register `ucode` under overlay id `id`.
    ///
    /// Registering the same image under several ids maps them all to one
    /// descriptor. The engine sees the new mapping once it executes the
    /// table update enqueued here.
    ///
    /// The update goes to the low-priority lane, and the lanes are not
    /// ordered with each other: a high-priority session may only use `id`
    /// after the low-priority lane has run the update (for example after
    /// [`wait_idle`](CommandQueue::wait_idle)).
    pub fn overlay_register(&mut self, ucode: &Microcode, id: u8) {
        assert!(
            (1..OVERLAY_TABLE_SIZE as u8).contains(&id),
            "overlay id {} out of range (1..{})",
            id,
            OVERLAY_TABLE_SIZE
        );
        assert!(
            self.block.is_none(),
            "cannot register an overlay while recording a block"
        );

        let text = ucode.text();
        let mut prologue = [0u32; ENGINE_PROLOGUE.len()];
        self.mem.copy_out(text.addr(), &mut prologue);
        assert!(
            prologue == ENGINE_PROLOGUE,
            "overlay code does not start with the queue engine prologue"
        );

        let code = text.word_addr(ENGINE_PROLOGUE.len() as u32);
        let slot = match self.overlays.find(code) {
            Some(slot) => slot,
            None => {
                let data = ucode.data();
                let desc = OverlayDescriptor {
                    code,
                    data: data.addr(),
                    state: ucode.state_addr(&self.mem),
                    code_size: (text.byte_len() - 4 * ENGINE_PROLOGUE.len() as u32 - 1) as u16,
                    data_size: (data.byte_len() - 1) as u16,
                };
                let slot = self.overlays.descriptors.len();
                if self.overlays.descriptors.try_push(desc).is_err() {
                    panic!("only up to {} overlays are supported", MAX_OVERLAY_COUNT - 1);
                }
                slot as u8
            },
        };
        self.overlays.table[id as usize] = slot;
        self.overlays.sync(&self.mem);

        let tables = self.overlays.region.addr();
        self.dma_to_local(0, tables, TABLES_WORDS as u32 * 4, false);
        log::debug!("cmdq: overlay {:#x} -> slot {} (code at {})", id, slot, code);
    }

    /// Enqueue command `command` of overlay `overlay`.
    ///
    /// The low 24 bits of `args[0]` share the first word with the opcode.
    pub fn write(&mut self, overlay: u8, command: u8, args: &[u32]) {
        assert!(
            self.overlays.slot_of(overlay).is_some(),
            "overlay {:#x} is not registered",
            overlay
        );
        assert!(command < 16, "command index {} out of range", command);

        let (first, rest) = args.split_first().map_or((0, &[][..]), |(&a, r)| (a, r));
        assert!(
            first & !PAYLOAD_MASK == 0,
            "first argument {:#x} does not fit 24 bits",
            first
        );

        let head = ((overlay as u32) << 28) | ((command as u32) << 24) | first;
        let mut w = self.reserve(1 + rest.len() as u32);
        w.push(head).extend(rest);
        w.commit();
    }

    /// Shared memory address of an overlay's state buffer
    pub fn overlay_state(&self, ucode: &Microcode) -> PhysAddr {
        ucode.state_addr(&self.mem)
    }

    /// Enqueue a transfer of `len` bytes from shared memory into local memory
    pub fn dma_to_local(&mut self, local: u32, src: PhysAddr, len: u32, is_async: bool) {
        self.dma(local, src, len, DmaFlags::empty(), is_async);
    }

    /// Enqueue a transfer of `len` bytes from local memory out to shared memory
    pub fn dma_to_shared(&mut self, dst: PhysAddr, local: u32, len: u32, is_async: bool) {
        self.dma(local, dst, len, DmaFlags::TO_SHARED, is_async);
    }

    fn dma(&mut self, local: u32, shared: PhysAddr, len: u32, flags: DmaFlags, is_async: bool) {
        assert!(len > 0, "empty DMA transfer");
        assert!(
            shared.is_aligned(8) && local % 8 == 0,
            "DMA addresses must be 8-byte aligned ({}, local {:#x})",
            shared,
            local
        );
        let flags = if is_async { flags } else { flags | DmaFlags::WAIT_IDLE };
        self.emit(&[
            Opcode::Dma.word(addr_payload(shared)),
            local,
            len - 1,
            flags.bits(),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::layout::table_entry;
    use crate::sim::{self, Tally, TallyState};

    #[test]
    fn test_registered_overlay_executes() {
        let mut h = sim::harness(sim::test_config());
        let tally = h.install_tally(3);
        h.queue.write(3, Tally::PUSH, &[0x12_3456]);
        h.queue.write(3, Tally::PUSH_WIDE, &[0, 0xFFFF_FFFF]);
        h.queue.wait_idle();

        assert_eq!(tally.values(&h.mem), [0x12_3456, 0xFFFF_FFFF]);
        let table: vec::Vec<u32> = (0..4).map(|i| h.sim.read_local(i)).collect();
        assert_eq!(table_entry(&table, 3), 1);
        assert_eq!(h.sim.read_local(layout::CURRENT_OVERLAY), 1);
    }

    #[test]
    fn test_same_code_shares_one_slot() {
        let mut h = sim::harness(sim::test_config());
        let ucode = sim::tally_microcode(&h.mem);
        h.sim.install(alloc::sync::Arc::new(Tally));
        h.queue.overlay_register(&ucode, 1);
        h.queue.overlay_register(&ucode, 2);

        assert_eq!(h.queue.overlays.slot_of(1), Some(1));
        assert_eq!(h.queue.overlays.slot_of(2), Some(1));
        assert_eq!(h.queue.overlays.descriptors.len(), 2);

        h.queue.write(1, Tally::PUSH, &[10]);
        h.queue.write(2, Tally::PUSH, &[20]);
        h.queue.wait_idle();
        let tally = TallyState::new(h.queue.overlay_state(&ucode));
        assert_eq!(tally.values(&h.mem), [10, 20]);
    }

    #[test]
    #[should_panic(expected = "only up to 7 overlays are supported")]
    fn test_too_many_overlays_panics() {
        let mut h = sim::harness(sim::test_config());
        for id in 1..=MAX_OVERLAY_COUNT as u8 {
            let ucode = sim::tally_microcode(&h.mem);
            h.queue.overlay_register(&ucode, id);
        }
    }

    #[test]
    #[should_panic(expected = "does not start with the queue engine prologue")]
    fn test_foreign_prologue_panics() {
        let mut h = sim::harness(sim::test_config());
        let ucode = Microcode::upload(&h.mem, &[0, 0, 0, 0, Tally::SIGNATURE], &[0x608, 0]).unwrap();
        h.queue.overlay_register(&ucode, 1);
    }

    #[test]
    #[should_panic(expected = "overlay 0x5 is not registered")]
    fn test_unregistered_overlay_panics() {
        let mut h = sim::harness(sim::test_config());
        h.queue.write(5, 0, &[]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_internal_id_rejected() {
        let mut h = sim::harness(sim::test_config());
        let ucode = sim::tally_microcode(&h.mem);
        h.queue.overlay_register(&ucode, 0);
    }

    #[test]
    fn test_state_follows_data_header() {
        let h = sim::harness(sim::test_config());
        let ucode = sim::tally_microcode(&h.mem);
        let header = ucode.header(&h.mem);
        assert_eq!(header.state_start, OVERLAY_DATA_ADDR + 8);
        assert_eq!(h.queue.overlay_state(&ucode), ucode.data().word_addr(2));
    }

    #[test]
    fn test_upload_rejects_truncated_images() {
        let h = sim::harness(sim::test_config());
        let free = h.mem.free_words();
        assert!(matches!(
            Microcode::upload(&h.mem, &ENGINE_PROLOGUE, &[0, 0]),
            Err(CmdqError::InvalidMicrocode(_))
        ));
        assert!(matches!(
            Microcode::upload(&h.mem, &[0; 8], &[0]),
            Err(CmdqError::InvalidMicrocode(_))
        ));
        assert_eq!(h.mem.free_words(), free);
    }

    #[test]
    fn test_internal_descriptor_in_slot_zero() {
        let h = sim::harness(sim::test_config());
        let words = h.queue.overlays.encode();
        let internal = OverlayDescriptor::decode(&words[layout::OVERLAY_DESCRIPTORS..]);
        assert_eq!(internal.state, h.queue.overlays.internal_state.addr());
        assert_eq!(internal.data_size, 7);
        assert_eq!(h.queue.overlays.slot_of(0), None);
    }

    #[test]
    fn test_dma_round_trip_through_local_memory() {
        let mut h = sim::harness(sim::test_config());
        let src = h.mem.upload(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let dst = h.mem.alloc(8).unwrap();

        h.queue.dma_to_local(0x800, src.addr(), 32, true);
        h.queue.dma_to_shared(dst.addr(), 0x800, 32, false);
        h.queue.wait_idle();

        let mut out = [0u32; 8];
        h.mem.copy_out(dst.addr(), &mut out);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(h.sim.read_local(0x200), 1);
        assert_eq!(h.sim.dma_registers().write_len, 31);
    }
}
