//! Real-mode BIOS installation.
//!
//! The guest gets the smallest BIOS that will carry a Linux kernel through
//! real-mode setup: an IVT whose vectors all land on an `iret` stub, a
//! teletype `int 10h` handler and an `int 15h` E820 handler. The stubs are
//! copied into the BIOS Data Area and the IVT is written at linear 0.

mod interrupt_table;
pub mod stubs;

pub use interrupt_table::{InterruptTable, RealModeIntrDesc, REAL_INTR_SIZE, REAL_INTR_VECTORS};

use crate::error::Result;
use crate::memory::layout::{BDA_START, BZ_KERNEL_START, EBDA_START, REAL_MODE_IVT_BEGIN};
use crate::memory::GuestMemory;

/// Real-mode segment covering a 16-byte-aligned linear address.
#[inline]
pub fn real_segment(addr: u64) -> u16 {
    (addr >> 4) as u16
}

/// Next 16-byte-aligned slot at or after `addr` for a BIOS fragment.
#[inline]
fn bios_intr_next(addr: u64) -> u64 {
    (addr + 15) & !15
}

/// E820 memory-map entry types.
pub mod e820_type {
    pub const RAM: u32 = 1;
    pub const RESERVED: u32 = 2;
}

/// One packed E820 memory-map entry as the guest sees it.
#[derive(Debug, Clone, Copy)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: u32,
}

impl E820Entry {
    pub const SIZE: usize = 20;

    pub fn new(addr: u64, size: u64, type_: u32) -> Self {
        Self { addr, size, type_ }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.type_.to_le_bytes());
        bytes
    }
}

/// Build the memory map reported through `int 15h, ax=e820h`.
pub fn build_e820_map(ram_size: u64) -> Vec<E820Entry> {
    vec![
        // Conventional memory below the EBDA.
        E820Entry::new(0, EBDA_START, e820_type::RAM),
        // EBDA, video RAM and the BIOS hole up to 1 MiB.
        E820Entry::new(EBDA_START, BZ_KERNEL_START - EBDA_START, e820_type::RESERVED),
        // Everything above 1 MiB.
        E820Entry::new(BZ_KERNEL_START, ram_size - BZ_KERNEL_START, e820_type::RAM),
    ]
}

/// Copy the BIOS stubs into the BDA, point the IVT at them and write the
/// table to linear 0.
///
/// Vector layout: every vector defaults to the `iret` stub, 0x10 goes to
/// the video handler, 0x15 to the E820 handler.
pub fn setup(memory: &mut GuestMemory, table: &mut InterruptTable) -> Result<()> {
    let mut addr = bios_intr_next(BDA_START);
    memory.write(addr, stubs::INTFAKE)?;
    table.setup(RealModeIntrDesc {
        segment: real_segment(addr),
        offset: 0,
    });

    addr = bios_intr_next(addr + stubs::INTFAKE.len() as u64);
    memory.write(addr, stubs::INT10)?;
    table.set(
        0x10,
        RealModeIntrDesc {
            segment: real_segment(addr),
            offset: 0,
        },
    );

    addr = bios_intr_next(addr + stubs::INT10.len() as u64);
    memory.write(addr, stubs::INT15)?;
    memory.write(
        addr + stubs::E820_QUERY_MAP_OFFSET as u64,
        stubs::E820_QUERY_MAP,
    )?;

    let map = build_e820_map(memory.size() as u64);
    memory.write_obj(
        addr + stubs::E820_NR_ENTRIES_OFFSET as u64,
        map.len() as u16,
    )?;
    let mut entry_addr = addr + stubs::E820_TABLE_OFFSET as u64;
    for entry in &map {
        memory.write(entry_addr, &entry.to_bytes())?;
        entry_addr += E820Entry::SIZE as u64;
    }

    table.set(
        0x15,
        RealModeIntrDesc {
            segment: real_segment(addr),
            offset: 0,
        },
    );

    memory.write(REAL_MODE_IVT_BEGIN, &table.to_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e820_entry_packing() {
        let entry = E820Entry::new(0x10_0000, 0x100_0000, e820_type::RAM);
        let bytes = entry.to_bytes();
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 0x10_0000);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0x100_0000);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 1);
    }

    #[test]
    fn test_e820_map_covers_ram() {
        let map = build_e820_map(64 << 20);
        assert_eq!(map.len(), 3);
        assert_eq!(map[0].addr, 0);
        assert_eq!(map[1].type_, e820_type::RESERVED);
        assert_eq!(map[1].addr + map[1].size, 0x10_0000);
        assert_eq!(map[2].addr + map[2].size, 64 << 20);
    }

    #[test]
    fn test_setup_installs_stubs_and_ivt() {
        let mut memory = GuestMemory::new(2 << 20).unwrap();
        let mut table = InterruptTable::new();
        setup(&mut memory, &mut table).unwrap();

        // intfake lands at the start of the BDA; vector 0 points at it.
        let fake: u8 = memory.read_obj(0x400).unwrap();
        assert_eq!(fake, 0xCF);
        let mut head = [0u8; 4];
        memory.read(0, &mut head).unwrap();
        assert_eq!(head, [0x00, 0x00, 0x40, 0x00]);

        // Vector 0x10 points at the int10 stub, first opcode cmp ah, imm8.
        let video = table.get(0x10);
        assert_eq!(video.offset, 0);
        let stub_byte: u8 = memory.read_obj((video.segment as u64) << 4).unwrap();
        assert_eq!(stub_byte, 0x80);

        // The int15 image carries the trampoline and a 3-entry map.
        let e820 = table.get(0x15);
        let base = (e820.segment as u64) << 4;
        let tramp: u8 = memory
            .read_obj(base + stubs::E820_QUERY_MAP_OFFSET as u64)
            .unwrap();
        assert_eq!(tramp, 0x56);
        let count: u16 = memory
            .read_obj(base + stubs::E820_NR_ENTRIES_OFFSET as u64)
            .unwrap();
        assert_eq!(count, 3);
        let first_size: u64 = memory
            .read_obj(base + stubs::E820_TABLE_OFFSET as u64 + 8)
            .unwrap();
        assert_eq!(first_size, EBDA_START);

        // All vectors except 0x10 and 0x15 share the default handler.
        let default = table.get(0);
        for v in 0..=255u8 {
            if v != 0x10 && v != 0x15 {
                assert_eq!(table.get(v), default);
            }
        }
    }
}
