//! bzImage loading per the Linux boot protocol.
//!
//! See Documentation/x86/boot.rst in the kernel tree for the on-disk and
//! in-memory layout the offsets below come from.

use crate::bios::{self, InterruptTable};
use crate::error::{Error, Result};
use crate::memory::layout::{
    BOOT_CMDLINE_OFFSET, BOOT_LOADER_IP, BOOT_LOADER_SELECTOR, BOOT_LOADER_SP, BZ_KERNEL_START,
    INITRD_START,
};
use crate::memory::{segment_to_flat, GuestMemory};

use super::{BootInfo, KernelFormat};

/// Setup header field offsets within the boot image.
#[allow(dead_code)]
pub mod boot_params {
    pub const SETUP_SECTS: u64 = 0x1f1;
    pub const BOOT_FLAG: u64 = 0x1fe;
    pub const HEADER: u64 = 0x202;
    pub const VERSION: u64 = 0x206;
    pub const TYPE_OF_LOADER: u64 = 0x210;
    pub const LOADFLAGS: u64 = 0x211;
    pub const CODE32_START: u64 = 0x214;
    pub const RAMDISK_IMAGE: u64 = 0x218;
    pub const RAMDISK_SIZE: u64 = 0x21c;
    pub const HEAP_END_PTR: u64 = 0x224;
    pub const CMD_LINE_PTR: u64 = 0x228;
    pub const INITRD_ADDR_MAX: u64 = 0x22c;
    pub const CMDLINE_SIZE: u64 = 0x238;
}

/// Load flags in the setup header.
#[allow(dead_code)]
pub mod loadflags {
    pub const LOADED_HIGH: u8 = 0x01;
    pub const CAN_USE_HEAP: u8 = 0x80;
}

const BZIMAGE_MAGIC: &[u8; 4] = b"HdrS";
const BOOT_PROTOCOL_REQUIRED: u16 = 0x0202;
const BZ_DEFAULT_SETUP_SECTS: u8 = 4;

/// Command-line limit for pre-2.06 protocols without a cmdline_size field.
const LEGACY_CMDLINE_SIZE: u32 = 256;

/// The real-mode setup code starts at offset 0x200 of a bzImage.
const BZ_SETUP_ENTRY: u16 = 0x0200;

/// Try to load `data` as a bzImage.
///
/// Returns `Ok(None)` when the setup-header magic is absent so the caller
/// can fall back to the flat-binary branch. A present magic with a
/// truncated image or a pre-2.02 protocol version is a hard error.
pub(super) fn load(
    data: &[u8],
    cmdline: &str,
    initrd: Option<&[u8]>,
    memory: &mut GuestMemory,
    table: &mut InterruptTable,
) -> Result<Option<BootInfo>> {
    if data.len() < (boot_params::VERSION + 2) as usize {
        return Ok(None);
    }
    if &data[boot_params::HEADER as usize..][..4] != BZIMAGE_MAGIC {
        return Ok(None);
    }

    let version = read_u16(data, boot_params::VERSION);
    if version < BOOT_PROTOCOL_REQUIRED {
        return Err(Error::TooOldKernel(version));
    }
    if data.len() < (boot_params::CMDLINE_SIZE + 4) as usize {
        return Err(Error::InvalidKernel("truncated setup header".to_string()));
    }

    let mut setup_sects = data[boot_params::SETUP_SECTS as usize];
    if setup_sects == 0 {
        setup_sects = BZ_DEFAULT_SETUP_SECTS;
    }
    let setup_size = (setup_sects as usize + 1) << 9;
    if data.len() < setup_size {
        return Err(Error::InvalidKernel("truncated setup code".to_string()));
    }

    // Real-mode setup at 0x1000:0, protected-mode payload at 1 MiB.
    let setup_start = segment_to_flat(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP) as u64;
    memory.write(setup_start, &data[..setup_size])?;
    let payload = &data[setup_size..];
    memory.write(BZ_KERNEL_START, payload)?;

    // Command line: truncate to cmdline_size - 1, NUL-pad the rest. The
    // header value is capped at the 64 KiB the layout reserves.
    let cmdline_size = if version >= 0x0206 {
        read_u32(data, boot_params::CMDLINE_SIZE).min(0x1_0000)
    } else {
        LEGACY_CMDLINE_SIZE
    };
    let copy_len = cmdline.len().min(cmdline_size.saturating_sub(1) as usize);
    memory.write(BOOT_CMDLINE_OFFSET, &vec![0u8; cmdline_size as usize])?;
    memory.write(BOOT_CMDLINE_OFFSET, &cmdline.as_bytes()[..copy_len])?;

    // Fields the boot loader owns.
    let hdr = |field: u64| setup_start + field;
    memory.write_obj::<u32>(hdr(boot_params::CMD_LINE_PTR), BOOT_CMDLINE_OFFSET as u32)?;
    memory.write_obj::<u8>(hdr(boot_params::TYPE_OF_LOADER), 0xff)?;
    memory.write_obj::<u16>(hdr(boot_params::HEAP_END_PTR), 0xfe00)?;
    let flags: u8 = memory.read_obj(hdr(boot_params::LOADFLAGS))?;
    memory.write_obj(hdr(boot_params::LOADFLAGS), flags | loadflags::CAN_USE_HEAP)?;

    if let Some(initrd) = initrd {
        let payload_end = BZ_KERNEL_START + payload.len() as u64;
        let initrd_start = INITRD_START.max(align_up(payload_end, 4096));
        if initrd_start + initrd.len() as u64 > memory.size() as u64 {
            return Err(Error::InvalidKernel(
                "initrd does not fit in guest RAM".to_string(),
            ));
        }
        memory.write(initrd_start, initrd)?;
        memory.write_obj::<u32>(hdr(boot_params::RAMDISK_IMAGE), initrd_start as u32)?;
        memory.write_obj::<u32>(hdr(boot_params::RAMDISK_SIZE), initrd.len() as u32)?;
    }

    bios::setup(memory, table)?;

    Ok(Some(BootInfo {
        selector: BOOT_LOADER_SELECTOR,
        ip: BOOT_LOADER_IP + BZ_SETUP_ENTRY,
        sp: BOOT_LOADER_SP,
        format: KernelFormat::BzImage,
    }))
}

fn read_u16(data: &[u8], offset: u64) -> u16 {
    let offset = offset as usize;
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: u64) -> u32 {
    let offset = offset as usize;
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::KernelLoader;

    /// Build a synthetic bzImage: `setup_sects` sectors of setup tagged
    /// 0xAA, a payload tagged 0xBB, and the given header fields.
    fn make_bzimage(setup_sects: u8, version: u16, cmdline_size: u32, payload_len: usize) -> Vec<u8> {
        let effective = if setup_sects == 0 { 4 } else { setup_sects };
        let setup_size = (effective as usize + 1) * 512;
        let mut image = vec![0xAAu8; setup_size];
        image[boot_params::SETUP_SECTS as usize] = setup_sects;
        image[boot_params::HEADER as usize..][..4].copy_from_slice(b"HdrS");
        image[boot_params::VERSION as usize..][..2].copy_from_slice(&version.to_le_bytes());
        image[boot_params::LOADFLAGS as usize] = loadflags::LOADED_HIGH;
        image[boot_params::CMDLINE_SIZE as usize..][..4]
            .copy_from_slice(&cmdline_size.to_le_bytes());
        image.extend(std::iter::repeat(0xBB).take(payload_len));
        image
    }

    fn load_image(image: Vec<u8>, cmdline: &str) -> (GuestMemory, InterruptTable, BootInfo) {
        let mut memory = GuestMemory::new(16 << 20).unwrap();
        let mut table = InterruptTable::new();
        let loader = KernelLoader::from_bytes(image).with_cmdline(cmdline);
        let info = loader.load(&mut memory, &mut table).unwrap();
        (memory, table, info)
    }

    #[test]
    fn test_placement_and_entry() {
        let image = make_bzimage(2, 0x020a, 512, 4096);
        let (memory, _, info) = load_image(image.clone(), "");

        assert_eq!(info.format, KernelFormat::BzImage);
        assert_eq!(info.selector, 0x1000);
        assert_eq!(info.ip, 0x0200);
        assert_eq!(info.sp, 0x8000);

        // Setup bytes at 0x10000 match the file, payload bytes at 1 MiB.
        let setup_size = 3 * 512;
        let mut setup = vec![0u8; setup_size];
        memory.read(0x10000, &mut setup).unwrap();
        assert_eq!(setup, image[..setup_size]);

        let mut payload = vec![0u8; 4096];
        memory.read(0x10_0000, &mut payload).unwrap();
        assert_eq!(payload, image[setup_size..]);
    }

    #[test]
    fn test_header_patches() {
        let image = make_bzimage(4, 0x020a, 512, 1024);
        let (memory, _, _) = load_image(image, "console=ttyS0");

        let hdr = |field: u64| 0x10000 + field;
        let cmd_line_ptr: u32 = memory.read_obj(hdr(boot_params::CMD_LINE_PTR)).unwrap();
        assert_eq!(cmd_line_ptr, 0x20000);
        let type_of_loader: u8 = memory.read_obj(hdr(boot_params::TYPE_OF_LOADER)).unwrap();
        assert_eq!(type_of_loader, 0xff);
        let heap_end_ptr: u16 = memory.read_obj(hdr(boot_params::HEAP_END_PTR)).unwrap();
        assert_eq!(heap_end_ptr, 0xfe00);
        let flags: u8 = memory.read_obj(hdr(boot_params::LOADFLAGS)).unwrap();
        assert_eq!(flags, loadflags::LOADED_HIGH | loadflags::CAN_USE_HEAP);
    }

    #[test]
    fn test_cmdline_truncated_and_padded() {
        let image = make_bzimage(1, 0x020a, 8, 64);
        let (memory, _, _) = load_image(image, "abcdefghij");

        let mut area = [0u8; 16];
        memory.read(0x20000, &mut area).unwrap();
        assert_eq!(&area[..8], b"abcdefg\0");
        assert_eq!(&area[8..], &[0u8; 8]);
    }

    #[test]
    fn test_zero_setup_sects_defaults_to_four() {
        let image = make_bzimage(0, 0x020a, 256, 256);
        let (memory, _, _) = load_image(image.clone(), "");

        // Five sectors of setup, then the payload at 1 MiB.
        let first_payload: u8 = memory.read_obj(0x10_0000).unwrap();
        assert_eq!(first_payload, 0xBB);
        let last_setup: u8 = memory.read_obj(0x10000 + 5 * 512 - 1).unwrap();
        assert_eq!(last_setup, 0xAA);
    }

    #[test]
    fn test_too_old_kernel_is_fatal() {
        let image = make_bzimage(4, 0x0201, 256, 256);
        let mut memory = GuestMemory::new(16 << 20).unwrap();
        let mut table = InterruptTable::new();
        let loader = KernelLoader::from_bytes(image);
        let err = loader.load(&mut memory, &mut table).unwrap_err();
        assert!(matches!(err, Error::TooOldKernel(0x0201)));
    }

    #[test]
    fn test_bios_installed_with_bzimage() {
        let image = make_bzimage(1, 0x020a, 256, 64);
        let (memory, table, _) = load_image(image, "");

        // Vector 0 wires to the iret stub in the BDA.
        let mut head = [0u8; 4];
        memory.read(0, &mut head).unwrap();
        assert_eq!(head, [0x00, 0x00, 0x40, 0x00]);
        let stub: u8 = memory.read_obj(0x400).unwrap();
        assert_eq!(stub, 0xCF);
        assert_ne!(table.get(0x10), table.get(0));
    }

    #[test]
    fn test_initrd_placement() {
        let image = make_bzimage(1, 0x020a, 256, 2048);
        let mut memory = GuestMemory::new(16 << 20).unwrap();
        let mut table = InterruptTable::new();
        let mut loader = KernelLoader::from_bytes(image);
        loader.set_initrd_bytes(vec![0xCD; 1024]);
        loader.load(&mut memory, &mut table).unwrap();

        let ramdisk_image: u32 = memory
            .read_obj(0x10000 + boot_params::RAMDISK_IMAGE)
            .unwrap();
        let ramdisk_size: u32 = memory.read_obj(0x10000 + boot_params::RAMDISK_SIZE).unwrap();
        assert_eq!(ramdisk_image, 0x80_0000);
        assert_eq!(ramdisk_size, 1024);
        let byte: u8 = memory.read_obj(ramdisk_image as u64).unwrap();
        assert_eq!(byte, 0xCD);
    }

    #[test]
    fn test_oversized_initrd_rejected() {
        let image = make_bzimage(1, 0x020a, 256, 64);
        let mut memory = GuestMemory::new(16 << 20).unwrap();
        let mut table = InterruptTable::new();
        let mut loader = KernelLoader::from_bytes(image);
        loader.set_initrd_bytes(vec![0; 16 << 20]);
        assert!(loader.load(&mut memory, &mut table).is_err());
    }
}
