//! Guest RAM backing and address translation.

use crate::error::{Error, Result};

/// Compute the linear address of a real-mode `segment:offset` pair.
#[inline]
pub fn segment_to_flat(selector: u16, offset: u16) -> u32 {
    ((selector as u32) << 4) + offset as u32
}

/// Contiguous guest physical memory covering `[0, size)`.
///
/// KVM rejects user memory slots whose host pointer is not page-aligned,
/// so the buffer comes from `posix_memalign` with the host page size as
/// the alignment.
#[derive(Debug)]
pub struct GuestMemory {
    ptr: *mut u8,
    size: usize,
}

// Safety: GuestMemory owns its allocation; access from the monitor thread
// and the VCPU never overlaps in time (the run loop is single-threaded).
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Allocate a zeroed guest RAM region.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "zero-sized guest RAM".to_string(),
            ));
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let size = size.next_multiple_of(page_size);

        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut ptr, page_size, size) };
        if rc != 0 {
            return Err(Error::MemoryAllocationFailed(format!(
                "posix_memalign for {size} bytes: {}",
                std::io::Error::from_raw_os_error(rc)
            )));
        }

        // The guest expects its RAM zeroed; posix_memalign makes no such
        // promise.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Host pointer to the start of guest RAM.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Translate a guest physical offset to a host pointer.
    ///
    /// No bounds check: callers pair this with [`GuestMemory::contains`]
    /// whenever the guest supplied the address.
    #[inline]
    pub fn flat_to_host(&self, offset: u64) -> *mut u8 {
        self.ptr.wrapping_add(offset as usize)
    }

    /// Translate a real-mode `segment:offset` pair to a host pointer.
    #[inline]
    pub fn real_to_host(&self, selector: u16, offset: u16) -> *mut u8 {
        self.flat_to_host(segment_to_flat(selector, offset) as u64)
    }

    /// Whether a host pointer lies inside guest RAM.
    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        let base = self.ptr as usize;
        let p = p as usize;
        p >= base && p < base + self.size
    }

    /// Read bytes from a guest physical offset.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Write bytes to a guest physical offset.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Read a plain value from a guest physical offset (unaligned ok).
    pub fn read_obj<T: Copy>(&self, offset: u64) -> Result<T> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        unsafe { Ok(std::ptr::read_unaligned(self.ptr.add(offset as usize) as *const T)) }
    }

    /// Write a plain value to a guest physical offset (unaligned ok).
    pub fn write_obj<T: Copy>(&mut self, offset: u64, value: T) -> Result<()> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        unsafe {
            std::ptr::write_unaligned(self.ptr.add(offset as usize) as *mut T, value);
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::InvalidGuestAddress(offset))?;
        if end > self.size as u64 {
            return Err(Error::InvalidGuestAddress(offset));
        }
        Ok(())
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr as *mut libc::c_void);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_page_aligned() {
        let mem = GuestMemory::new(4096).unwrap();
        assert!(mem.size() >= 4096);
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        assert_eq!(mem.as_ptr() as usize % page, 0);
    }

    #[test]
    fn test_fresh_ram_reads_zero() {
        let mem = GuestMemory::new(64 << 10).unwrap();
        let mut buf = [0xA5u8; 32];
        mem.read(mem.size() as u64 - 32, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let mut mem = GuestMemory::new(4096).unwrap();
        let data = b"Hello, guest!";
        mem.write(0x100, data).unwrap();

        let mut buf = [0u8; 13];
        mem.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_obj_roundtrip() {
        let mut mem = GuestMemory::new(4096).unwrap();
        mem.write_obj(0x21, 0xDEAD_BEEFu32).unwrap();
        let value: u32 = mem.read_obj(0x21).unwrap();
        assert_eq!(value, 0xDEAD_BEEF);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut mem = GuestMemory::new(4096).unwrap();
        let size = mem.size() as u64;
        assert!(mem.write(size - 1, &[0, 0]).is_err());
        assert!(mem.read_obj::<u64>(size - 4).is_err());
        assert!(mem.write(u64::MAX, &[1]).is_err());
    }

    #[test]
    fn test_translation_helpers_agree() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        for &(sel, off) in &[(0x1000u16, 0x0000u16), (0x0040, 0x0010), (0xffff, 0xffff)] {
            let flat = segment_to_flat(sel, off) as u64;
            assert_eq!(mem.real_to_host(sel, off), mem.flat_to_host(flat));
        }
        assert_eq!(segment_to_flat(0x1000, 0), 0x10000);
        assert_eq!(segment_to_flat(0xffff, 0xffff), 0x10ffef);
    }

    #[test]
    fn test_contains() {
        let mem = GuestMemory::new(4096).unwrap();
        let size = mem.size() as u64;
        assert!(mem.contains(mem.flat_to_host(0)));
        assert!(mem.contains(mem.flat_to_host(size - 1)));
        assert!(!mem.contains(mem.flat_to_host(size)));
    }
}
