//! Physical-memory mapping through `/dev/mem`.

use std::io;
use std::ptr;

use anyhow::{bail, Context, Result};

pub const PAGE_SIZE: usize = 4096;

const DEV_MEM: &[u8] = b"/dev/mem\0";

/// An `mmap` of a physical address range, unmapped on drop.
///
/// The requested base does not have to be page aligned; the mapping is
/// extended downward to the page boundary and `as_ptr` points at the
/// requested byte.
pub(crate) struct PhysMapping {
    map: *mut libc::c_void,
    map_len: usize,
    offset: usize,
}

impl PhysMapping {
    pub fn map(phys_base: u32, len: usize) -> Result<Self> {
        let offset = phys_base as usize % PAGE_SIZE;
        let aligned_base = phys_base as usize - offset;
        let map_len = len + offset;

        let fd = unsafe {
            libc::open(
                DEV_MEM.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_SYNC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error())
                .context("open /dev/mem (root privileges required)");
        }

        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                aligned_base as libc::off_t,
            )
        };
        unsafe { libc::close(fd) };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error())
                .context(format!("mmap physical range at {phys_base:#x}"));
        }

        Ok(Self { map, map_len, offset })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { (self.map as *mut u8).add(self.offset) }
    }
}

impl Drop for PhysMapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.map, self.map_len) };
    }
}

/// A mapped peripheral register window, accessed as 32-bit words.
///
/// All accesses are volatile: the "memory" behind the mapping is hardware
/// state that changes on its own.
pub struct MmioMap {
    mapping: PhysMapping,
    words: usize,
}

impl MmioMap {
    /// Map `pages` pages of registers starting at the page-aligned physical
    /// address `phys_base`.
    pub fn new(phys_base: u32, pages: usize) -> Result<Self> {
        if phys_base as usize % PAGE_SIZE != 0 {
            bail!("register window base {phys_base:#x} is not page aligned");
        }
        let mapping = PhysMapping::map(phys_base, pages * PAGE_SIZE)
            .with_context(|| format!("map register window at {phys_base:#x}"))?;
        Ok(Self {
            mapping,
            words: pages * PAGE_SIZE / 4,
        })
    }

    pub fn read(&self, word: usize) -> u32 {
        assert!(word < self.words);
        unsafe { (self.mapping.as_ptr() as *const u32).add(word).read_volatile() }
    }

    pub fn write(&self, word: usize, value: u32) {
        assert!(word < self.words);
        unsafe {
            (self.mapping.as_ptr() as *mut u32).add(word).write_volatile(value);
        }
    }
}
