//! VideoCore mailbox property interface and DMA-coherent memory.
//!
//! The GPU's allocator is the only way to get memory that is physically
//! contiguous across pages and coherent with the DMA engine, so the
//! control-block ring and command words live in buffers allocated here.

use std::io;
use std::ptr;

use anyhow::{bail, Context, Result};

use super::mmio::{PhysMapping, PAGE_SIZE};

const DEV_VCIO: &[u8] = b"/dev/vcio\0";

// Property tags understood by the firmware.
const TAG_MEM_ALLOCATE: u32 = 0x3000c;
const TAG_MEM_LOCK: u32 = 0x3000d;
const TAG_MEM_UNLOCK: u32 = 0x3000e;
const TAG_MEM_RELEASE: u32 = 0x3000f;

// _IOWR(100, 0, char *), assembled by hand so the request number tracks the
// platform's pointer size the way the kernel macro does.
const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> libc::c_ulong {
    ((dir << 30) | ((size & 0x3FFF) << 16) | (ty << 8) | nr) as libc::c_ulong
}

const VCIO_PROPERTY: libc::c_ulong =
    ioc(3, 100, 0, std::mem::size_of::<*mut libc::c_char>() as u64);

/// One open handle on `/dev/vcio`.
struct Mailbox {
    fd: libc::c_int,
}

impl Mailbox {
    fn open() -> Result<Self> {
        let fd = unsafe { libc::open(DEV_VCIO.as_ptr() as *const libc::c_char, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("open /dev/vcio");
        }
        Ok(Self { fd })
    }

    /// Issue one property call and return the first response value.
    fn call(&self, tag: u32, args: &[u32]) -> Result<u32> {
        let mut p = [0u32; 32];
        let mut i = 1;
        p[i] = 0; // process request
        i += 1;
        p[i] = tag;
        i += 1;
        p[i] = (args.len() * 4) as u32; // value buffer size
        i += 1;
        p[i] = (args.len() * 4) as u32; // request size
        i += 1;
        for &arg in args {
            p[i] = arg;
            i += 1;
        }
        p[i] = 0; // end tag
        i += 1;
        p[0] = (i * 4) as u32;

        let rc = unsafe { libc::ioctl(self.fd, VCIO_PROPERTY, p.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .context(format!("mailbox property call {tag:#x}"));
        }
        Ok(p[5])
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// GPU-allocated memory: physically contiguous, DMA-coherent, zero-filled,
/// visible at both a CPU virtual address and a bus address.
pub struct VcMem {
    handle: u32,
    bus: u32,
    pages: usize,
    mapping: PhysMapping,
}

impl VcMem {
    /// Allocate `pages` pages with the revision's mailbox `mem_flag`.
    pub fn allocate(mem_flag: u32, pages: usize) -> Result<Self> {
        let size = (pages * PAGE_SIZE) as u32;
        let mbox = Mailbox::open()?;

        let handle = mbox
            .call(TAG_MEM_ALLOCATE, &[size, PAGE_SIZE as u32, mem_flag])
            .context("allocate GPU memory")?;
        if handle == 0 {
            bail!("GPU memory allocation of {pages} pages refused by firmware");
        }

        let bus = mbox.call(TAG_MEM_LOCK, &[handle]).context("lock GPU memory")?;
        if bus == 0 {
            let _ = mbox.call(TAG_MEM_RELEASE, &[handle]);
            bail!("GPU memory lock failed for handle {handle:#x}");
        }

        // The bus address carries the VideoCore cache alias in its top bits;
        // the ARM-visible physical address is underneath it.
        let mapping = PhysMapping::map(bus & !0xC000_0000, size as usize)
            .context("map GPU memory into the process")?;
        unsafe { ptr::write_bytes(mapping.as_ptr(), 0, size as usize) };

        log::debug!("vc alloc: {pages} pages, handle {handle:#x}, bus {bus:#x}");
        Ok(Self { handle, bus, pages, mapping })
    }

    /// CPU-visible base of the allocation.
    pub fn virt(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    /// Base address as seen by the DMA engine.
    pub fn bus_addr(&self) -> u32 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

impl Drop for VcMem {
    fn drop(&mut self) {
        // The mapping field unmaps itself; the firmware side needs an
        // explicit unlock and release.
        match Mailbox::open() {
            Ok(mbox) => {
                let unlock = mbox.call(TAG_MEM_UNLOCK, &[self.handle]);
                let release = mbox.call(TAG_MEM_RELEASE, &[self.handle]);
                if unlock.is_err() || release.is_err() {
                    log::warn!("failed to release GPU memory handle {:#x}", self.handle);
                }
            }
            Err(e) => log::warn!("mailbox unavailable during release: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_ioctl_number() {
        // Must agree with _IOWR(100, 0, char *) for this platform.
        #[cfg(target_pointer_width = "64")]
        assert_eq!(VCIO_PROPERTY, 0xC008_6400);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(VCIO_PROPERTY, 0xC004_6400);
    }
}
