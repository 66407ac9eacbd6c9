//! Foreign-memory mappings of guest frames into the local address space.

use std::ops::{Deref, DerefMut};
use std::ptr;

use domdbg_core::domain::{MapProt, MemoryWindow};
use nix::errno::Errno;
use nix::libc;

use super::PAGE_SIZE;
use super::privcmd::{IOCTL_PRIVCMD_MMAPBATCH_V2, Privcmd, PrivcmdMmapBatchV2};
use crate::error::Error;

/// Scoped mapping of a run of guest frames.
///
/// Dereferences to the requested byte range within the mapping. The
/// underlying pages are unmapped on drop, on every exit path, using the
/// same base address and page count that were mapped.
pub struct MappedPages {
    base: *mut u8,
    pages: usize,
    offset: usize,
    len: usize,
}

/// Maps the given guest frames, contiguously, into the local address
/// space.
///
/// `offset`/`len` select the byte range the returned window exposes.
pub fn map_frames(
    privcmd: &Privcmd,
    domid: u32,
    frames: &[u64],
    prot: MapProt,
    offset: usize,
    len: usize,
) -> crate::Result<MappedPages> {
    let pages = frames.len();
    let byte_len = pages * PAGE_SIZE;

    let mut prot_flags = 0;
    if prot.readable() {
        prot_flags |= libc::PROT_READ;
    }
    if prot.writable() {
        prot_flags |= libc::PROT_WRITE;
    }

    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            byte_len,
            prot_flags,
            libc::MAP_SHARED,
            privcmd.raw_fd(),
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(Errno::last().into());
    }

    let arr: Vec<u64> = frames.to_vec();
    let mut err: Vec<i32> = vec![0; pages];

    let mut batch = PrivcmdMmapBatchV2 {
        num: pages as u32,
        dom: domid as u16,
        addr: base as u64,
        arr: arr.as_ptr(),
        err: err.as_mut_ptr(),
    };

    let res = unsafe {
        Errno::result(libc::ioctl(
            privcmd.raw_fd(),
            IOCTL_PRIVCMD_MMAPBATCH_V2,
            &mut batch as *mut PrivcmdMmapBatchV2,
        ))
    };

    if let Err(e) = res {
        unsafe { libc::munmap(base, byte_len) };
        tracing::error!(error = %e, domid, pages, "foreign mapping failed");
        return Err(e.into());
    }

    if let Some(bad) = err.iter().position(|&e| e != 0) {
        unsafe { libc::munmap(base, byte_len) };
        return Err(Error::MapFailed(bad + 1, pages));
    }

    Ok(MappedPages {
        base: base.cast(),
        pages,
        offset,
        len,
    })
}

impl Deref for MappedPages {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(self.offset), self.len) }
    }
}

impl DerefMut for MappedPages {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.add(self.offset), self.len) }
    }
}

impl MemoryWindow for MappedPages {}

impl Drop for MappedPages {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.base.cast(), self.pages * PAGE_SIZE) };

        if res != 0 {
            tracing::error!(
                error = %Errno::last(),
                pages = self.pages,
                "failed to unmap foreign pages"
            );
        }
    }
}
