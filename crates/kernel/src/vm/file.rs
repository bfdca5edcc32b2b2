//! File-backed pages and mmap regions.

use crate::{
    fs::File,
    memory::{PAGE_SIZE, VirtAddr, page_map},
};

use super::SpaceBinding;

#[derive(Debug)]
pub(crate) struct FilePage {
    pub(crate) file: File,
    pub(crate) offset: usize,
    /// bytes read from the file, the rest of the page is zero filled
    pub(crate) valid: usize,
    pub(crate) zeroed: usize,
}

impl FilePage {
    /// an IO view of the same state, used to read or write outside the
    /// page lock
    pub(crate) fn dup_for_io(&self) -> FilePage {
        FilePage {
            file: self.file.duplicate(),
            offset: self.offset,
            valid: self.valid,
            zeroed: self.zeroed,
        }
    }

    /// fills a frame: seek, read the valid bytes, zero the tail
    pub(crate) fn read_in(&self, kva: VirtAddr) {
        debug_assert!(self.valid + self.zeroed == PAGE_SIZE);
        let frame = unsafe { core::slice::from_raw_parts_mut(kva.into_ptr::<u8>(), PAGE_SIZE) };
        self.file.seek(self.offset);
        let read = self.file.read(&mut frame[..self.valid]);
        frame[read..].fill(0);
    }

    /// Writes the page back to its file offset, but only when either
    /// the user or the kernel dirty bit is set: the kernel touches
    /// frames through its own mapping (loads, copies), and that must
    /// count as dirtying too.
    pub(crate) fn write_back_if_dirty(
        &mut self,
        va: VirtAddr,
        mappings: &[SpaceBinding],
        kva: VirtAddr,
    ) {
        let user_dirty = mappings.iter().any(|b| b.pm.is_dirty(va));
        let kernel_dirty = page_map::with_kernel_map(|km| km.is_dirty(kva));
        if !user_dirty && !kernel_dirty {
            return;
        }

        let frame = unsafe { core::slice::from_raw_parts(kva.into_ptr::<u8>(), PAGE_SIZE) };
        self.file.seek(self.offset);
        self.file.write(&frame[..self.valid]);

        for binding in mappings {
            binding.pm.set_dirty(va, false);
        }
        page_map::with_kernel_map(|km| km.set_dirty(kva, false));
    }
}

/// A live memory mapping of a file. Owns the handle `mmap` reopened, so
/// the backing survives a user-level close of the original descriptor,
/// and dropping the region is the single place the handle gets closed.
#[derive(Debug)]
pub struct MmapRegion {
    pub(crate) file: File,
    pub(crate) base: VirtAddr,
    pub(crate) page_count: usize,
}

impl MmapRegion {
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// a fork duplicate with a freshly reopened handle
    pub(crate) fn fork_clone(&self) -> MmapRegion {
        MmapRegion {
            file: self.file.reopen(),
            base: self.base,
            page_count: self.page_count,
        }
    }
}

/// things that can go wrong setting up or tearing down a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmapError {
    #[error("mapping address is null or not page aligned")]
    BadAddress,
    #[error("mapping length is zero")]
    EmptyMapping,
    #[error("offset not page aligned or past the end of the file")]
    BadOffset,
    #[error("mapping overlaps an existing page")]
    Overlap,
    #[error("no mapping at this base address")]
    NoSuchMapping,
}
