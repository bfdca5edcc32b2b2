//! The supplemental page table: what an address space knows about its
//! virtual pages beyond the hardware mapping, plus its mmap regions.

use alloc::sync::Arc;
use hashbrown::HashMap;

use crate::{
    fs::File,
    memory::{PAGE_SIZE, VirtAddr, align_up, page_map::PageMap},
};

use super::{
    Backing, Loader, Page, Uninit, UninitTarget,
    file::{FilePage, MmapError, MmapRegion},
    frame,
};

/// inserting a page at an occupied address
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("virtual page already allocated")]
pub struct VaOccupied;

pub struct AddressSpace {
    pm: Arc<PageMap>,
    /// page descriptors by virtual address, each address unique
    pages: HashMap<VirtAddr, Arc<Page>>,
    /// mmap regions by base address
    mmaps: HashMap<VirtAddr, MmapRegion>,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pages", &self.pages.len())
            .field("mmaps", &self.mmaps.len())
            .finish()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            pm: Arc::new(PageMap::new()),
            pages: HashMap::new(),
            mmaps: HashMap::new(),
        }
    }

    pub fn page_map(&self) -> &PageMap {
        &*self.pm
    }

    pub(crate) fn pm_arc(&self) -> Arc<PageMap> {
        self.pm.clone()
    }

    pub fn find(&self, va: VirtAddr) -> Option<Arc<Page>> {
        self.pages.get(&va.page_base()).cloned()
    }

    pub(crate) fn replace_page(&mut self, va: VirtAddr, page: Arc<Page>) {
        self.pages.insert(va, page);
    }

    fn insert_new(&mut self, va: VirtAddr, writable: bool, backing: Backing) -> Result<(), VaOccupied> {
        let va = va.page_base();
        if self.pages.contains_key(&va) {
            return Err(VaOccupied);
        }
        let page = Page::new(va, writable, backing, self.pm.clone());
        self.pages.insert(va, page);
        Ok(())
    }

    /// Allocates an uninitialised anonymous page. Nothing is mapped in
    /// hardware until the first claim. `loader` runs on that claim with
    /// the frame's kva, absent it the frame is zeroed (stack pages).
    pub fn alloc_anon(
        &mut self,
        va: VirtAddr,
        writable: bool,
        stack: bool,
        loader: Option<Loader>,
    ) -> Result<(), VaOccupied> {
        self.insert_new(
            va,
            writable,
            Backing::Uninit(Uninit {
                target: UninitTarget::Anon { stack },
                loader,
            }),
        )
    }

    /// Allocates an uninitialised file-backed page reading `valid`
    /// bytes at `offset`, the tail zero filled.
    pub fn alloc_file(
        &mut self,
        va: VirtAddr,
        writable: bool,
        file: File,
        offset: usize,
        valid: usize,
    ) -> Result<(), VaOccupied> {
        self.insert_new(
            va,
            writable,
            Backing::Uninit(Uninit {
                target: UninitTarget::File(FilePage {
                    file,
                    offset,
                    valid,
                    zeroed: PAGE_SIZE - valid,
                }),
                loader: None,
            }),
        )
    }

    /// Resolves the page at `va` to a frame right now.
    pub fn claim(&self, va: VirtAddr) -> bool {
        match self.find(va) {
            Some(page) => {
                super::do_claim(&page);
                true
            }
            None => false,
        }
    }

    /// Maps `length` bytes of `file` starting at `offset` to `addr`.
    ///
    /// The region owns a reopened handle so the mapping survives the
    /// caller closing theirs. Returns the base address.
    pub fn mmap(
        &mut self,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &File,
        offset: usize,
    ) -> Result<VirtAddr, MmapError> {
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(MmapError::BadAddress);
        }
        if length == 0 {
            return Err(MmapError::EmptyMapping);
        }
        if offset % PAGE_SIZE != 0 || offset > file.length() {
            return Err(MmapError::BadOffset);
        }

        let page_count = align_up(length, PAGE_SIZE) / PAGE_SIZE;
        for index in 0..page_count {
            if self.pages.contains_key(&(addr + index * PAGE_SIZE)) {
                return Err(MmapError::Overlap);
            }
        }

        let region_file = file.reopen();
        let mut remaining = length.min(file.length() - offset);
        for index in 0..page_count {
            let valid = remaining.min(PAGE_SIZE);
            remaining -= valid;
            // every page carries its own cursor onto the shared identity
            self.alloc_file(
                addr + index * PAGE_SIZE,
                writable,
                region_file.duplicate(),
                offset + index * PAGE_SIZE,
                valid,
            )
            .expect("mmap pages vanished between overlap check and insert");
        }

        self.mmaps.insert(
            addr,
            MmapRegion {
                file: region_file,
                base: addr,
                page_count,
            },
        );
        Ok(addr)
    }

    /// Unmaps the region based at `addr`: resident dirty pages go back
    /// to the file, every covered page leaves this space, the reopened
    /// handle closes with the region.
    pub fn munmap(&mut self, addr: VirtAddr) -> Result<(), MmapError> {
        let region = self.mmaps.remove(&addr).ok_or(MmapError::NoSuchMapping)?;
        let guard = frame::lock();
        self.remove_region_locked(&guard, region);
        Ok(())
    }

    /// frame lock held, consumes (and thereby closes) the region
    fn remove_region_locked(&mut self, guard: &frame::FrameGuard, region: MmapRegion) {
        for index in 0..region.page_count {
            let va = region.base + index * PAGE_SIZE;
            let page = self
                .pages
                .remove(&va)
                .expect("mmap region lost one of its pages");
            super::write_back_region_page(&page);
            page.unbind_space(guard, &self.pm);
        }
    }

    /// Forks this space: every page descriptor is shared by pointer
    /// with the child and write access is withdrawn so the first write
    /// on either side breaks the sharing. Mmap regions are duplicated
    /// with freshly reopened handles.
    pub fn fork(&self) -> AddressSpace {
        let child = AddressSpace::new();
        let guard = frame::lock();
        self.fork_into(&guard, child)
    }

    fn fork_into(&self, _guard: &frame::FrameGuard, mut child: AddressSpace) -> AddressSpace {
        for (&va, page) in self.pages.iter() {
            let (was_sole_owner, resident, writable) = page.bind_space(child.pm.clone());
            if was_sole_owner && writable {
                // first crossing from one owner to two: the original
                // loses hardware write access, dirty and accessed stay
                self.pm.set_writable(va, false);
            }
            if let Some(kva) = resident {
                child.pm.set(va, kva, false);
            }
            child.pages.insert(va, page.clone());
        }
        for (&base, region) in self.mmaps.iter() {
            child.mmaps.insert(base, region.fork_clone());
        }
        child
    }

    pub fn mmap_region(&self, addr: VirtAddr) -> Option<&MmapRegion> {
        self.mmaps.get(&addr)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressSpace {
    /// Tears the space down: mmap regions first (their dirty pages are
    /// written back and their handles closed), then every remaining
    /// page leaves this space's share list.
    fn drop(&mut self) {
        let guard = frame::lock();
        let regions: alloc::vec::Vec<MmapRegion> =
            self.mmaps.drain().map(|(_, region)| region).collect();
        for region in regions {
            self.remove_region_locked(&guard, region);
        }
        for (_, page) in self.pages.drain() {
            page.unbind_space(&guard, &self.pm);
        }
    }
}
