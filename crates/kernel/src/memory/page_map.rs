//! Per-address-space page maps.
//!
//! This is the hardware translation contract (`get/set/clear`, the
//! accessed/dirty/writable bits) kept as a software map. The MMU glue
//! that mirrors entries into real page tables lives with the platform
//! bring-up, outside the core: everything here is what the rest of the
//! kernel is allowed to know about a mapping.

use bitflags::bitflags;
use hashbrown::HashMap;

use super::VirtAddr;
use crate::utils::locks::SpinLock;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const WRITABLE = 1;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kva: VirtAddr,
    flags: EntryFlags,
}

/// why a software walk refused an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    NotPresent,
    ReadOnly,
}

#[derive(Debug)]
pub struct PageMap {
    entries: SpinLock<HashMap<VirtAddr, Entry>>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(HashMap::new()),
        }
    }

    /// returns the frame kva `va` maps to, if present
    pub fn get(&self, va: VirtAddr) -> Option<VirtAddr> {
        debug_assert!(va.is_page_aligned());
        self.entries.lock().get(&va).map(|e| e.kva)
    }

    /// installs or replaces the mapping for `va`
    pub fn set(&self, va: VirtAddr, kva: VirtAddr, writable: bool) {
        debug_assert!(va.is_page_aligned());
        let mut flags = EntryFlags::empty();
        if writable {
            flags |= EntryFlags::WRITABLE;
        }
        self.entries.lock().insert(va, Entry { kva, flags });
    }

    pub fn clear(&self, va: VirtAddr) {
        debug_assert!(va.is_page_aligned());
        self.entries.lock().remove(&va);
    }

    fn flag(&self, va: VirtAddr, flag: EntryFlags) -> bool {
        self.entries
            .lock()
            .get(&va)
            .is_some_and(|e| e.flags.contains(flag))
    }

    fn set_flag(&self, va: VirtAddr, flag: EntryFlags, value: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&va) {
            entry.flags.set(flag, value);
        }
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.flag(va, EntryFlags::ACCESSED)
    }

    pub fn set_accessed(&self, va: VirtAddr, value: bool) {
        self.set_flag(va, EntryFlags::ACCESSED, value)
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.flag(va, EntryFlags::DIRTY)
    }

    pub fn set_dirty(&self, va: VirtAddr, value: bool) {
        self.set_flag(va, EntryFlags::DIRTY, value)
    }

    pub fn is_writable(&self, va: VirtAddr) -> bool {
        self.flag(va, EntryFlags::WRITABLE)
    }

    /// flips only the writable bit, the accessed and dirty bits survive
    pub fn set_writable(&self, va: VirtAddr, value: bool) {
        self.set_flag(va, EntryFlags::WRITABLE, value)
    }

    /// the walk the access paths use: refuses missing or read-only
    /// mappings, marks accessed (and dirty for writes) on success
    pub fn walk(&self, va: VirtAddr, write: bool) -> Result<VirtAddr, WalkError> {
        let page = va.page_base();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&page).ok_or(WalkError::NotPresent)?;
        if write && !entry.flags.contains(EntryFlags::WRITABLE) {
            return Err(WalkError::ReadOnly);
        }
        entry.flags |= EntryFlags::ACCESSED;
        if write {
            entry.flags |= EntryFlags::DIRTY;
        }
        Ok(entry.kva + va.page_offset())
    }

    pub fn mapping_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's own map. Frames are recorded here at their kva while
/// resident so writes the kernel makes through its mapping (swap-in,
/// copy-on-write) show up in the dual dirty check.
static KERNEL_MAP: SpinLock<Option<PageMap>> = SpinLock::new(None);

pub fn reset_kernel_map() {
    *KERNEL_MAP.lock() = Some(PageMap::new());
}

pub fn with_kernel_map<R>(f: impl FnOnce(&PageMap) -> R) -> R {
    let guard = KERNEL_MAP.lock();
    f(guard.as_ref().expect("kernel page map used before init"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn walk_tracks_accessed_and_dirty() {
        let pm = PageMap::new();
        let va = VirtAddr::from(0x4000_0000);
        let kva = VirtAddr::from(0x1000);
        pm.set(va, kva, true);

        assert!(!pm.is_accessed(va));
        assert_eq!(pm.walk(va + 7, false), Ok(kva + 7));
        assert!(pm.is_accessed(va) && !pm.is_dirty(va));

        assert_eq!(pm.walk(va, true), Ok(kva));
        assert!(pm.is_dirty(va));
    }

    #[test]
    fn read_only_mapping_refuses_writes() {
        let pm = PageMap::new();
        let va = VirtAddr::from(0x4000_0000);
        pm.set(va, VirtAddr::from(0x2000), false);

        assert_eq!(pm.walk(va, true), Err(WalkError::ReadOnly));
        assert_eq!(pm.walk(va + PAGE_SIZE, false), Err(WalkError::NotPresent));

        // write protect toggling preserves the sticky bits
        pm.walk(va, false).unwrap();
        pm.set_writable(va, true);
        assert!(pm.is_accessed(va));
        assert_eq!(pm.walk(va, true), Ok(VirtAddr::from(0x2000)));
    }
}
