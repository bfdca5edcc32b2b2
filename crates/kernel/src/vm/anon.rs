//! Anonymous pages: no backing object, evicted copies live in swap.

use crate::memory::VirtAddr;

use super::swap;

#[derive(Debug)]
pub(crate) struct AnonPage {
    /// swap slot holding the evicted copy, `None` while resident or
    /// never evicted
    pub(crate) slot: Option<usize>,
    /// grown as part of the user stack
    pub(crate) stack: bool,
}

impl AnonPage {
    /// evicts the page's bytes into a fresh swap slot
    pub(crate) fn swap_out(&mut self, kva: VirtAddr) {
        debug_assert!(self.slot.is_none(), "anon page already has a swap slot");
        let slot = swap::alloc_slot();
        swap::write_slot(slot, kva);
        self.slot = Some(slot);
    }

    /// brings the bytes back from swap and releases the slot
    pub(crate) fn swap_in(slot: usize, kva: VirtAddr) {
        swap::read_slot(slot, kva);
        swap::free_slot(slot);
    }
}
