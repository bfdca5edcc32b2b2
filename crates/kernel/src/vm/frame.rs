//! The global frame table.
//!
//! Every physical page backing a user page is recorded here, in
//! eviction order. One blocking lock guards all structural mutation of
//! the virtual memory state: frame allocation, eviction, copy-on-write
//! breaking, address space teardown. It is a real [`crate::sync::Lock`],
//! so a page-faulting thread waiting for it donates its priority like
//! any other waiter.

use alloc::{sync::Arc, vec::Vec};
use slab::Slab;

use crate::{
    memory::{
        VirtAddr, page_map,
        palloc::{self, AllocFlags},
    },
    sync::Lock,
    utils::locks::SpinLock,
    vm::Page,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictPolicy {
    /// oldest frame by insertion order
    Fifo,
    /// one pass moving accessed frames to the tail (clearing the bit),
    /// then fifo
    LenientLru,
    /// circular second chance with a persistent hand
    Clock,
}

/// a frame held by a page, key into the table plus the frame's kva
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHold {
    pub(crate) key: usize,
    pub(crate) kva: VirtAddr,
}

#[derive(Debug)]
struct FrameSlot {
    kva: VirtAddr,
    page: Option<Arc<Page>>,
}

struct FrameTable {
    slots: Slab<FrameSlot>,
    /// eviction order, front is the next candidate (the clock hand)
    order: Vec<usize>,
    policy: EvictPolicy,
}

struct TableCell(core::cell::UnsafeCell<Option<FrameTable>>);

// guarded by the frame lock
unsafe impl Sync for TableCell {}

static TABLE: TableCell = TableCell(core::cell::UnsafeCell::new(None));

/// replaced wholesale on every boot so stale state cannot leak across
/// reboots of the kernel
static FRAME_LOCK: SpinLock<Option<&'static Lock>> = SpinLock::new(None);

pub fn init(policy: EvictPolicy) {
    *FRAME_LOCK.lock() = Some(alloc::boxed::Box::leak(alloc::boxed::Box::new(Lock::new())));
    unsafe {
        *TABLE.0.get() = Some(FrameTable {
            slots: Slab::new(),
            order: Vec::new(),
            policy,
        });
    }
}

fn the_lock() -> &'static Lock {
    (*FRAME_LOCK.lock()).expect("frame table used before init")
}

/// RAII hold on the frame lock.
pub(crate) struct FrameGuard(&'static Lock);

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub(crate) fn lock() -> FrameGuard {
    let lock = the_lock();
    lock.acquire();
    FrameGuard(lock)
}

fn table() -> &'static mut FrameTable {
    debug_assert!(
        the_lock().held_by_current(),
        "frame table touched without the frame lock"
    );
    unsafe { &mut *TABLE.0.get() }
        .as_mut()
        .expect("frame table used before init")
}

/// Produces a free frame, evicting a victim when the user pool is dry.
/// The caller links it to a page right away. Frame lock held.
pub(crate) fn acquire(_guard: &FrameGuard) -> FrameHold {
    if let Some(kva) = palloc::get_page(AllocFlags::USER | AllocFlags::ZERO) {
        let t = table();
        let key = t.slots.insert(FrameSlot { kva, page: None });
        t.order.push(key);
        // the kernel reaches every resident frame through its own map
        page_map::with_kernel_map(|km| km.set(kva, kva, true));
        return FrameHold { key, kva };
    }
    evict()
}

/// records which page occupies the frame
pub(crate) fn bind(_guard: &FrameGuard, hold: FrameHold, page: Arc<Page>) {
    let slot = &mut table().slots[hold.key];
    debug_assert!(slot.page.is_none(), "frame bound twice");
    slot.page = Some(page);
}

/// Returns the frame of a dead page to the allocator. Frame lock held.
pub(crate) fn release(_guard: &FrameGuard, hold: FrameHold) {
    let t = table();
    t.slots.remove(hold.key);
    t.order.retain(|&key| key != hold.key);
    page_map::with_kernel_map(|km| km.clear(hold.kva));
    palloc::free_page(hold.kva);
}

fn slot_accessed(slot: &FrameSlot) -> bool {
    let page = slot.page.as_ref().unwrap();
    page.accessed_in_any_mapping() || page_map::with_kernel_map(|km| km.is_accessed(slot.kva))
}

fn clear_accessed(slot: &FrameSlot) {
    slot.page.as_ref().unwrap().clear_accessed_everywhere();
    page_map::with_kernel_map(|km| km.set_accessed(slot.kva, false));
}

/// a frame the policies must pass over: unbound (mid-allocation) or
/// pinned for a copy in progress
fn unevictable(slot: &FrameSlot) -> bool {
    match slot.page.as_ref() {
        None => true,
        Some(page) => page.is_pinned(),
    }
}

fn choose_victim(t: &mut FrameTable) -> usize {
    let len = t.order.len();
    assert!(len > 0, "nothing to evict and the user pool is empty");

    match t.policy {
        EvictPolicy::Fifo => {}
        EvictPolicy::LenientLru => {
            // one full pass: every accessed frame loses the bit and
            // moves to the tail, the rest keep their relative order
            let mut kept = Vec::with_capacity(len);
            let mut moved = Vec::new();
            for key in core::mem::take(&mut t.order) {
                let slot = &t.slots[key];
                if !unevictable(slot) && slot_accessed(slot) {
                    clear_accessed(slot);
                    moved.push(key);
                } else {
                    kept.push(key);
                }
            }
            kept.extend(moved);
            t.order = kept;
        }
        EvictPolicy::Clock => {
            // sweep the hand, giving accessed frames their second chance
            for _ in 0..2 * len {
                let slot = &t.slots[t.order[0]];
                if unevictable(slot) {
                    t.order.rotate_left(1);
                } else if slot_accessed(slot) {
                    clear_accessed(slot);
                    t.order.rotate_left(1);
                } else {
                    break;
                }
            }
        }
    }

    // fifo from the front, passing over frames we must not touch
    for _ in 0..len {
        let key = t.order[0];
        if !unevictable(&t.slots[key]) {
            t.order.remove(0);
            return key;
        }
        t.order.rotate_left(1);
    }
    panic!("every frame is pinned, nothing to evict");
}

/// Evicts a victim frame: swaps its page out, unmaps it everywhere and
/// hands the now-free frame over. Frame lock held.
fn evict() -> FrameHold {
    let t = table();
    let key = choose_victim(t);
    let kva = t.slots[key].kva;
    let page = t.slots[key].page.take().expect("victim frame has no page");

    super::swap_out_page(&page, kva);
    page.unmap_everywhere();

    // fresh frame: forget its previous life
    page_map::with_kernel_map(|km| {
        km.set_accessed(kva, false);
        km.set_dirty(kva, false);
    });
    t.order.push(key);
    FrameHold { key, kva }
}

/// frames currently holding a page, test observability
pub fn resident_count() -> usize {
    let _guard = lock();
    table().slots.iter().filter(|(_, s)| s.page.is_some()).count()
}
