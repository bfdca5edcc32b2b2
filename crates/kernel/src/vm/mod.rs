//! Demand paging.
//!
//! A [`Page`] descriptor exists for every virtual page an address space
//! knows about, whether or not bytes are resident. Descriptors start
//! out uninitialised (a deferred initializer plus the target class) and
//! transform into anonymous or file-backed pages on their first claim.
//! Descriptors are shared across address spaces after a fork, the
//! share list on each page is what copy-on-write and multi-space
//! eviction walk.

pub mod anon;
pub mod file;
pub mod frame;
pub mod spt;
pub mod swap;
pub mod uaccess;


use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::{
    arch,
    memory::{PAGE_SIZE, VirtAddr, page_map, page_map::PageMap},
    thread,
};

use anon::AnonPage;
use file::FilePage;
use frame::{FrameGuard, FrameHold};
use spt::AddressSpace;

/// top of the user stack region
pub const USER_STACK_TOP: VirtAddr = VirtAddr::from(0x8000_0000);
/// how deep the stack may grow below its top
pub const STACK_MAX: usize = 1024 * 1024;

/// faults the window `[rsp - 8, rsp + 32]` around the saved user stack
/// pointer grow the stack instead of killing the process
const STACK_WINDOW_BELOW: usize = 8;
const STACK_WINDOW_ABOVE: usize = 32;

/// an address space mapping this page, share list entry
#[derive(Debug, Clone)]
pub(crate) struct SpaceBinding {
    pub(crate) pm: Arc<PageMap>,
}

impl SpaceBinding {
    fn is(&self, pm: &Arc<PageMap>) -> bool {
        Arc::ptr_eq(&self.pm, pm)
    }
}

/// loads segment bytes into a freshly claimed frame
pub type Loader = Box<dyn FnOnce(VirtAddr) + Send>;

/// what an uninitialised page becomes on first claim
pub(crate) enum UninitTarget {
    Anon { stack: bool },
    File(FilePage),
}

pub(crate) struct Uninit {
    pub(crate) target: UninitTarget,
    /// deferred initializer, owns its captured state until the claim
    /// moves the page to its concrete class
    pub(crate) loader: Option<Loader>,
}

pub(crate) enum Backing {
    Uninit(Uninit),
    Anon(AnonPage),
    File(FilePage),
}

impl core::fmt::Debug for Backing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Backing::Uninit(u) => match u.target {
                UninitTarget::Anon { stack } => write!(f, "Uninit(Anon, stack: {stack})"),
                UninitTarget::File(_) => write!(f, "Uninit(File)"),
            },
            Backing::Anon(a) => write!(f, "Anon(slot: {:?}, stack: {})", a.slot, a.stack),
            Backing::File(_) => write!(f, "File"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PageInner {
    pub(crate) writable: bool,
    pub(crate) frame: Option<FrameHold>,
    /// every address space currently mapping this page
    pub(crate) mappings: Vec<SpaceBinding>,
    pub(crate) backing: Backing,
    /// eviction must pass this page over (a copy is in flight)
    pub(crate) pinned: bool,
}

/// One virtual page of one (or, after forks, several) address spaces.
#[derive(Debug)]
pub struct Page {
    va: VirtAddr,
    inner: crate::utils::locks::SpinLock<PageInner>,
}

// descriptor state sits behind its spin lock, structural transitions
// (frames, share list membership) additionally hold the frame lock
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub(crate) fn new(va: VirtAddr, writable: bool, backing: Backing, pm: Arc<PageMap>) -> Arc<Self> {
        debug_assert!(va.is_page_aligned());
        Arc::new(Self {
            va,
            inner: crate::utils::locks::SpinLock::new(PageInner {
                writable,
                frame: None,
                mappings: alloc::vec![SpaceBinding { pm }],
                backing,
                pinned: false,
            }),
        })
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.inner.lock().writable
    }

    pub fn share_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    pub fn is_resident(&self) -> bool {
        self.inner.lock().frame.is_some()
    }

    pub(crate) fn kva(&self) -> Option<VirtAddr> {
        self.inner.lock().frame.map(|hold| hold.kva)
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.inner.lock().pinned
    }

    pub(crate) fn set_pinned(&self, pinned: bool) {
        self.inner.lock().pinned = pinned;
    }

    /// true when any mapping, or the kernel's, saw an access
    pub(crate) fn accessed_in_any_mapping(&self) -> bool {
        let inner = self.inner.lock();
        inner.mappings.iter().any(|b| b.pm.is_accessed(self.va))
    }

    pub(crate) fn clear_accessed_everywhere(&self) {
        let inner = self.inner.lock();
        for binding in inner.mappings.iter() {
            binding.pm.set_accessed(self.va, false);
        }
    }

    /// eviction: drop the hardware mappings and the frame link
    pub(crate) fn unmap_everywhere(&self) {
        let mut inner = self.inner.lock();
        for binding in inner.mappings.iter() {
            binding.pm.clear(self.va);
        }
        inner.frame = None;
    }

    /// Joins a forking child's address space to the share list.
    /// Returns whether the page was solely owned before, its frame kva
    /// if resident, and its writable flag. Frame lock held.
    pub(crate) fn bind_space(&self, pm: Arc<PageMap>) -> (bool, Option<VirtAddr>, bool) {
        let mut inner = self.inner.lock();
        let was_sole_owner = inner.mappings.len() == 1;
        inner.mappings.push(SpaceBinding { pm });
        (was_sole_owner, inner.frame.map(|hold| hold.kva), inner.writable)
    }

    /// Drops one address space's membership in the share list. When one
    /// holder remains its write access comes back, when none remain the
    /// page's frame and swap slot are freed. Frame lock held.
    pub(crate) fn unbind_space(&self, guard: &FrameGuard, pm: &Arc<PageMap>) {
        let mut inner = self.inner.lock();
        let index = inner
            .mappings
            .iter()
            .position(|b| b.is(pm))
            .expect("address space missing from the share list");
        inner.mappings.remove(index);
        pm.clear(self.va);

        match inner.mappings.len() {
            0 => {
                if let Some(hold) = inner.frame.take() {
                    frame::release(guard, hold);
                }
                if let Backing::Anon(anon) = &mut inner.backing
                    && let Some(slot) = anon.slot.take()
                {
                    swap::free_slot(slot);
                }
            }
            1 => {
                // sole holder again: write access comes back, with the
                // sticky accessed/dirty bits left alone
                if inner.writable && inner.frame.is_some() {
                    inner.mappings[0].pm.set_writable(self.va, true);
                }
            }
            _ => {}
        }
    }
}

enum LoadWork {
    Zero,
    Run(Loader),
    SwapIn(usize),
    FileRead(FilePage),
}

/// Claims a page: resolves it to a frame and loads its contents.
pub(crate) fn do_claim(page: &Arc<Page>) {
    let guard = frame::lock();
    do_claim_locked(&guard, page);
}

/// The claim body, for callers already inside the frame lock.
pub(crate) fn do_claim_locked(guard: &FrameGuard, page: &Arc<Page>) {
    if page.inner.lock().frame.is_some() {
        // somebody claimed it while we waited for the lock
        return;
    }

    let hold = frame::acquire(guard);
    frame::bind(guard, hold, page.clone());

    let (work, bindings, hw_writable) = {
        let mut inner = page.inner.lock();
        inner.frame = Some(hold);

        let work = match &mut inner.backing {
            Backing::Anon(anon) => match anon.slot.take() {
                Some(slot) => LoadWork::SwapIn(slot),
                None => LoadWork::Zero,
            },
            Backing::File(fp) => LoadWork::FileRead(fp.dup_for_io()),
            Backing::Uninit(_) => {
                // first claim: transform into the concrete class, the
                // deferred state moves along with it
                let placeholder = Backing::Anon(AnonPage {
                    slot: None,
                    stack: false,
                });
                let Backing::Uninit(uninit) = core::mem::replace(&mut inner.backing, placeholder)
                else {
                    unreachable!()
                };
                match uninit.target {
                    UninitTarget::Anon { stack } => {
                        inner.backing = Backing::Anon(AnonPage { slot: None, stack });
                        match uninit.loader {
                            Some(loader) => LoadWork::Run(loader),
                            None => LoadWork::Zero,
                        }
                    }
                    UninitTarget::File(fp) => {
                        let work = match uninit.loader {
                            Some(loader) => LoadWork::Run(loader),
                            None => LoadWork::FileRead(fp.dup_for_io()),
                        };
                        inner.backing = Backing::File(fp);
                        work
                    }
                }
            }
        };

        // hardware write access only for a sole writable owner, shared
        // pages fault on write and break their sharing first
        let hw_writable = inner.writable && inner.mappings.len() == 1;
        (work, inner.mappings.clone(), hw_writable)
    };

    for binding in bindings.iter() {
        binding.pm.set(page.va, hold.kva, hw_writable);
    }

    let loaded_from_file = matches!(page.inner.lock().backing, Backing::File(_));
    match work {
        LoadWork::Zero => unsafe {
            core::ptr::write_bytes(hold.kva.into_ptr::<u8>(), 0, PAGE_SIZE);
        },
        LoadWork::Run(loader) => loader(hold.kva),
        LoadWork::SwapIn(slot) => AnonPage::swap_in(slot, hold.kva),
        LoadWork::FileRead(io) => io.read_in(hold.kva),
    }

    if loaded_from_file {
        // a load is not a modification: forget the bits the read set
        for binding in bindings.iter() {
            binding.pm.set_accessed(page.va, false);
            binding.pm.set_dirty(page.va, false);
        }
        page_map::with_kernel_map(|km| {
            km.set_accessed(hold.kva, false);
            km.set_dirty(hold.kva, false);
        });
    } else {
        // the kernel just wrote the frame through its own mapping
        page_map::with_kernel_map(|km| km.set_dirty(hold.kva, true));
    }
}

/// Munmap write-back: a resident file page goes home if anybody
/// dirtied it. Frame lock held.
pub(crate) fn write_back_region_page(page: &Arc<Page>) {
    let mut inner = page.inner.lock();
    let Some(hold) = inner.frame else {
        return;
    };
    let kva = hold.kva;
    let PageInner {
        mappings, backing, ..
    } = &mut *inner;
    if let Backing::File(fp) = backing {
        fp.write_back_if_dirty(page.va, mappings, kva);
    }
}

/// Eviction dispatch: anonymous pages go to swap, file pages go home
/// when dirty. Frame lock held.
pub(crate) fn swap_out_page(page: &Arc<Page>, kva: VirtAddr) {
    let mut inner = page.inner.lock();
    let PageInner {
        mappings, backing, ..
    } = &mut *inner;
    match backing {
        Backing::Anon(anon) => anon.swap_out(kva),
        Backing::File(fp) => fp.write_back_if_dirty(page.va, mappings, kva),
        Backing::Uninit(_) => unreachable!("uninit pages are never resident"),
    }
}

/// why a fault could not be resolved, the process dies for these
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("unmapped address outside the stack window")]
    Unmapped,
    #[error("write to a page that is not writable")]
    Protection,
}

/// Resolves a page fault: lazy load, swap-in, stack growth or
/// copy-on-write. `not_present` distinguishes a missing translation
/// from a write-protection fault. May suspend on the frame lock and on
/// backing IO, so never callable from interrupt context.
pub fn handle_fault(addr: VirtAddr, write: bool, not_present: bool) -> Result<(), FaultError> {
    assert!(!arch::in_interrupt(), "page fault in interrupt context");

    let cur = thread::current();
    let space = cur.address_space().ok_or(FaultError::Unmapped)?;
    let va = addr.page_base();

    if let Some(page) = space.find(va) {
        if not_present {
            if write && !page.writable() {
                return Err(FaultError::Protection);
            }
            do_claim(&page);
            Ok(())
        } else if write {
            if page.writable() {
                cow_break(space, &page);
                Ok(())
            } else {
                Err(FaultError::Protection)
            }
        } else {
            // present and readable yet faulting reads, nothing we can fix
            Err(FaultError::Unmapped)
        }
    } else if stack_window_allows(addr, cur.user_rsp()) {
        grow_stack(space, va);
        Ok(())
    } else {
        Err(FaultError::Unmapped)
    }
}

fn stack_limit() -> VirtAddr {
    USER_STACK_TOP - STACK_MAX
}

fn stack_window_allows(addr: VirtAddr, rsp: VirtAddr) -> bool {
    if rsp.is_null() || addr < stack_limit() || addr >= USER_STACK_TOP {
        return false;
    }
    let low = rsp.checked_sub(STACK_WINDOW_BELOW).unwrap_or(VirtAddr::null());
    addr >= low && addr <= rsp + STACK_WINDOW_ABOVE
}

/// Allocates anonymous stack pages from the faulting page up to (never
/// overlapping) the next page the space already knows.
fn grow_stack(space: &mut AddressSpace, fault_page: VirtAddr) {
    let mut va = fault_page;
    while va < USER_STACK_TOP && space.find(va).is_none() {
        space
            .alloc_anon(va, true, true, None)
            .expect("stack page collided with an existing mapping");
        space.claim(va);
        va += PAGE_SIZE;
    }
}

/// Breaks the sharing on a write-faulted page: the faulting space gets
/// a private writable copy, the source loses one share-list entry.
fn cow_break(space: &mut AddressSpace, page: &Arc<Page>) {
    let guard = frame::lock();
    let pm = space.pm_arc();

    if page.share_count() == 1 {
        // the other holders vanished while we waited for the lock, the
        // page is private again and may simply become writable
        if page.is_resident() {
            pm.set_writable(page.va, true);
        }
        return;
    }

    // the source may have been evicted before we got here, its bytes
    // have to be resident to be copied
    do_claim_locked(&guard, page);
    page.set_pinned(true);

    let hold = frame::acquire(&guard);
    let src_kva = page.kva().expect("pinned source lost its frame");
    unsafe {
        core::ptr::copy_nonoverlapping(
            src_kva.into_ptr::<u8>(),
            hold.kva.into_ptr::<u8>(),
            PAGE_SIZE,
        );
    }
    page_map::with_kernel_map(|km| km.set_dirty(hold.kva, true));

    // a fresh descriptor carrying a copy of the source's class state
    let backing = {
        let inner = page.inner.lock();
        match &inner.backing {
            Backing::Anon(anon) => Backing::Anon(AnonPage {
                slot: None,
                stack: anon.stack,
            }),
            Backing::File(fp) => Backing::File(fp.dup_for_io()),
            Backing::Uninit(_) => unreachable!("write fault on an uninitialised page"),
        }
    };
    let copy = Page::new(page.va, true, backing, pm.clone());
    {
        let mut inner = copy.inner.lock();
        inner.frame = Some(hold);
    }
    frame::bind(&guard, hold, copy.clone());

    // leave the source's share list, restoring the remaining holder's
    // write access if the count drops back to one
    page.unbind_space(&guard, &pm);
    page.set_pinned(false);

    space.replace_page(page.va, copy.clone());
    pm.set(page.va, hold.kva, true);
}
