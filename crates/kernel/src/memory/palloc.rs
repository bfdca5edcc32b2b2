//! Page-granular allocator over two fixed pools.
//!
//! The kernel pool serves thread control blocks (one full page per
//! thread, descriptor at the bottom, stack growing down toward it), the
//! user pool serves the frames user pages live in. Running the user pool
//! dry is how frame eviction gets exercised, running the kernel pool dry
//! is fatal.

use bitflags::bitflags;

use super::{PAGE_SIZE, VirtAddr};
use crate::utils::{bitmap::Bitmap, locks::SpinLock};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// allocate from the user pool instead of the kernel pool
        const USER = 1;
        /// zero the page before returning it
        const ZERO = 1 << 1;
    }
}

#[derive(Debug)]
pub(crate) struct Pool {
    name: &'static str,
    base: VirtAddr,
    pages: usize,
    used: Bitmap,
}

impl Pool {
    pub(crate) fn new(name: &'static str, base: VirtAddr, pages: usize) -> Self {
        assert!(base.is_page_aligned(), "pool base must be page aligned");
        Self {
            name,
            base,
            pages,
            used: Bitmap::new(pages),
        }
    }

    pub(crate) fn get_pages(&mut self, count: usize) -> Option<VirtAddr> {
        let first = self.used.scan_and_flip(0, count, false)?;
        Some(self.base + first * PAGE_SIZE)
    }

    pub(crate) fn free_pages(&mut self, kva: VirtAddr, count: usize) {
        assert!(kva.is_page_aligned());
        let first = (kva - self.base) / PAGE_SIZE;
        assert!(first + count <= self.pages, "free outside {} pool", self.name);
        for page in first..first + count {
            assert!(self.used.test(page), "double free in {} pool", self.name);
            self.used.set(page, false);
        }
    }

    fn contains(&self, kva: VirtAddr) -> bool {
        kva >= self.base && kva < self.base + self.pages * PAGE_SIZE
    }

    fn free_count(&self) -> usize {
        self.pages - self.used.count_set()
    }
}

struct Pools {
    kernel: Pool,
    user: Pool,
}

static POOLS: SpinLock<Option<Pools>> = SpinLock::new(None);

/// hands the allocator its two pools, replacing whatever it had before
pub fn init(kernel_base: VirtAddr, kernel_pages: usize, user_base: VirtAddr, user_pages: usize) {
    let pools = Pools {
        kernel: Pool::new("kernel", kernel_base, kernel_pages),
        user: Pool::new("user", user_base, user_pages),
    };
    *POOLS.lock() = Some(pools);
}

fn with_pools<R>(f: impl FnOnce(&mut Pools) -> R) -> R {
    let mut guard = POOLS.lock();
    f(guard.as_mut().expect("page allocator used before init"))
}

/// allocates one page, returning its kernel virtual address
pub fn get_page(flags: AllocFlags) -> Option<VirtAddr> {
    get_pages(flags, 1)
}

/// allocates `count` contiguous pages
pub fn get_pages(flags: AllocFlags, count: usize) -> Option<VirtAddr> {
    let kva = with_pools(|pools| {
        let pool = if flags.contains(AllocFlags::USER) {
            &mut pools.user
        } else {
            &mut pools.kernel
        };
        pool.get_pages(count)
    })?;

    if flags.contains(AllocFlags::ZERO) {
        unsafe {
            core::ptr::write_bytes(kva.into_ptr::<u8>(), 0, count * PAGE_SIZE);
        }
    }
    Some(kva)
}

pub fn free_page(kva: VirtAddr) {
    free_pages(kva, 1)
}

pub fn free_pages(kva: VirtAddr, count: usize) {
    with_pools(|pools| {
        if pools.kernel.contains(kva) {
            pools.kernel.free_pages(kva, count)
        } else if pools.user.contains(kva) {
            pools.user.free_pages(kva, count)
        } else {
            panic!("freed page {kva:?} belongs to no pool");
        }
    })
}

/// free pages remaining in the user pool
pub fn user_pages_free() -> usize {
    with_pools(|pools| pools.user.free_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    fn scratch_pool(pages: usize) -> (Pool, VirtAddr) {
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = VirtAddr::from_ptr(unsafe { std::alloc::alloc(layout) });
        (Pool::new("scratch", base, pages), base)
    }

    #[test]
    fn pages_come_back_in_order() {
        let (mut pool, base) = scratch_pool(4);
        let a = pool.get_pages(1).unwrap();
        let b = pool.get_pages(1).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base + PAGE_SIZE);

        pool.free_pages(a, 1);
        assert_eq!(pool.get_pages(1).unwrap(), a);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (mut pool, _) = scratch_pool(2);
        assert!(pool.get_pages(1).is_some());
        assert!(pool.get_pages(2).is_none());
        assert!(pool.get_pages(1).is_some());
        assert!(pool.get_pages(1).is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let (mut pool, _) = scratch_pool(2);
        let page = pool.get_pages(1).unwrap();
        pool.free_pages(page, 1);
        pool.free_pages(page, 1);
    }
}
