//! The swap store: fixed-size slots on the swap disk, one evicted
//! anonymous page per slot, tracked by a global bitmap.

use crate::{
    drivers::disk::{Disk, SECTOR_SIZE},
    memory::{PAGE_SIZE, VirtAddr},
    utils::{bitmap::Bitmap, locks::SpinLock},
};

/// sectors per swap slot
pub const SLOT_SECTORS: usize = PAGE_SIZE / SECTOR_SIZE;

struct SwapTable {
    disk: &'static dyn Disk,
    used: Bitmap,
}

static SWAP: SpinLock<Option<SwapTable>> = SpinLock::new(None);

/// points the swap store at its disk, slot 0 starts right at sector 0
pub fn init(disk: &'static dyn Disk) {
    let slots = disk.sector_count() / SLOT_SECTORS;
    *SWAP.lock() = Some(SwapTable {
        disk,
        used: Bitmap::new(slots),
    });
}

fn with_swap<R>(f: impl FnOnce(&mut SwapTable) -> R) -> R {
    let mut guard = SWAP.lock();
    f(guard.as_mut().expect("swap used before init"))
}

/// claims a free slot, running out of swap is fatal
pub(crate) fn alloc_slot() -> usize {
    with_swap(|swap| swap.used.scan_and_flip(0, 1, false)).expect("out of swap slots")
}

pub(crate) fn free_slot(slot: usize) {
    with_swap(|swap| {
        assert!(swap.used.test(slot), "freed swap slot {slot} twice");
        swap.used.set(slot, false);
    })
}

/// writes a whole frame into `slot`, sector by sector
pub(crate) fn write_slot(slot: usize, kva: VirtAddr) {
    with_swap(|swap| {
        for sector in 0..SLOT_SECTORS {
            let buf = unsafe {
                &*(kva + sector * SECTOR_SIZE).into_ptr::<[u8; SECTOR_SIZE]>()
            };
            swap.disk.write(slot * SLOT_SECTORS + sector, buf);
        }
    })
}

/// reads `slot` back into a frame
pub(crate) fn read_slot(slot: usize, kva: VirtAddr) {
    with_swap(|swap| {
        for sector in 0..SLOT_SECTORS {
            let buf = unsafe {
                &mut *(kva + sector * SECTOR_SIZE).into_ptr::<[u8; SECTOR_SIZE]>()
            };
            swap.disk.read(slot * SLOT_SECTORS + sector, buf);
        }
    })
}

/// slots currently holding a page, test observability
pub fn slots_used() -> usize {
    with_swap(|swap| swap.used.count_set())
}

pub fn slot_count() -> usize {
    with_swap(|swap| swap.used.len())
}
