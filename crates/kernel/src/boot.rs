//! Kernel bring-up.
//!
//! The platform glue (bootloader, IDT/GDT, timer wiring) hands over two
//! page pools, the swap disk and the boot-time policy flags, everything
//! else in here is portable. The scheduler discipline and the eviction
//! policy are latched once and never change afterwards.

use crate::{
    arch,
    drivers::disk::Disk,
    info,
    memory::{VirtAddr, page_map, palloc},
    scheduler,
    vm::{frame, frame::EvictPolicy, swap},
};

#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// fair-share scheduling instead of the default priority discipline
    pub mlfqs: bool,
    pub evict: EvictPolicy,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            mlfqs: false,
            evict: EvictPolicy::Clock,
        }
    }
}

pub struct BootMemory {
    /// base and page count serving thread pages and kernel data
    pub kernel_pool: (VirtAddr, usize),
    /// base and page count serving user frames
    pub user_pool: (VirtAddr, usize),
    pub swap_disk: &'static dyn Disk,
}

/// Boots the kernel core: pools, frame table, swap, then the scheduler,
/// which adopts the calling thread and enables interrupts.
pub fn boot(config: BootConfig, memory: BootMemory) {
    arch::disable_interrupts();
    #[cfg(test)]
    arch::hosted::reset_idle_watchdog();

    crate::time::reset();
    crate::logging::reset_log_buffer();
    palloc::init(
        memory.kernel_pool.0,
        memory.kernel_pool.1,
        memory.user_pool.0,
        memory.user_pool.1,
    );
    page_map::reset_kernel_map();
    frame::init(config.evict);
    swap::init(memory.swap_disk);

    scheduler::init(config.mlfqs);
    info!(
        "kernel core up: {} kernel pages, {} user pages, {} swap slots, evict {:?}",
        memory.kernel_pool.1,
        memory.user_pool.1,
        swap::slot_count(),
        config.evict
    );
}
