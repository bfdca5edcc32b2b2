//! Architecture specific code.
//!
//! Everything the portable kernel needs from the machine goes through
//! this module: the interrupt flag, the context switch, finding the
//! running thread, halting until the next timer interrupt and raw
//! console output. The `hosted` backend drives kernel threads on host
//! threads so the whole core runs under the normal test harness, the
//! `x86_64` backend carries the bare metal primitives.

use cfg_if::cfg_if;
use core::sync::atomic::{AtomicBool, Ordering};

cfg_if! {
    if #[cfg(test)] {
        pub mod hosted;
        use hosted as arch;
    } else if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use x86_64 as arch;
    } else {
        pub mod unsupported;
        use unsupported as arch;
    }
}

pub use arch::{
    Context, console_write, context_switch, current_ptr, halt_until_interrupt, interrupts_enabled,
    set_current_ptr,
};

/// Disables interrupts, returning whether they were enabled before.
#[inline]
pub fn disable_interrupts() -> bool {
    let were_enabled = arch::interrupts_enabled();
    if were_enabled {
        unsafe { arch::raw_disable_interrupts() };
    }
    were_enabled
}

/// Restores the interrupt flag to a state previously returned by
/// [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(were_enabled: bool) {
    if were_enabled {
        assert!(!in_interrupt(), "interrupts re-enabled inside a handler");
        unsafe { arch::raw_enable_interrupts() };
    }
}

/// Executes a function with interrupts disabled, once done the previous
/// interrupt state is restored.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let were_enabled = disable_interrupts();
    let result = f();
    restore_interrupts(were_enabled);
    result
}

/// set while an interrupt handler runs, things that may suspend assert
/// against it
static IN_INTERRUPT: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn in_interrupt() -> bool {
    IN_INTERRUPT.load(Ordering::Relaxed)
}

pub(crate) fn enter_interrupt() {
    assert!(!in_interrupt(), "nested interrupt handlers are unsupported");
    IN_INTERRUPT.store(true, Ordering::Relaxed);
}

pub(crate) fn leave_interrupt() {
    IN_INTERRUPT.store(false, Ordering::Relaxed);
}
