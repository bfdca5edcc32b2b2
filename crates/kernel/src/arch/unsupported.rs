//! Stubs for architectures the kernel has not been brought up on.

use crate::memory::VirtAddr;

pub fn interrupts_enabled() -> bool {
    unimplemented!("unsupported architecture")
}

pub(super) unsafe fn raw_disable_interrupts() {
    unimplemented!("unsupported architecture")
}

pub(super) unsafe fn raw_enable_interrupts() {
    unimplemented!("unsupported architecture")
}

pub fn current_ptr() -> *mut () {
    unimplemented!("unsupported architecture")
}

pub fn set_current_ptr(_ptr: *mut ()) {
    unimplemented!("unsupported architecture")
}

pub fn halt_until_interrupt() {
    unimplemented!("unsupported architecture")
}

pub fn console_write(_s: &str) {}

#[derive(Debug)]
pub struct Context;

impl Context {
    pub fn new_spawned(_stack_top: VirtAddr) -> Self {
        unimplemented!("unsupported architecture")
    }

    pub fn adopted() -> Self {
        Self
    }
}

pub unsafe fn context_switch(_prev: *mut Context, _next: *mut Context, _prev_exiting: bool) {
    unimplemented!("unsupported architecture")
}
