//! Kernel access to the current thread's user memory.
//!
//! Stands where the MMU and the syscall entry glue would on real
//! hardware: every access walks the address space's page map, faults
//! are resolved through [`super::handle_fault`] and retried, and an
//! unresolvable fault surfaces as an error the caller answers by
//! terminating the process with status -1.

use crate::{
    arch,
    memory::{VirtAddr, page_map::WalkError},
    thread,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UserAccessError {
    #[error("unresolvable fault on a user address")]
    BadAddress,
}

fn with_translation<R>(
    va: VirtAddr,
    write: bool,
    f: impl Fn(VirtAddr) -> R,
) -> Result<R, UserAccessError> {
    loop {
        let cur = thread::current();
        let space = cur.address_space().ok_or(UserAccessError::BadAddress)?;

        // the walk and the touch stay atomic against eviction by other
        // threads, which only runs while they hold the cpu
        let attempt = arch::without_interrupts(|| space.page_map().walk(va, write).map(&f));
        match attempt {
            Ok(value) => return Ok(value),
            Err(miss) => {
                let not_present = miss == WalkError::NotPresent;
                super::handle_fault(va, write, not_present)
                    .map_err(|_| UserAccessError::BadAddress)?;
            }
        }
    }
}

pub fn read_byte(va: VirtAddr) -> Result<u8, UserAccessError> {
    with_translation(va, false, |kva| unsafe { *kva.into_ptr::<u8>() })
}

pub fn write_byte(va: VirtAddr, value: u8) -> Result<(), UserAccessError> {
    with_translation(va, true, |kva| unsafe {
        *kva.into_ptr::<u8>() = value;
    })
}

/// copies user memory into a kernel buffer
pub fn copy_in(buf: &mut [u8], va: VirtAddr) -> Result<(), UserAccessError> {
    for (index, slot) in buf.iter_mut().enumerate() {
        *slot = read_byte(va + index)?;
    }
    Ok(())
}

/// copies a kernel buffer out to user memory
pub fn copy_out(va: VirtAddr, buf: &[u8]) -> Result<(), UserAccessError> {
    for (index, &byte) in buf.iter().enumerate() {
        write_byte(va + index, byte)?;
    }
    Ok(())
}
