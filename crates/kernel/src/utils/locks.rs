use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use lock_api::{GuardSend, RawMutex};
use spin::Lazy;

pub struct RawSpinMutex(AtomicBool);

unsafe impl RawMutex for RawSpinMutex {
    const INIT: Self = Self(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        // pure spin, no scheduler involvement: these locks guard short
        // critical sections and are taken with interrupts disabled in
        // scheduler paths, the blocking primitives live in crate::sync
        while !self.try_lock() {
            core::hint::spin_loop();
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

type SpinLockExt<T> = lock_api::Mutex<RawSpinMutex, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinMutex, T>;

#[derive(Debug)]
#[repr(transparent)]
pub struct SpinLock<T>(SpinLockExt<T>);

impl<T> Deref for SpinLock<T> {
    type Target = SpinLockExt<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for SpinLock<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self(SpinLockExt::new(inner))
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.0.lock()
    }

    #[allow(unused)]
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

#[derive(Debug)]
#[repr(transparent)]
pub struct LazyLock<T>(Lazy<T>);

impl<T> Deref for LazyLock<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> LazyLock<T> {
    pub const fn new(f: fn() -> T) -> Self {
        Self(Lazy::new(f))
    }
}
