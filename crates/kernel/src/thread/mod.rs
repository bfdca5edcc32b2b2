//! Thread lifecycle and the per-thread descriptor.
//!
//! A thread's descriptor lives at the bottom of a single kernel-pool
//! page, its kernel stack grows down from the top of that same page
//! toward the descriptor. Rounding the stack pointer down to a page
//! boundary therefore finds the running thread with no per-cpu lookup.
//! The flip side is that a stack overflow silently corrupts the
//! descriptor, so the `magic` sentinel sits in the descriptor's last
//! field (right where the stack would crash through) and every
//! [`current`] call checks it.

use core::{
    cell::{Cell, UnsafeCell},
    ops::Deref,
    ptr::NonNull,
};

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{
    arch, debug,
    memory::{
        PAGE_SIZE, VirtAddr,
        palloc::{self, AllocFlags},
    },
    scheduler,
    sync::{Lock, Semaphore},
    utils::{fixed::Fixed, types::Name},
    vm::spt::AddressSpace,
};

pub type Tid = u32;

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;

pub const NICE_MIN: i8 = -20;
pub const NICE_MAX: i8 = 20;

/// checked on every [`current`], a clobbered value means the stack grew
/// into the descriptor
const THREAD_MAGIC: u32 = 0x6f78_626f;

/// the thread is not in any wake queue
pub(crate) const NOT_SLEEPING: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Parent/child exit rendezvous. Heap allocated and shared by exactly
/// two sides, each dropping one reference, so `wait` can outlive either
/// thread's descriptor page.
pub(crate) struct WaitLink {
    tid: Tid,
    exit_status: Cell<i32>,
    exited: Semaphore,
    refs: Cell<u8>,
}

// only touched with interrupts disabled (refs) or through the semaphore
unsafe impl Send for WaitLink {}
unsafe impl Sync for WaitLink {}

fn release_wait_link(link: NonNull<WaitLink>) {
    let last = arch::without_interrupts(|| {
        let refs = unsafe { link.as_ref() }.refs.get() - 1;
        unsafe { link.as_ref() }.refs.set(refs);
        refs == 0
    });
    if last {
        drop(unsafe { Box::from_raw(link.as_ptr()) });
    }
}

/// All mutable descriptor state is either owned by the thread itself or
/// mutated with interrupts disabled on the single cpu, which is what
/// makes the plain cells sound to share.
#[repr(C)]
pub struct Thread {
    tid: Tid,
    name: Name,
    status: Cell<Status>,

    base_priority: Cell<u8>,
    /// base priority plus whatever donation currently boosts it
    priority: Cell<u8>,
    nice: Cell<i8>,
    recent_cpu: Cell<Fixed>,

    /// tick this thread sleeps until, [`NOT_SLEEPING`] otherwise
    wake_at: Cell<u64>,

    is_idle: bool,
    user: Cell<bool>,
    /// user stack pointer captured when the thread entered the kernel,
    /// the fault handler reads it to judge stack growth
    user_rsp: Cell<VirtAddr>,

    /// the lock this thread is blocked acquiring, donation chains walk
    /// through it
    waiting_on: Cell<Option<NonNull<Lock>>>,
    held_locks: UnsafeCell<Vec<NonNull<Lock>>>,

    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    context: UnsafeCell<arch::Context>,

    address_space: UnsafeCell<Option<AddressSpace>>,

    wait_link: Cell<Option<NonNull<WaitLink>>>,
    children: UnsafeCell<Vec<NonNull<WaitLink>>>,

    /// must stay the last field: the stack crashes through it first
    magic: u32,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

// the descriptor shares its page with the thread's stack
const _: () = assert!(size_of::<Thread>() <= PAGE_SIZE / 4);

/// A copyable handle to a thread descriptor. The descriptor page stays
/// valid until the thread dies and the scheduler reclaims it on the
/// following pass, holders must not keep handles past that.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef(NonNull<Thread>);

unsafe impl Send for ThreadRef {}
unsafe impl Sync for ThreadRef {}

impl Deref for ThreadRef {
    type Target = Thread;
    fn deref(&self) -> &Thread {
        unsafe { self.0.as_ref() }
    }
}

impl core::fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Thread({} {:?})", self.tid(), self.name().as_str())
    }
}

impl ThreadRef {
    pub(crate) fn as_ptr(&self) -> *mut Thread {
        self.0.as_ptr()
    }

    pub(crate) fn context_ptr(&self) -> *mut arch::Context {
        unsafe { (*self.0.as_ptr()).context.get() }
    }

    pub(crate) fn check_magic(&self) {
        assert!(
            self.magic == THREAD_MAGIC,
            "thread {} overflowed its kernel stack",
            self.tid
        );
    }
}

impl Thread {
    pub const fn tid(&self) -> Tid {
        self.tid
    }

    pub const fn name(&self) -> &Name {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    pub const fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn is_user(&self) -> bool {
        self.user.get()
    }

    pub fn effective_priority(&self) -> u8 {
        self.priority.get()
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority.get()
    }

    pub(crate) fn set_effective_priority(&self, priority: u8) {
        self.priority.set(priority);
    }

    pub(crate) fn set_both_priorities(&self, priority: u8) {
        self.base_priority.set(priority);
        self.priority.set(priority);
    }

    pub fn nice(&self) -> i8 {
        self.nice.get()
    }

    pub(crate) fn recent_cpu(&self) -> Fixed {
        self.recent_cpu.get()
    }

    pub(crate) fn set_recent_cpu(&self, value: Fixed) {
        self.recent_cpu.set(value);
    }

    pub(crate) fn wake_at(&self) -> u64 {
        self.wake_at.get()
    }

    pub(crate) fn set_wake_at(&self, tick: u64) {
        self.wake_at.set(tick);
    }

    pub(crate) fn waiting_on(&self) -> Option<NonNull<Lock>> {
        self.waiting_on.get()
    }

    pub(crate) fn set_waiting_on(&self, lock: Option<NonNull<Lock>>) {
        self.waiting_on.set(lock);
    }

    /// # Safety
    /// interrupts must be disabled
    pub(crate) unsafe fn held_locks(&self) -> &mut Vec<NonNull<Lock>> {
        unsafe { &mut *self.held_locks.get() }
    }

    pub fn user_rsp(&self) -> VirtAddr {
        self.user_rsp.get()
    }

    pub fn set_user_rsp(&self, rsp: VirtAddr) {
        self.user_rsp.set(rsp);
    }

    /// The thread's address space. Only the thread itself may touch it,
    /// other address spaces are only ever reached through the share
    /// lists of individual pages.
    #[allow(clippy::mut_from_ref)]
    pub fn address_space(&self) -> Option<&mut AddressSpace> {
        unsafe { (*self.address_space.get()).as_mut() }
    }

    /// attaches an address space, marking the thread as a user thread
    pub fn adopt_address_space(&self, space: AddressSpace) {
        let slot = unsafe { &mut *self.address_space.get() };
        assert!(slot.is_none(), "thread already owns an address space");
        *slot = Some(space);
        self.user.set(true);
    }

    pub fn take_address_space(&self) -> Option<AddressSpace> {
        self.user.set(false);
        unsafe { (*self.address_space.get()).take() }
    }
}

/// Returns the running thread.
pub fn current() -> ThreadRef {
    let ptr = arch::current_ptr() as *mut Thread;
    let thread = ThreadRef(NonNull::new(ptr).expect("no running thread"));
    thread.check_magic();
    thread
}

fn write_descriptor(
    page: VirtAddr,
    tid: Tid,
    name: Name,
    priority: u8,
    status: Status,
    is_idle: bool,
    context: arch::Context,
    entry: Option<Box<dyn FnOnce() + Send>>,
    wait_link: Option<NonNull<WaitLink>>,
) -> ThreadRef {
    let thread = Thread {
        tid,
        name,
        status: Cell::new(status),
        base_priority: Cell::new(priority),
        priority: Cell::new(priority),
        nice: Cell::new(0),
        recent_cpu: Cell::new(Fixed::ZERO),
        wake_at: Cell::new(NOT_SLEEPING),
        is_idle,
        user: Cell::new(false),
        user_rsp: Cell::new(VirtAddr::null()),
        waiting_on: Cell::new(None),
        held_locks: UnsafeCell::new(Vec::new()),
        entry: UnsafeCell::new(entry),
        context: UnsafeCell::new(context),
        address_space: UnsafeCell::new(None),
        wait_link: Cell::new(wait_link),
        children: UnsafeCell::new(Vec::new()),
        magic: THREAD_MAGIC,
    };

    let ptr = page.into_ptr::<Thread>();
    unsafe { ptr.write(thread) };
    ThreadRef(NonNull::new(ptr).unwrap())
}

/// Creates a thread and hands it to the scheduler.
///
/// The new thread is born blocked and immediately unblocked, it starts
/// running whenever the scheduler next picks it. Returns its tid, which
/// also keys the [`wait`] rendezvous with the creator.
pub fn spawn(name: &str, priority: u8, f: impl FnOnce() + Send + 'static) -> Tid {
    assert!(priority <= PRI_MAX, "priority {priority} out of range");
    spawn_inner(name, priority, false, Box::new(f))
}

pub(crate) fn spawn_idle() -> Tid {
    spawn_inner("idle", PRI_MIN, true, Box::new(idle_loop))
}

fn spawn_inner(name: &str, priority: u8, is_idle: bool, entry: Box<dyn FnOnce() + Send>) -> Tid {
    let name = Name::try_from(name).expect("thread name too long");
    let page = palloc::get_page(AllocFlags::ZERO).expect("kernel pool exhausted spawning a thread");
    let stack_top = page + PAGE_SIZE;

    let tid = scheduler::allocate_tid();
    let link = (!is_idle).then(|| {
        NonNull::from(Box::leak(Box::new(WaitLink {
            tid,
            exit_status: Cell::new(0),
            exited: Semaphore::new(0),
            refs: Cell::new(2),
        })))
    });

    let thread = write_descriptor(
        page,
        tid,
        name,
        priority,
        Status::Blocked,
        is_idle,
        arch::Context::new_spawned(stack_top),
        Some(entry),
        link,
    );

    arch::without_interrupts(|| {
        let creator = current();
        if scheduler::is_mlfqs() && !is_idle {
            // fair-share statistics are inherited from the creator
            thread.nice.set(creator.nice());
            thread.recent_cpu.set(creator.recent_cpu());
            scheduler::mlfqs_refresh_thread(thread);
        }
        if let Some(link) = link {
            unsafe { creator.children.get().as_mut().unwrap() }.push(link);
        }
        scheduler::register(thread);
        unblock(thread);
    });
    maybe_preempt();

    tid
}

fn idle_loop() {
    loop {
        arch::halt_until_interrupt();
    }
}

/// Wraps the caller, already running on its own stack, in a descriptor
/// so the scheduler can manage it. Used once at boot for the initial
/// thread.
pub(crate) fn adopt_boot_thread(tid: Tid) -> ThreadRef {
    let page = palloc::get_page(AllocFlags::ZERO).expect("kernel pool exhausted at boot");
    let thread = write_descriptor(
        page,
        tid,
        Name::try_from("main").unwrap(),
        PRI_DEFAULT,
        Status::Running,
        false,
        arch::Context::adopted(),
        None,
        None,
    );
    arch::set_current_ptr(thread.as_ptr() as *mut ());
    thread
}

/// Common entry for freshly spawned threads, reached on their first
/// switch-in: completes the scheduler hand-off, enables interrupts and
/// runs the thread body.
pub(crate) fn kernel_thread_entry() {
    scheduler::finish_switch();
    arch::restore_interrupts(true);

    let cur = current();
    let entry = unsafe { (*cur.entry.get()).take() }.expect("thread started twice");
    entry();
    exit(0);
}

/// Terminates the current thread. The descriptor page is reclaimed
/// lazily by the next scheduler pass.
pub fn exit(status: i32) -> ! {
    let cur = current();
    assert!(!cur.is_idle(), "the idle thread tried to exit");
    assert!(!arch::in_interrupt(), "exit from interrupt context");

    // tear the address space down before entering the final critical
    // section, write-back and the frame lock may suspend
    if let Some(space) = cur.take_address_space() {
        drop(space);
    }

    debug!(Thread, "{:?} exited with status {status}", cur);

    if let Some(link) = cur.wait_link.take() {
        unsafe { link.as_ref() }.exit_status.set(status);
        unsafe { link.as_ref() }.exited.up();
        release_wait_link(link);
    }
    let children = core::mem::take(unsafe { &mut *cur.children.get() });
    for link in children {
        release_wait_link(link);
    }

    arch::disable_interrupts();
    scheduler::exit_current();
    unreachable!("a dead thread came back to life");
}

/// Waits for a thread this thread spawned to exit and returns its exit
/// status. Returns `None` for a tid that is not an unwaited child.
pub fn wait(tid: Tid) -> Option<i32> {
    let cur = current();
    let link = arch::without_interrupts(|| {
        let children = unsafe { &mut *cur.children.get() };
        let index = children
            .iter()
            .position(|link| unsafe { link.as_ref() }.tid == tid)?;
        Some(children.swap_remove(index))
    })?;

    unsafe { link.as_ref() }.exited.down();
    let status = unsafe { link.as_ref() }.exit_status.get();
    release_wait_link(link);
    Some(status)
}

/// Blocks the current thread and schedules away. The caller must have
/// disabled interrupts and arranged for somebody to [`unblock`] it.
pub fn block() {
    assert!(!arch::interrupts_enabled(), "block with interrupts enabled");
    assert!(!arch::in_interrupt(), "block from interrupt context");
    let cur = current();
    cur.status.set(Status::Blocked);
    scheduler::schedule();
}

/// Moves a blocked thread to the ready queue. The thread is visible
/// there before interrupts are re-enabled. Does not preempt, callers
/// decide that via [`maybe_preempt`].
pub fn unblock(thread: ThreadRef) {
    arch::without_interrupts(|| {
        assert!(
            thread.status.get() == Status::Blocked,
            "unblock of {:?} which is not blocked",
            thread
        );
        thread.status.set(Status::Ready);
        scheduler::enqueue_ready(thread);
    });
}

/// Yields the cpu, the current thread goes back in the ready queue.
pub fn yield_now() {
    assert!(!arch::in_interrupt(), "yield from interrupt context");
    let were_enabled = arch::disable_interrupts();
    let cur = current();
    cur.status.set(Status::Ready);
    if !cur.is_idle() {
        scheduler::enqueue_ready(cur);
    }
    scheduler::schedule();
    arch::restore_interrupts(were_enabled);
}

/// Yields when a ready thread outranks the runner. From interrupt
/// context the yield is deferred to the handler's exit.
pub(crate) fn maybe_preempt() {
    if arch::in_interrupt() {
        if scheduler::higher_priority_ready() {
            scheduler::request_preemption();
        }
        return;
    }
    let should = arch::without_interrupts(scheduler::higher_priority_ready);
    if should {
        yield_now();
    }
}

/// Sets the current thread's base priority. A no-op under the fair-share
/// scheduler where priorities are computed. May yield when the change
/// drops the thread below a ready one, donations the thread is still
/// receiving keep boosting it regardless.
pub fn set_priority(priority: u8) {
    assert!(priority <= PRI_MAX, "priority {priority} out of range");
    if scheduler::is_mlfqs() {
        return;
    }

    arch::without_interrupts(|| {
        let cur = current();
        cur.base_priority.set(priority);
        let mut effective = priority;
        for lock in unsafe { cur.held_locks() }.iter() {
            if let Some(top) = unsafe { lock.as_ref() }.top_waiter_priority() {
                effective = effective.max(top);
            }
        }
        cur.priority.set(effective);
    });
    maybe_preempt();
}

pub fn priority() -> u8 {
    current().effective_priority()
}

/// Sets the current thread's niceness and recomputes its fair-share
/// priority, yielding when it no longer outranks the ready queue.
pub fn set_nice(nice: i8) {
    assert!((NICE_MIN..=NICE_MAX).contains(&nice), "nice {nice} out of range");
    let cur = current();
    cur.nice.set(nice);
    if scheduler::is_mlfqs() {
        arch::without_interrupts(|| scheduler::mlfqs_refresh_thread(cur));
        maybe_preempt();
    }
}

pub fn nice() -> i8 {
    current().nice()
}
