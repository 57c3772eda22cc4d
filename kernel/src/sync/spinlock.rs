/*
 * Spinlocks
 *
 * The lowest-level mutual exclusion in the kernel. Usable from interrupt
 * context; never sleeps.
 *
 * - RawSpinlock: lock word + holder CPU, explicit acquire()/release()
 * - Spinlock<T>: RawSpinlock guarding a value, released by a RAII guard
 * - RecursiveSpinlock<T>: may be re-acquired by the CPU that holds it
 *
 * INTERRUPTS:
 * ===========
 *
 * Acquiring disables local interrupts and remembers whether they were
 * enabled; releasing restores exactly that state. An interrupt handler on
 * the same CPU can therefore never spin on a lock its own CPU holds, and
 * nested locks (or a lock taken inside an InterruptGuard) restore in LIFO
 * order.
 *
 * MISUSE IS FATAL:
 * ================
 *
 * Releasing a lock this CPU does not hold, or re-acquiring a non-recursive
 * lock on the CPU that holds it, panics immediately.
 */

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::Arch;

const NO_HOLDER: u32 = u32::MAX;

// ============================================================================
// Raw Spinlock
// ============================================================================

/// Test-and-set spinlock that disables interrupts while held
pub struct RawSpinlock<A: Arch> {
    locked: AtomicBool,
    holder: AtomicU32,
    saved_irq: UnsafeCell<bool>,
    _arch: PhantomData<fn() -> A>,
}

// SAFETY: `saved_irq` is only touched by the CPU holding the lock.
unsafe impl<A: Arch> Sync for RawSpinlock<A> {}
unsafe impl<A: Arch> Send for RawSpinlock<A> {}

impl<A: Arch> RawSpinlock<A> {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU32::new(NO_HOLDER),
            saved_irq: UnsafeCell::new(false),
            _arch: PhantomData,
        }
    }

    /// Disable local interrupts and spin until the lock is ours
    pub fn acquire(&self) {
        let were_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        let me = A::current_cpu().0;

        if self.held_by(me) {
            if were_enabled {
                A::enable_interrupts();
            }
            panic!("spinlock re-acquired on CPU{} that already holds it", me);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        self.holder.store(me, Ordering::Relaxed);
        // SAFETY: we hold the lock.
        unsafe { *self.saved_irq.get() = were_enabled };
    }

    /// Take the lock only if it is free
    ///
    /// Also fails (instead of panicking) when this CPU already holds it.
    pub fn try_acquire(&self) -> bool {
        let were_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if were_enabled {
                A::enable_interrupts();
            }
            return false;
        }
        self.holder.store(A::current_cpu().0, Ordering::Relaxed);
        // SAFETY: we hold the lock.
        unsafe { *self.saved_irq.get() = were_enabled };
        true
    }

    /// Clear the lock word and restore the interrupt state saved at acquire
    pub fn release(&self) {
        let me = A::current_cpu().0;
        if !self.held_by(me) {
            panic!("spinlock released on CPU{} which does not hold it", me);
        }
        // SAFETY: we still hold the lock.
        let were_enabled = unsafe { *self.saved_irq.get() };
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        if were_enabled {
            A::enable_interrupts();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn held_by(&self, cpu: u32) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == cpu
    }
}

impl<A: Arch> Default for RawSpinlock<A> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Spinlock<T>
// ============================================================================

/// Value protected by a `RawSpinlock`
pub struct Spinlock<A: Arch, T: ?Sized> {
    raw: RawSpinlock<A>,
    data: UnsafeCell<T>,
}

unsafe impl<A: Arch, T: ?Sized + Send> Sync for Spinlock<A, T> {}
unsafe impl<A: Arch, T: ?Sized + Send> Send for Spinlock<A, T> {}

/// Holds a `Spinlock` until dropped; pinned to the acquiring CPU
pub struct SpinlockGuard<'a, A: Arch, T: ?Sized> {
    lock: &'a Spinlock<A, T>,
    _not_send: PhantomData<*const ()>,
}

impl<A: Arch, T> Spinlock<A, T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<A: Arch, T: ?Sized> Spinlock<A, T> {
    pub fn lock(&self) -> SpinlockGuard<'_, A, T> {
        self.raw.acquire();
        SpinlockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, A, T>> {
        if self.raw.try_acquire() {
            Some(SpinlockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<A: Arch, T: Default> Default for Spinlock<A, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<A: Arch, T: ?Sized> Deref for SpinlockGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<A: Arch, T: ?Sized> DerefMut for SpinlockGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<A: Arch, T: ?Sized> Drop for SpinlockGuard<'_, A, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

// ============================================================================
// Recursive Spinlock
// ============================================================================

/// Spinlock the holding CPU may acquire again
///
/// The owner is the CPU, not the thread: an interrupt handler that re-enters
/// the scheduler on the CPU already holding this lock gets straight in. The
/// guard only hands out `&T`, so nested holders need interior mutability
/// (the scheduler keeps its run queue in a `RefCell`).
pub struct RecursiveSpinlock<A: Arch, T: ?Sized> {
    owner: AtomicU32,
    depth: UnsafeCell<u32>,
    saved_irq: UnsafeCell<bool>,
    _arch: PhantomData<fn() -> A>,
    data: UnsafeCell<T>,
}

// SAFETY: only the owning CPU reaches `depth`, `saved_irq` and `data`, and it
// never does so from two places at once (no switching while held).
unsafe impl<A: Arch, T: ?Sized + Send> Sync for RecursiveSpinlock<A, T> {}
unsafe impl<A: Arch, T: ?Sized + Send> Send for RecursiveSpinlock<A, T> {}

pub struct RecursiveSpinlockGuard<'a, A: Arch, T: ?Sized> {
    lock: &'a RecursiveSpinlock<A, T>,
    _not_send: PhantomData<*const ()>,
}

impl<A: Arch, T> RecursiveSpinlock<A, T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU32::new(NO_HOLDER),
            depth: UnsafeCell::new(0),
            saved_irq: UnsafeCell::new(false),
            _arch: PhantomData,
            data: UnsafeCell::new(value),
        }
    }
}

impl<A: Arch, T: ?Sized> RecursiveSpinlock<A, T> {
    pub fn lock(&self) -> RecursiveSpinlockGuard<'_, A, T> {
        let were_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        let me = A::current_cpu().0;

        if self.owner.load(Ordering::Relaxed) == me {
            // SAFETY: this CPU owns the lock.
            unsafe { *self.depth.get() += 1 };
        } else {
            while self
                .owner
                .compare_exchange_weak(NO_HOLDER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            // SAFETY: this CPU now owns the lock.
            unsafe {
                *self.depth.get() = 1;
                *self.saved_irq.get() = were_enabled;
            }
        }

        RecursiveSpinlockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire without spinning; `None` if another CPU holds the lock
    pub fn try_lock(&self) -> Option<RecursiveSpinlockGuard<'_, A, T>> {
        let were_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        let me = A::current_cpu().0;

        if self.owner.load(Ordering::Relaxed) == me {
            // SAFETY: this CPU owns the lock.
            unsafe { *self.depth.get() += 1 };
        } else if self
            .owner
            .compare_exchange(NO_HOLDER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: this CPU now owns the lock.
            unsafe {
                *self.depth.get() = 1;
                *self.saved_irq.get() = were_enabled;
            }
        } else {
            if were_enabled {
                A::enable_interrupts();
            }
            return None;
        }

        Some(RecursiveSpinlockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Nesting depth as seen by the calling CPU (0 if it is not the owner)
    pub fn depth(&self) -> u32 {
        if self.owner.load(Ordering::Relaxed) == A::current_cpu().0 {
            // SAFETY: this CPU owns the lock.
            unsafe { *self.depth.get() }
        } else {
            0
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_HOLDER
    }

    fn unlock(&self) {
        let me = A::current_cpu().0;
        if self.owner.load(Ordering::Relaxed) != me {
            panic!("recursive spinlock released on CPU{} which does not hold it", me);
        }
        // SAFETY: this CPU owns the lock.
        let depth = unsafe {
            let depth = &mut *self.depth.get();
            *depth -= 1;
            *depth
        };
        if depth == 0 {
            // SAFETY: still the owner until the store below.
            let were_enabled = unsafe { *self.saved_irq.get() };
            self.owner.store(NO_HOLDER, Ordering::Release);
            if were_enabled {
                A::enable_interrupts();
            }
        }
    }
}

impl<A: Arch, T: ?Sized> Deref for RecursiveSpinlockGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the owning CPU only ever creates shared references.
        unsafe { &*self.lock.data.get() }
    }
}

impl<A: Arch, T: ?Sized> Drop for RecursiveSpinlockGuard<'_, A, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::arch::host::{self, HostArch};
    use crate::scheduler::types::CpuId;

    #[test]
    fn lock_disables_and_restores_interrupts() {
        host::become_cpu(CpuId(0));
        let lock: Spinlock<HostArch, u32> = Spinlock::new(0);
        assert!(HostArch::interrupts_enabled());
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!HostArch::interrupts_enabled());
        }
        assert!(HostArch::interrupts_enabled());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn nested_locks_restore_in_order() {
        host::become_cpu(CpuId(0));
        let outer: Spinlock<HostArch, ()> = Spinlock::new(());
        let inner: Spinlock<HostArch, ()> = Spinlock::new(());
        let a = outer.lock();
        {
            let _b = inner.lock();
        }
        // inner saved "disabled", so releasing it must not re-enable
        assert!(!HostArch::interrupts_enabled());
        drop(a);
        assert!(HostArch::interrupts_enabled());
    }

    #[test]
    fn lock_taken_with_interrupts_off_keeps_them_off() {
        host::become_cpu(CpuId(0));
        let lock: Spinlock<HostArch, ()> = Spinlock::new(());
        HostArch::disable_interrupts();
        drop(lock.lock());
        assert!(!HostArch::interrupts_enabled());
        HostArch::enable_interrupts();
    }

    #[test]
    fn try_lock_fails_while_held() {
        host::become_cpu(CpuId(0));
        let lock: Spinlock<HostArch, ()> = Spinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
        assert!(HostArch::interrupts_enabled());
    }

    #[test]
    fn contended_counter_is_exact() {
        let lock: Arc<Spinlock<HostArch, u64>> = Arc::new(Spinlock::new(0));
        let workers: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    #[should_panic(expected = "already holds it")]
    fn reacquire_on_same_cpu_panics() {
        host::become_cpu(CpuId(0));
        let lock: Spinlock<HostArch, ()> = Spinlock::new(());
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn release_without_acquire_panics() {
        host::become_cpu(CpuId(0));
        let raw: RawSpinlock<HostArch> = RawSpinlock::new();
        raw.release();
    }

    #[test]
    fn recursive_lock_counts_depth() {
        host::become_cpu(CpuId(0));
        let lock: RecursiveSpinlock<HostArch, core::cell::Cell<u32>> =
            RecursiveSpinlock::new(core::cell::Cell::new(0));
        let a = lock.lock();
        let b = lock.lock();
        let c = lock.lock();
        assert_eq!(lock.depth(), 3);
        c.set(c.get() + 1);
        drop(c);
        drop(b);
        assert_eq!(lock.depth(), 1);
        assert!(lock.is_locked());
        assert!(!HostArch::interrupts_enabled());
        drop(a);
        assert!(!lock.is_locked());
        assert!(HostArch::interrupts_enabled());
        assert_eq!(lock.lock().get(), 1);
    }

    #[test]
    fn recursive_lock_excludes_other_cpus() {
        host::become_cpu(CpuId(0));
        let lock: Arc<RecursiveSpinlock<HostArch, ()>> = Arc::new(RecursiveSpinlock::new(()));
        let guard = lock.lock();
        let other = lock.clone();
        let observer = std::thread::spawn(move || {
            host::become_cpu(CpuId(1));
            other.depth()
        });
        assert_eq!(observer.join().unwrap(), 0);
        drop(guard);
    }
}
