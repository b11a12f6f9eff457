use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use system_error::SystemError;

use crate::arch::CurrentIrqArch;
use crate::exception::{InterruptArch, IrqFlagsGuard};

/// 票号自旋锁
///
/// `head`是下一个待发放的票号，`tail`是当前持有者的票号。
/// 加锁时fetch_add取票，然后自旋等待`tail`追上自己的票号，
/// 因此竞争者严格按FIFO顺序获得锁。
pub struct RawSpinlock {
    head: AtomicU32,
    tail: AtomicU32,
}

impl RawSpinlock {
    pub const INIT: RawSpinlock = RawSpinlock {
        head: AtomicU32::new(0),
        tail: AtomicU32::new(0),
    };

    pub const fn new() -> Self {
        Self::INIT
    }

    /// 取票并自旋，直到轮到自己
    pub fn lock(&self) {
        let ticket = self.head.fetch_add(1, Ordering::Relaxed);
        while self.tail.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    /// 只有在没人持有锁时才尝试取票
    pub fn try_lock(&self) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        return self
            .head
            .compare_exchange(tail, tail.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
    }

    /// 放行下一个票号
    ///
    /// ## Safety
    ///
    /// 只能由当前持有者调用，否则会放行一个尚未取得锁的竞争者。
    pub unsafe fn unlock(&self) {
        self.tail.fetch_add(1, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        return head != tail;
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// 带数据的自旋锁
///
/// 通过[`SpinLockGuard`]访问内部数据，保证先加锁后访问。
/// 中断上下文中可能访问到的锁必须使用`lock_irqsave`，
/// 否则持锁期间的中断重入会死锁。
pub struct SpinLock<T: ?Sized> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

/// 自旋锁的守卫。被drop时自动释放锁，并恢复加锁前的中断状态。
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    irq_guard: Option<IrqFlagsGuard>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: RawSpinlock::INIT,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<T> {
        self.lock.lock();
        return SpinLockGuard {
            lock: self,
            irq_guard: None,
        };
    }

    /// 关中断并加锁。守卫被drop时，先释放锁，再恢复中断状态。
    pub fn lock_irqsave(&self) -> SpinLockGuard<T> {
        let irq_guard = unsafe { CurrentIrqArch::save_and_disable_irq() };
        self.lock.lock();
        return SpinLockGuard {
            lock: self,
            irq_guard: Some(irq_guard),
        };
    }

    pub fn try_lock(&self) -> Result<SpinLockGuard<T>, SystemError> {
        if self.lock.try_lock() {
            return Ok(SpinLockGuard {
                lock: self,
                irq_guard: None,
            });
        }
        return Err(SystemError::EAGAIN_OR_EWOULDBLOCK);
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl<T: ?Sized + Debug> Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Ok(guard) = self.try_lock() {
            return f.debug_struct("SpinLock").field("data", &&*guard).finish();
        }
        return f.debug_struct("SpinLock").field("data", &"<locked>").finish();
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        return unsafe { &*self.lock.data.get() };
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        return unsafe { &mut *self.lock.data.get() };
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            self.lock.lock.unlock();
        }
        // 锁释放之后才恢复中断状态
        self.irq_guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new(0usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_ticket_order() {
        let raw = RawSpinlock::new();
        raw.lock();
        assert!(raw.is_locked());
        assert!(!raw.try_lock());
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
        assert!(raw.try_lock());
        unsafe { raw.unlock() };
    }

    #[test]
    fn test_fifo_fairness() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(SpinLock::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    lock.lock().push(i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.lock().len(), 800);
    }
}
