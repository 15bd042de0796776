//! 睡眠锁模块
//! 提供基于休眠/唤醒机制的同步原语，适用于可能长时间持有的锁（例如跨越磁盘 I/O）。
//!
//! 当锁被占用时，尝试获取锁的执行流会进入休眠状态，避免忙等待。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::cpus;
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`holder`
/// - `locked`: 表示锁是否已被占用
/// - `holder`: 持有者的执行流编号
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    holder: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// `locked` 与 `holder` 只在持有内部自旋锁时访问
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            holder: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前执行流）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`休眠，被唤醒后重新加锁再检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部自旋锁
    ///
    /// # 返回值
    /// `SleepLockGuard<T>`守卫对象，提供对内部数据的访问
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            cpus().sleep(self.chan(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.holder.set(cpus().context_id());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前执行流是否持有此锁
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let holding = self.locked.get() && self.holder.get() == cpus().context_id();
        drop(guard);
        holding
    }

    /// 释放锁，并唤醒等待该锁的执行流
    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.get() {
            panic!("sleeplock {} release", self.name);
        }
        self.locked.set(false);
        self.holder.set(0);
        cpus().wakeup(self.chan());
        drop(guard);
    }

    /// 休眠所用的通道：`locked` 字段的地址
    fn chan(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前执行流是否仍是该锁的持有者
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::host;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn holder_is_tracked_per_context() {
        host::install();
        let lock = SleepLock::new(0u32, "holder");
        let guard = lock.lock();
        assert!(guard.holding());
        thread::scope(|s| {
            s.spawn(|| assert!(!lock.holding()));
        });
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "sleeplock idle release")]
    fn release_unlocked_panics() {
        host::install();
        let lock = SleepLock::new(0u32, "idle");
        lock.unlock();
    }

    #[test]
    fn waiter_sleeps_until_release() {
        host::install();
        let lock = SleepLock::new(0u32, "waiter");
        let released = AtomicBool::new(false);

        let mut guard = lock.lock();
        thread::scope(|s| {
            s.spawn(|| {
                let mut data = lock.lock();
                assert!(released.load(Ordering::SeqCst));
                *data += 1;
            });
            thread::sleep(Duration::from_millis(20));
            *guard += 1;
            released.store(true, Ordering::SeqCst);
            drop(guard);
        });
        assert_eq!(*lock.lock(), 2);
    }
}
