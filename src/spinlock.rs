//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::process::{cpus, pop_off, push_off};

/// 无持有者
const NOBODY: usize = usize::MAX;

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// 当锁被占用时，尝试获取锁的执行流将在循环中忙等待，直到锁被释放。
/// 持有期间中断保持关闭，因此临界区内不得休眠，也不得等待睡眠锁。
///
/// # 字段说明
/// - `lock`: 锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试；
/// - `holder`: 当前持有者的执行流编号，用于检测重入与错误释放；
/// - `data`: 被保护的数据。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            holder: AtomicUsize::new(NOBODY),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// 守卫对象实现了`Deref`和`DerefMut`，离开作用域时自动释放锁。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock();
    ///     *guard = 42;
    /// }
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 当前执行流是否持有此锁。
    ///
    /// 只有在中断关闭时结果才可靠。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.holder.load(Ordering::Relaxed) == cpus().context_id()
    }

    /// 获取锁的核心实现。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁（重入即死锁）；
    /// 3. 使用比较交换忙等待获取锁；
    /// 4. 设置内存屏障并记录持有者。
    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.holder.store(cpus().context_id(), Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.holder.store(NOBODY, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 守卫存在即表示锁被持有；它不能被移动到其他线程，
/// 因为释放时需要在同一 CPU 上恢复中断状态。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 守卫所属的锁是否由当前执行流持有，用于调试验证
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}
