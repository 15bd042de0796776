//! 处理器接口：CPU 编号、关/开中断计数，以及基于通道的睡眠与唤醒

use core::marker::PhantomData;

use spin::Once;

use crate::spinlock::SpinLockGuard;

/// 调度器向本层提供的处理器服务。
///
/// 缓冲区缓存与物理页分配器只通过该 trait 与调度器交互，
/// 内核在启动早期（任何锁被使用之前）通过 [`install`] 注册一次实现。
///
/// # 约定
/// - `cpu_id()` 只有在 `push_off()` 之后、对应的 `pop_off()` 之前才稳定，
///   调用方应通过 [`PushOff`] 取得 CPU 编号；
/// - `push_off()` / `pop_off()` 可嵌套，计数归零时才恢复中断；
/// - `context_id()` 标识当前执行流（内核中即当前进程），用于判断锁的持有者；
/// - `sleep()` 必须在释放 `guard` 与进入休眠之间保证不丢失唤醒。
pub trait Cpus: Sync {
    /// 可用的 CPU 数目，不超过 [`NCPU`](crate::consts::NCPU)
    fn ncpu(&self) -> usize;

    /// 当前 CPU 的编号
    fn cpu_id(&self) -> usize;

    /// 关中断，并将嵌套计数加一
    fn push_off(&self);

    /// 嵌套计数减一，归零时恢复 `push_off` 之前的中断状态
    fn pop_off(&self);

    /// 当前执行流的标识
    fn context_id(&self) -> usize;

    /// 原子地释放 `guard` 并在 `chan` 上休眠，被唤醒后返回（不重新加锁）
    fn sleep(&self, chan: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在 `chan` 上休眠的执行流
    fn wakeup(&self, chan: usize);

    /// 单调递增的时钟滴答数
    fn ticks(&self) -> usize;
}

static CPUS: Once<&'static dyn Cpus> = Once::new();

/// 注册处理器接口实现。
///
/// 只有第一次注册生效，之后的调用被忽略。
pub fn install(cpus: &'static dyn Cpus) {
    CPUS.call_once(|| cpus);
}

/// 取得已注册的处理器接口。
///
/// # Panics
/// 尚未调用 [`install`] 时 panic。
#[inline]
pub fn cpus() -> &'static dyn Cpus {
    match CPUS.get() {
        Some(cpus) => *cpus,
        None => panic!("cpu layer not installed"),
    }
}

/// 关中断。每次调用需要一次对应的 [`pop_off`]。
pub fn push_off() {
    cpus().push_off();
}

/// 恢复由 [`push_off`] 关闭的中断。
pub fn pop_off() {
    cpus().pop_off();
}

/// 关中断的作用域守卫。
///
/// 构造时调用 `push_off()`，析构时调用 `pop_off()`。
/// 守卫存在期间当前执行流不会被切换到其他 CPU，
/// 所以 CPU 编号只能经由它读取。
///
/// 守卫不能跨线程移动（`!Send`），以保证 `pop_off` 与 `push_off` 发生在同一 CPU 上。
pub struct PushOff {
    _not_send: PhantomData<*mut ()>,
}

impl PushOff {
    pub fn new() -> Self {
        push_off();
        Self { _not_send: PhantomData }
    }

    /// 当前 CPU 编号，在守卫的生命周期内保持不变
    #[inline]
    pub fn cpu_id(&self) -> usize {
        cpus().cpu_id()
    }
}

impl Default for PushOff {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PushOff {
    fn drop(&mut self) {
        pop_off();
    }
}
