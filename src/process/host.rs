//! 宿主环境下的处理器接口实现，供模拟器与测试使用。
//!
//! 每个宿主线程被视为一个执行流；线程可以用 [`HostCpus::bind`]
//! 固定到某个 CPU 编号上，未绑定的线程按执行流编号轮流映射到各个 CPU。
//! 关中断只做嵌套计数，睡眠与唤醒由一把互斥锁和一个条件变量实现。

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::consts::NCPU;
use crate::spinlock::SpinLockGuard;
use super::cpu::{self, Cpus};

std::thread_local! {
    static BOUND_CPU: Cell<Option<usize>> = const { Cell::new(None) };
    static NOFF: Cell<usize> = const { Cell::new(0) };
    static CONTEXT: Cell<usize> = const { Cell::new(0) };
}

static HOST: HostCpus = HostCpus::new();

/// 注册宿主实现并返回它，可重复调用。
pub fn install() -> &'static HostCpus {
    cpu::install(&HOST);
    &HOST
}

pub struct HostCpus {
    /// 下一个分配给新线程的执行流编号，0 保留为“未分配”
    next_context: AtomicUsize,
    ticks: AtomicUsize,
    parked: Mutex<()>,
    wake: Condvar,
}

impl HostCpus {
    const fn new() -> Self {
        Self {
            next_context: AtomicUsize::new(1),
            ticks: AtomicUsize::new(1),
            parked: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// 将当前线程固定到 `cpu` 上。
    ///
    /// # Panics
    /// `cpu` 越界，或当前线程处于关中断状态时 panic。
    pub fn bind(&self, cpu: usize) {
        if cpu >= NCPU {
            panic!("bind: cpu {} out of range", cpu);
        }
        if self.noff() != 0 {
            panic!("bind: cpu {} while interrupts off", cpu);
        }
        BOUND_CPU.with(|b| b.set(Some(cpu)));
    }

    /// 当前线程的关中断嵌套深度
    pub fn noff(&self) -> usize {
        NOFF.with(Cell::get)
    }

    fn context(&self) -> usize {
        CONTEXT.with(|c| {
            if c.get() == 0 {
                c.set(self.next_context.fetch_add(1, Ordering::Relaxed));
            }
            c.get()
        })
    }
}

impl Cpus for HostCpus {
    fn ncpu(&self) -> usize {
        NCPU
    }

    fn cpu_id(&self) -> usize {
        if self.noff() == 0 {
            panic!("cpu_id(): preemptible");
        }
        BOUND_CPU
            .with(Cell::get)
            .unwrap_or_else(|| self.context() % NCPU)
    }

    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|n| match n.get().checked_sub(1) {
            Some(noff) => n.set(noff),
            None => panic!("pop_off(): count not match"),
        });
    }

    fn context_id(&self) -> usize {
        self.context()
    }

    fn sleep(&self, _chan: usize, guard: SpinLockGuard<'_, ()>) {
        // 先持有 parked 再释放自旋锁，唤醒方必须先拿到 parked 才能通知
        let parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        let parked = self.wake.wait(parked).unwrap_or_else(PoisonError::into_inner);
        drop(parked);
    }

    fn wakeup(&self, _chan: usize) {
        let parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
        drop(parked);
    }

    /// 每读取一次前进一格，使各次采样互不相同
    fn ticks(&self) -> usize {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}
