//! 物理内存分配器，以 4096 字节的整页为单位分配，
//! 供用户进程、内核栈、页表页以及管道缓冲区使用。
//!
//! 每个 CPU 维护自己的空闲链表和一把锁，分配与释放通常只涉及本 CPU。
//! 本地链表耗尽时，从其他 CPU 的链表成批偷取空闲页。

use bit_field::BitField;
use log::trace;
#[cfg(feature = "verbose_init_info")]
use log::info;
#[cfg(feature = "kernel_warning")]
use log::warn;
use spin::Once;
use thiserror::Error;

use array_macro::array;

use core::ptr::NonNull;

use crate::consts::{NCPU, PGSHIFT, PGSIZE};
use crate::consts::mm::{ALLOC_JUNK, FREE_JUNK, STEAL_BATCH};
use crate::process::{cpus, PushOff};
use crate::spinlock::SpinLock;
use super::list::{FrameArena, FrameList};
use super::{pg_round_down, pg_round_up};

/// 可恢复的分配失败，调用方应自行处理（例如让发起请求的系统调用失败）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of physical memory")]
    OutOfMemory,
}

/// 按 CPU 划分的物理页分配器。
///
/// 内核通常将它放在 `static` 中，并在启动时由主核调用一次 [`Kmem::kinit`]：
/// ```ignore
/// pub static KMEM: Kmem = Kmem::new();
/// ```
pub struct Kmem {
    arena: Once<FrameArena>,
    kmems: [SpinLock<FrameList>; NCPU],
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            arena: Once::new(),
            kmems: array![_ => SpinLock::new(FrameList::new(), "kmem"); NCPU],
        }
    }

    /// 初始化分配器，将 `[start, end)` 中的整页全部交给当前 CPU。
    ///
    /// # 功能说明
    /// 将 `start` 向上、`end` 向下对齐到页边界，记录受管区间，
    /// 然后逐页释放到调用者所在 CPU 的空闲链表上。其他 CPU 第一次分配时
    /// 会通过偷取拿到属于自己的那一份。
    ///
    /// # 安全性
    /// - 该区间必须是有效的物理内存，且此后只经由本分配器使用；
    /// - 只能调用一次，重复调用会 panic。
    pub unsafe fn kinit(&self, start: usize, end: usize) {
        if start == 0 {
            panic!("kmem: null range");
        }
        let base = pg_round_up(start);
        let top = pg_round_down(end);
        let npages = top.saturating_sub(base) / PGSIZE;

        let mut fresh = false;
        let arena = self.arena.call_once(|| {
            fresh = true;
            FrameArena::new(base, npages)
        });
        if !fresh {
            panic!("kmem: init twice");
        }

        #[cfg(feature = "verbose_init_info")]
        info!("kmem: available physical memory [{:#x}, {:#x}), page num: {}",
            arena.base(), arena.end(), arena.npages());

        for index in 0..arena.npages() {
            self.kfree(arena.addr_of(index) as *mut u8);
        }
    }

    /// 分配一页物理内存。
    ///
    /// # 返回值
    /// - `Ok(pa)`: 页的起始地址，页内容已被填充为 `ALLOC_JUNK`；
    /// - `Err(AllocError::OutOfMemory)`: 本 CPU 与其他所有 CPU 都没有空闲页。
    pub fn kalloc(&self) -> Result<NonNull<u8>, AllocError> {
        let arena = self.arena.get().ok_or(AllocError::OutOfMemory)?;

        let off = PushOff::new();
        let id = off.cpu_id();
        let mut kmem = self.kmems[id].lock();
        if kmem.is_empty() {
            // 先放开本 CPU 的锁，偷取期间任何时刻最多持有一把 CPU 锁
            drop(kmem);
            let mut stolen = FrameList::new();
            self.steal(&off, arena, &mut stolen);
            kmem = self.kmems[id].lock();
            kmem.append(arena, &mut stolen);
        }
        let index = kmem.pop(arena);
        drop(kmem);
        drop(off);

        match index {
            Some(index) => {
                unsafe { arena.fill(index, ALLOC_JUNK) };
                // kinit 保证区间不含 0 地址
                Ok(unsafe { NonNull::new_unchecked(arena.addr_of(index) as *mut u8) })
            }
            None => {
                #[cfg(feature = "kernel_warning")]
                warn!("kalloc: cpu {} out of memory", id);
                Err(AllocError::OutOfMemory)
            }
        }
    }

    /// 从其他 CPU 依次偷取空闲页到 `stolen`，总数不超过 `STEAL_BATCH`。
    ///
    /// `stolen` 只属于当前 CPU 上的这次调用，不需要加锁；
    /// 关中断保证在此期间 CPU 编号不变。
    fn steal(&self, off: &PushOff, arena: &FrameArena, stolen: &mut FrameList) {
        let id = off.cpu_id();
        let mut quota = STEAL_BATCH;

        for (bid, kmem) in self.kmems.iter().enumerate().take(cpus().ncpu()) {
            if bid == id {
                continue;
            }
            let mut kmem = kmem.lock();
            while quota > 0 {
                match kmem.pop(arena) {
                    Some(index) => unsafe { stolen.push(arena, index) },
                    None => break,
                }
                quota -= 1;
            }
            drop(kmem);
            if quota == 0 {
                break;
            }
        }

        trace!("kalloc: cpu {} stole {} pages", id, STEAL_BATCH - quota);
    }

    /// 释放一页物理内存，它通常是之前由 [`Kmem::kalloc`] 分配的
    /// （`kinit` 初始化时除外）。页被放到*当前* CPU 的空闲链表上，
    /// 不一定是当初分配它的那个 CPU。
    ///
    /// # 安全性
    /// 调用之后 `pa` 所指的页不得再被访问。
    ///
    /// # Panics
    /// `pa` 不按页对齐或不在受管区间内时 panic，这表示调用方持有损坏的或外来的指针。
    pub unsafe fn kfree(&self, pa: *mut u8) {
        let addr = pa as usize;
        let arena = match self.arena.get() {
            Some(arena)
                if addr.get_bits(0..PGSHIFT) == 0 && addr >= arena.base() && addr < arena.end() =>
            {
                arena
            }
            _ => panic!("kfree"),
        };
        let index = arena.index_of(addr);

        // 填充垃圾数据，捕获悬垂引用
        arena.fill(index, FREE_JUNK);

        let off = PushOff::new();
        let mut kmem = self.kmems[off.cpu_id()].lock();
        kmem.push(arena, index);
        drop(kmem);
        drop(off);
    }

    /// 所有 CPU 上的空闲页总数
    pub fn nfree(&self) -> usize {
        self.kmems.iter().map(|kmem| kmem.lock().len()).sum()
    }

    /// `cpu` 空闲链表上的页数
    pub fn nfree_on(&self, cpu: usize) -> usize {
        self.kmems[cpu].lock().len()
    }
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}
