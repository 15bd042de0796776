//! 空闲页链表
//!
//! 空闲页本身充当链表节点：页的开头存放下一空闲页在受管区间内的下标。
//! 页被分配出去之后，同一块存储就只是一页不透明的数据。

use core::ptr;

use crate::consts::PGSIZE;

/// 一个物理页帧：空闲时是链表节点，分配后是普通数据页
#[repr(C, align(4096))]
pub union Frame {
    run: Run,
    bytes: [u8; PGSIZE],
}

/// 空闲页开头的链接字
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Run {
    next: Option<usize>,
}

/// 受管的物理内存区间 `[base, base + npages * PGSIZE)`
pub struct FrameArena {
    base: usize,
    npages: usize,
}

impl FrameArena {
    /// # 安全性
    /// 调用方保证该区间是有效、按页对齐、且在本分配器生命周期内独占的物理内存
    pub unsafe fn new(base: usize, npages: usize) -> Self {
        Self { base, npages }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn end(&self) -> usize {
        self.base + self.npages * PGSIZE
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    /// 地址所在页帧的下标，地址须已通过范围与对齐检查
    pub fn index_of(&self, pa: usize) -> usize {
        (pa - self.base) / PGSIZE
    }

    pub fn addr_of(&self, index: usize) -> usize {
        self.base + index * PGSIZE
    }

    fn frame(&self, index: usize) -> *mut Frame {
        debug_assert!(index < self.npages);
        self.addr_of(index) as *mut Frame
    }

    /// 读取空闲页的链接字
    ///
    /// # 安全性
    /// `index` 必须是当前持有的某条空闲链表上的页
    unsafe fn next(&self, index: usize) -> Option<usize> {
        (*self.frame(index)).run.next
    }

    /// # 安全性
    /// `index` 必须是已不被任何使用者引用的页
    unsafe fn set_next(&self, index: usize, next: Option<usize>) {
        ptr::addr_of_mut!((*self.frame(index)).run).write(Run { next });
    }

    /// 将整页填充为 `junk`
    ///
    /// # 安全性
    /// 同 [`set_next`](FrameArena::set_next)
    pub unsafe fn fill(&self, index: usize, junk: u8) {
        let bytes = ptr::addr_of_mut!((*self.frame(index)).bytes);
        ptr::write_bytes(bytes.cast::<u8>(), junk, PGSIZE);
    }
}

/// 以页帧下标串起的单链表，只能由其所在的锁（或唯一的所有者）访问
pub struct FrameList {
    head: Option<usize>,
    len: usize,
}

impl FrameList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// 将空闲页 `index` 压入链首
    ///
    /// # 安全性
    /// `index` 不在任何链表上，且不再被使用
    pub unsafe fn push(&mut self, arena: &FrameArena, index: usize) {
        arena.set_next(index, self.head);
        self.head = Some(index);
        self.len += 1;
    }

    /// 从链首弹出一个空闲页
    pub fn pop(&mut self, arena: &FrameArena) -> Option<usize> {
        let index = self.head?;
        // 安全性：链上的页都是空闲页，其开头是有效的链接字
        self.head = unsafe { arena.next(index) };
        self.len -= 1;
        Some(index)
    }

    /// 将 `other` 上的所有页逐个移到本链表，`other` 变为空
    pub fn append(&mut self, arena: &FrameArena, other: &mut FrameList) {
        while let Some(index) = other.pop(arena) {
            unsafe { self.push(arena, index) };
        }
    }
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}
