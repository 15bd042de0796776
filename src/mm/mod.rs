//! 内存管理模块

use crate::consts::PGSIZE;

pub use kalloc::{AllocError, Kmem};

pub mod kalloc;
mod list;

/// 将地址向上对齐到页边界
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 将地址向下对齐到页边界
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
