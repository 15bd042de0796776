//! xv6 内核的资源管理核心：分桶的块缓冲区缓存与按 CPU 划分的物理页分配器。
//!
//! 调度器与磁盘驱动不在本 crate 内实现，分别通过 [`process::Cpus`]
//! 与 [`driver::BlockDevice`] 接入。

#![no_std]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "hosted"))]
extern crate std;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sleeplock;
pub mod spinlock;
