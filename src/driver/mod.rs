//! 设备驱动接口

use crate::fs::BufData;

#[cfg(any(test, feature = "hosted"))]
pub mod ramdisk;

/// 块设备驱动。
///
/// 缓冲区缓存通过它同步地读写一个磁盘块。驱动要么完成整块的传输，
/// 要么在遇到不可恢复的硬件错误时 panic，不向调用方返回软错误。
pub trait BlockDevice: Sync {
    /// 读（`write == false`）或写（`write == true`）设备 `dev` 上的第 `blockno` 块。
    ///
    /// 调用方持有该块缓冲区的睡眠锁。
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, write: bool);
}
