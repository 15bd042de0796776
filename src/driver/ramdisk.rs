//! 内存盘：以哈希表保存块内容的 [`BlockDevice`] 实现，用于模拟与测试。

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::boxed::Box;

use crate::consts::fs::BSIZE;
use crate::fs::BufData;
use crate::spinlock::SpinLock;
use super::BlockDevice;

/// 从未写过的块读出来全为 0。
pub struct RamDisk {
    blocks: SpinLock<Option<HashMap<(u32, u32), Box<[u8; BSIZE]>>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub const fn new() -> Self {
        Self {
            blocks: SpinLock::new(None, "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 累计的读块次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 累计的写块次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接查看设备上某块的内容
    pub fn peek(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        let blocks = self.blocks.lock();
        blocks
            .as_ref()
            .and_then(|map| map.get(&(dev, blockno)))
            .map_or([0; BSIZE], |block| **block)
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, write: bool) {
        let mut blocks = self.blocks.lock();
        let map = blocks.get_or_insert_with(HashMap::new);
        if write {
            map.insert((dev, blockno), Box::new(**data));
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            **data = map.get(&(dev, blockno)).map_or([0; BSIZE], |block| **block);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }
}
