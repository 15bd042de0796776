//! 内核常量

/// 最大 CPU（hart）数目
pub const NCPU: usize = 8;

/// 页大小（字节）
pub const PGSIZE: usize = 4096;

/// 页内偏移所占的位数
pub const PGSHIFT: usize = 12;

pub mod fs {
    /// 缓冲区缓存中的缓冲块数目
    pub const NBUF: usize = 30;

    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 缓冲区缓存的哈希桶数目，取素数以使块号分布均匀
    pub const NBUCKET: usize = 13;
}

pub mod mm {
    /// 本地空闲链表为空时，一次最多从其他 CPU 偷取的页数
    pub const STEAL_BATCH: usize = 64;

    /// 分配出去的页用该字节填充，以暴露未初始化读
    pub const ALLOC_JUNK: u8 = 5;

    /// 释放回来的页用该字节填充，以暴露悬垂引用
    pub const FREE_JUNK: u8 = 1;
}
