//! 缓存层
//!
//! 缓冲区缓存持有固定数目的缓冲块，每块缓存一个磁盘块的内容，
//! 同时也是多个进程访问同一磁盘块时的同步点。
//!
//! 接口：
//! * 调用 [`Bcache::bread`] 取得某个磁盘块的缓冲区；
//! * 修改数据后调用 [`Buf::bwrite`] 写回磁盘；
//! * 用完后丢弃 [`Buf`]，即释放该缓冲区；
//! * 同一时刻只有一个执行流能使用某个缓冲区，不要持有过久。
//!
//! 缓冲块按块号散列到 `NBUCKET` 个桶中，每个桶由一把自旋锁保护其链表
//! 以及链上各块的元数据（设备号、块号、引用计数、空闲时刻）；
//! 块内容则由各自的睡眠锁保护。命中时只需要一个桶锁；
//! 未命中时由全局的替换锁串行化，保证同一个块不会被缓存两份。

use array_macro::array;
use log::trace;

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::process::cpus;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 链表结束标记
const NIL: usize = usize::MAX;

#[inline]
const fn hash(blockno: u32) -> usize {
    blockno as usize % NBUCKET
}

/// 缓冲区缓存。
///
/// 内核通常将它放在 `static` 中：
/// ```ignore
/// pub static BCACHE: Bcache<'static> = Bcache::new(&DISK);
/// ```
/// 构造时所有缓冲块都挂在 0 号桶上，且引用计数为 0，之后第一次被取用时
/// 才获得身份并移动到所属的桶。
pub struct Bcache<'d> {
    disk: &'d dyn BlockDevice,

    /// 替换锁，同一时刻只允许一次未命中处理（查找牺牲块并重新定位）
    replace: SpinLock<()>,

    /// 哈希桶，每个桶保存一条以缓冲块下标串起的单链表
    buckets: [SpinLock<Bucket>; NBUCKET],

    /// 缓冲块元数据，由其当前所在桶的锁保护
    ctrl: [BufCtrl; NBUF],

    /// 缓冲块内容，由各自的睡眠锁保护
    bufs: [BufInner; NBUF],
}

impl<'d> Bcache<'d> {
    pub const fn new(disk: &'d dyn BlockDevice) -> Self {
        Self {
            disk,
            replace: SpinLock::new((), "bcache_replace"),
            buckets: array![i => SpinLock::new(Bucket::new(if i == 0 { 0 } else { NIL }), "bcache_bucket"); NBUCKET],
            ctrl: array![i => BufCtrl::new(if i + 1 < NBUF { i + 1 } else { NIL }); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 返回一个已加锁的缓冲区，其内容为指定磁盘块的数据。
    ///
    /// # 功能说明
    /// 先通过 `bget` 取得缓冲区（此时已持有其睡眠锁），若内容尚未从磁盘读入，
    /// 则调用驱动读取并标记为有效。
    ///
    /// # 参数
    /// - `dev`: 设备号；
    /// - `blockno`: 块号。
    ///
    /// # 返回值
    /// 持有睡眠锁的 [`Buf`]，丢弃它即释放缓冲区。
    ///
    /// # Panics
    /// 所有缓冲块都在使用中（引用计数均大于 0）时 panic，
    /// 这说明 `NBUF` 对当前负载配置过小。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Acquire) {
            self.disk.rw(dev, blockno, &mut b.data, false);
            self.bufs[b.index].valid.store(true, Ordering::Release);
        }
        b
    }

    /// 在缓存中查找设备 `dev` 上的块 `blockno`，未找到时回收一个空闲缓冲块。
    /// 两种情况下都返回已加锁的缓冲区。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let id = hash(blockno);

        // 是否已被缓存？
        let bucket = self.buckets[id].lock();
        if let Some(index) = self.find_cached(&bucket, dev, blockno) {
            self.ctrl[index].get();
            drop(bucket);
            return self.locked(index, dev, blockno);
        }

        // 未缓存。
        // 先释放桶锁再获取替换锁，避免与其他 CPU 的快速路径形成死锁
        drop(bucket);
        let replace = self.replace.lock();

        // 两把锁之间的空隙里其他 CPU 可能已经缓存了该块，再查一次
        let bucket = self.buckets[id].lock();
        if let Some(index) = self.find_cached(&bucket, dev, blockno) {
            self.ctrl[index].get();
            drop(bucket);
            drop(replace);
            return self.locked(index, dev, blockno);
        }
        drop(bucket);

        // 仍未缓存，回收空闲最久的缓冲块。
        // 持有替换锁期间不会有块被插入任何桶
        let victim = match self.find_victim() {
            Some(victim) => victim,
            None => panic!("bget: no buffers"),
        };
        let Victim { bucket: from, guard: mut source, prev, index, .. } = victim;
        self.unlink(&mut source, prev, index);
        let mut target = if from == id {
            source
        } else {
            drop(source);
            self.buckets[id].lock()
        };
        self.ctrl[index].next.store(target.head, Ordering::Relaxed);
        target.head = index;

        trace!("bget: recycle buf {} from bucket {} for ({}, {})", index, from, dev, blockno);

        // 引用计数置 1 并加睡眠锁之后才放开桶锁与替换锁，
        // 其他 CPU 不会看到一个半初始化且引用计数为 0 的缓冲块
        let ctrl = &self.ctrl[index];
        ctrl.dev.store(dev, Ordering::Relaxed);
        ctrl.blockno.store(blockno, Ordering::Relaxed);
        ctrl.assigned.store(true, Ordering::Relaxed);
        ctrl.refcnt.store(1, Ordering::Relaxed);
        self.bufs[index].valid.store(false, Ordering::Release);
        let data = self.bufs[index].data.lock();
        drop(target);
        drop(replace);

        Buf::new(self, index, dev, blockno, data)
    }

    /// 在已加锁的桶中查找缓存块
    fn find_cached(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = bucket.head;
        while b != NIL {
            let ctrl = &self.ctrl[b];
            if ctrl.is(dev, blockno) {
                return Some(b);
            }
            b = ctrl.next.load(Ordering::Relaxed);
        }
        None
    }

    /// 扫描所有桶，找到引用计数为 0 且空闲时刻最早的缓冲块。
    ///
    /// 调用方须持有替换锁。任一时刻最多持有两把桶锁：
    /// 正在扫描的桶，以及当前最佳候选所在的桶。
    /// 返回的候选所在桶仍处于加锁状态，以便直接摘除。
    /// 空闲时刻相同时取扫描中先遇到的那个。
    fn find_victim(&self) -> Option<Victim<'_>> {
        let mut best: Option<Victim<'_>> = None;

        for (i, lock) in self.buckets.iter().enumerate() {
            let bucket = lock.lock();
            let mut bound = best.as_ref().map(|v| v.tick);
            let mut found = None;

            let mut prev = NIL;
            let mut b = bucket.head;
            while b != NIL {
                let ctrl = &self.ctrl[b];
                let tick = ctrl.tick.load(Ordering::Relaxed);
                if ctrl.refcnt.load(Ordering::Relaxed) == 0 && bound.map_or(true, |t| tick < t) {
                    found = Some((prev, b));
                    bound = Some(tick);
                }
                prev = b;
                b = ctrl.next.load(Ordering::Relaxed);
            }

            // 替换时先持有新桶再放开旧桶
            if let (Some((prev, index)), Some(tick)) = (found, bound) {
                best = Some(Victim { bucket: i, guard: bucket, prev, index, tick });
            }
        }

        best
    }

    /// 将 `index` 从已加锁的桶中摘除，`prev` 为其前驱（`NIL` 表示链首）
    fn unlink(&self, bucket: &mut Bucket, prev: usize, index: usize) {
        let next = self.ctrl[index].next.load(Ordering::Relaxed);
        if prev == NIL {
            bucket.head = next;
        } else {
            self.ctrl[prev].next.store(next, Ordering::Relaxed);
        }
        self.ctrl[index].next.store(NIL, Ordering::Relaxed);
    }

    fn locked(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        let data = self.bufs[index].data.lock();
        Buf::new(self, index, dev, blockno, data)
    }

    /// 释放一个引用。引用计数归零时记下当前时刻，作为之后替换的依据。
    fn brelse(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[hash(blockno)].lock();
        let ctrl = &self.ctrl[index];
        let refcnt = ctrl.refcnt.load(Ordering::Relaxed) - 1;
        ctrl.refcnt.store(refcnt, Ordering::Relaxed);
        if refcnt == 0 {
            ctrl.tick.store(cpus().ticks(), Ordering::Relaxed);
        }
        drop(bucket);
    }

    fn bpin(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[hash(blockno)].lock();
        self.ctrl[index].get();
        drop(bucket);
    }

    fn bunpin(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[hash(blockno)].lock();
        let ctrl = &self.ctrl[index];
        let refcnt = ctrl.refcnt.load(Ordering::Relaxed);
        if refcnt <= 1 {
            panic!("buf unpin not match");
        }
        ctrl.refcnt.store(refcnt - 1, Ordering::Relaxed);
        drop(bucket);
    }
}

/// 已加锁的缓冲区。
///
/// 持有期间独占块内容；丢弃时先释放睡眠锁，再在所属桶锁下减少引用计数。
pub struct Buf<'a> {
    cache: &'a Bcache<'a>,
    index: usize,
    dev: u32,
    blockno: u32,
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    fn new(
        cache: &'a Bcache<'a>,
        index: usize,
        dev: u32,
        blockno: u32,
        data: SleepLockGuard<'a, BufData>,
    ) -> Self {
        Self { cache, index, dev, blockno, data: ManuallyDrop::new(data) }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.data
    }

    /// 将缓冲区内容写回磁盘。
    ///
    /// # Panics
    /// 当前执行流不是该缓冲区睡眠锁的持有者时 panic，
    /// 例如缓冲区被转交给了另一个执行流。
    pub fn bwrite(&mut self) {
        if !self.data.holding() {
            panic!("bwrite");
        }
        self.cache.disk.rw(self.dev, self.blockno, &mut self.data, true);
    }

    /// 增加引用计数，使缓冲区在本守卫释放后仍常驻缓存，不会被替换
    pub fn pin(&self) {
        self.cache.bpin(self.index, self.blockno);
    }

    /// 撤销一次 [`pin`](Buf::pin)。
    ///
    /// # Panics
    /// 没有与之配对的 `pin` 时 panic。
    pub fn unpin(&self) {
        self.cache.bunpin(self.index, self.blockno);
    }
}

impl<'a> Drop for Buf<'a> {
    /// # Panics
    /// 当前执行流不持有该缓冲区的睡眠锁时 panic（栈展开中除外）。
    fn drop(&mut self) {
        if !self.data.holding() && !unwinding() {
            panic!("brelse");
        }
        // 先放开睡眠锁，再减少引用计数
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.brelse(self.index, self.blockno);
    }
}

/// 是否正在因 panic 展开栈。内核以 `panic = "abort"` 构建，不会展开
#[inline]
fn unwinding() -> bool {
    #[cfg(any(test, feature = "hosted"))]
    {
        std::thread::panicking()
    }
    #[cfg(not(any(test, feature = "hosted")))]
    {
        false
    }
}

/// 牺牲块候选，及其所在桶的锁
struct Victim<'a> {
    bucket: usize,
    guard: SpinLockGuard<'a, Bucket>,
    prev: usize,
    index: usize,
    tick: usize,
}

/// 一个哈希桶：缓冲块下标组成的单链表
struct Bucket {
    head: usize,
}

impl Bucket {
    const fn new(head: usize) -> Self {
        Self { head }
    }
}

/// 缓冲块元数据。
///
/// 各字段只在持有所在桶的锁时修改；使用原子类型只是为了在桶之间迁移时
/// 不必借用桶锁守卫，内存顺序由桶锁保证。
struct BufCtrl {
    /// 是否已被分配过身份；从未使用过的缓冲块不与任何磁盘块匹配
    assigned: AtomicBool,
    dev: AtomicU32,
    blockno: AtomicU32,
    refcnt: AtomicUsize,
    /// 引用计数最近一次归零的时刻
    tick: AtomicUsize,
    next: AtomicUsize,
}

impl BufCtrl {
    const fn new(next: usize) -> Self {
        Self {
            assigned: AtomicBool::new(false),
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(0),
            refcnt: AtomicUsize::new(0),
            tick: AtomicUsize::new(0),
            next: AtomicUsize::new(next),
        }
    }

    /// 是否缓存着设备 `dev` 上的块 `blockno`，调用方须持有所在桶的锁
    fn is(&self, dev: u32, blockno: u32) -> bool {
        self.assigned.load(Ordering::Relaxed)
            && self.dev.load(Ordering::Relaxed) == dev
            && self.blockno.load(Ordering::Relaxed) == blockno
    }

    /// 引用计数加一，调用方须持有所在桶的锁
    fn get(&self) {
        let refcnt = self.refcnt.load(Ordering::Relaxed);
        self.refcnt.store(refcnt + 1, Ordering::Relaxed);
    }
}

struct BufInner {
    /// 数据是否已从磁盘读入
    valid: AtomicBool,

    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// 一个磁盘块的数据
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ramdisk::RamDisk;
    use crate::process::host;
    use std::thread;
    use std::vec::Vec;

    const DEV: u32 = 1;

    impl<'d> Bcache<'d> {
        /// 缓存中身份为 (dev, blockno) 的缓冲块数目
        fn copies(&self, dev: u32, blockno: u32) -> usize {
            self.buckets
                .iter()
                .map(|lock| {
                    let bucket = lock.lock();
                    let mut n = 0;
                    let mut b = bucket.head;
                    while b != NIL {
                        let ctrl = &self.ctrl[b];
                        if ctrl.is(dev, blockno) {
                            n += 1;
                        }
                        b = ctrl.next.load(Ordering::Relaxed);
                    }
                    n
                })
                .sum()
        }

        fn cached(&self, dev: u32, blockno: u32) -> bool {
            let bucket = self.buckets[hash(blockno)].lock();
            self.find_cached(&bucket, dev, blockno).is_some()
        }

        fn refcnt(&self, dev: u32, blockno: u32) -> usize {
            let bucket = self.buckets[hash(blockno)].lock();
            match self.find_cached(&bucket, dev, blockno) {
                Some(index) => self.ctrl[index].refcnt.load(Ordering::Relaxed),
                None => 0,
            }
        }

        /// 依次读入 [from, from + n) 各块并立即释放
        fn touch(&self, from: u32, n: u32) {
            for blockno in from..from + n {
                drop(self.bread(DEV, blockno));
            }
        }
    }

    #[test]
    fn hit_reads_disk_once() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let b = bcache.bread(DEV, 5);
        let index = b.index;
        drop(b);
        let b = bcache.bread(DEV, 5);
        assert_eq!(b.index, index);
        assert_eq!(b.blockno(), 5);
        assert_eq!(disk.reads(), 1);
        drop(b);
        assert_eq!(bcache.refcnt(DEV, 5), 0);
    }

    #[test]
    fn same_blockno_on_other_device_is_distinct() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let a = bcache.bread(1, 9);
        let b = bcache.bread(2, 9);
        assert_ne!(a.index, b.index);
        assert_eq!(disk.reads(), 2);
    }

    #[test]
    fn written_data_survives_eviction() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let mut b = bcache.bread(DEV, 3);
        b.data_mut()[0] = 0xab;
        b.data_mut()[BSIZE - 1] = 0xcd;
        b.bwrite();
        drop(b);
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.peek(DEV, 3)[0], 0xab);

        // 读入足够多的其他块，把块 3 挤出缓存
        bcache.touch(100, NBUF as u32);
        assert!(!bcache.cached(DEV, 3));

        let reads = disk.reads();
        let b = bcache.bread(DEV, 3);
        assert_eq!(disk.reads(), reads + 1);
        assert_eq!(b.data()[0], 0xab);
        assert_eq!(b.data()[BSIZE - 1], 0xcd);
    }

    #[test]
    fn evicts_least_recently_idled() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        // 块 0..NBUF 依次空闲，块 0 最早
        bcache.touch(0, NBUF as u32);
        // 再次使用块 0，现在块 1 空闲最久
        bcache.touch(0, 1);

        drop(bcache.bread(DEV, 1000));
        assert!(bcache.cached(DEV, 0));
        assert!(!bcache.cached(DEV, 1));
        assert!(bcache.cached(DEV, 2));

        drop(bcache.bread(DEV, 1001));
        assert!(!bcache.cached(DEV, 2));
        assert!(bcache.cached(DEV, 3));
    }

    #[test]
    fn referenced_buffer_is_never_evicted() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let held = bcache.bread(DEV, 7);
        let pinned = bcache.bread(DEV, 8);
        pinned.pin();
        drop(pinned);
        assert_eq!(bcache.refcnt(DEV, 8), 1);

        // 远多于缓冲块数目的其他块轮流进出
        bcache.touch(200, 4 * NBUF as u32);
        assert!(bcache.cached(DEV, 7));
        assert!(bcache.cached(DEV, 8));
        assert_eq!(held.blockno(), 7);

        let reads = disk.reads();
        let b = bcache.bread(DEV, 8);
        assert_eq!(disk.reads(), reads);
        b.unpin();
        drop(b);
        assert_eq!(bcache.refcnt(DEV, 8), 0);
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn exhausted_pool_panics() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let held: Vec<Buf<'_>> = (0..NBUF as u32).map(|n| bcache.bread(DEV, n)).collect();
        assert_eq!(held.len(), NBUF);
        bcache.bread(DEV, NBUF as u32);
    }

    #[test]
    #[should_panic(expected = "buf unpin not match")]
    fn unpin_without_pin_panics() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let b = bcache.bread(DEV, 4);
        b.unpin();
    }

    #[test]
    #[should_panic(expected = "bwrite")]
    fn bwrite_from_non_holder_panics() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let b = bcache.bread(DEV, 6);
        // 缓冲区被转交给另一个执行流，后者并不持有其睡眠锁
        let result = thread::scope(|s| s.spawn(move || {
            let mut b = b;
            b.bwrite();
        }).join());
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    #[should_panic(expected = "brelse")]
    fn release_from_non_holder_panics() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        let b = bcache.bread(DEV, 6);
        let result = thread::scope(|s| s.spawn(move || drop(b)).join());
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    fn unused_slots_match_no_block() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        // 所有缓冲块初始都在 0 号桶，但都还没有身份
        assert!(!bcache.cached(0, 0));
        assert_eq!(bcache.copies(0, 0), 0);

        let b = bcache.bread(0, 0);
        assert_eq!(bcache.refcnt(0, 0), 1);
        drop(b);
        assert_eq!(bcache.copies(0, 0), 1);
        assert_eq!(disk.reads(), 1);

        drop(bcache.bread(0, 0));
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn concurrent_readers_share_one_copy() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;

        thread::scope(|s| {
            for t in 0..THREADS {
                let bcache = &bcache;
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        let mut b = bcache.bread(DEV, 42);
                        let n = u32::from_le_bytes(b.data()[..4].try_into().unwrap());
                        b.data_mut()[..4].copy_from_slice(&(n + 1).to_le_bytes());
                        b.bwrite();
                        drop(b);
                        // 穿插读其他块制造替换压力
                        drop(bcache.bread(DEV, (1 + t * ROUNDS + round) as u32 % 20 + 43));
                    }
                });
            }
        });

        assert_eq!(bcache.copies(DEV, 42), 1);
        let b = bcache.bread(DEV, 42);
        let n = u32::from_le_bytes(b.data()[..4].try_into().unwrap());
        assert_eq!(n as usize, THREADS * ROUNDS);
        assert_eq!(disk.peek(DEV, 42)[..4], b.data()[..4]);
    }

    #[test]
    fn concurrent_misses_do_not_duplicate() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for blockno in 0..(2 * NBUF as u32) {
                        drop(bcache.bread(DEV, blockno));
                    }
                });
            }
        });

        for blockno in 0..(2 * NBUF as u32) {
            assert!(bcache.copies(DEV, blockno) <= 1);
            assert_eq!(bcache.refcnt(DEV, blockno), 0);
        }
    }

    #[test]
    fn hits_in_other_buckets_are_not_blocked() {
        host::install();
        let disk = RamDisk::new();
        let bcache = Bcache::new(&disk);
        assert_ne!(hash(1), hash(2));

        bcache.touch(2, 1);
        // 占住块 1 所在的桶，块 2 的命中路径仍能完成
        let bucket = bcache.buckets[hash(1)].lock();
        thread::scope(|s| {
            s.spawn(|| {
                let b = bcache.bread(DEV, 2);
                assert_eq!(b.blockno(), 2);
            });
        });
        drop(bucket);
        assert_eq!(disk.reads(), 1);
    }
}
