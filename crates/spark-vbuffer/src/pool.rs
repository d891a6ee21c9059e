use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;
use spin::Mutex;

use crate::error::Result;
use crate::store::{HeapStore, try_zeroed};

/// `StoreRecycler` 描述堆块在最后一个引用释放时的归还入口。
///
/// # 设计初衷（Why）
/// - 捕获源通常按报文反复申请同尺寸内存；若每次 `create_new` 都向系统分配，
///   高包率下会产生明显抖动；
/// - 段之间共享存储，只有最后一个持有者释放时才能真正归还，
///   因此回收挂在 [`HeapStore`] 的 `Drop` 上，由 `Arc` 计数决定时机。
///
/// # 契约定义（What）
/// - `buf` 已被清空（`len() == 0`），容量保持不变；
/// - **前置条件**：实现必须线程安全且不得 panic，`Drop` 路径上的 panic 会导致进程终止。
pub trait StoreRecycler: Send + Sync + 'static {
    /// 接收一块可复用的内存。
    fn reclaim(&self, buf: BytesMut);
}

/// `StorePool` 基于自由链表复用 `BytesMut`，为 `Vbuffer::create_new_in` 提供存储。
///
/// # 核心机制（How）
/// - `spin::Mutex<Vec<BytesMut>>` 保存空闲块，租借时优先取容量足够的块；
/// - `PoolMetrics` 以原子计数记录分配、复用与在借数量，[`StorePool::stats`] 返回快照；
/// - 池自身实现 [`StoreRecycler`]，在 `HeapStore` 释放时接回内存。
///
/// # 设计权衡（Trade-offs）
/// - 自旋锁临界区只包含一次线性查找与 `swap_remove`，争用时间极短；
/// - `shrink` 采取“清空自由链表”的简单策略，便于压测后快速归还峰值内存。
#[derive(Clone, Default)]
pub struct StorePool {
    inner: Arc<PoolInner>,
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorePoolStats {
    /// 向系统申请的累计字节数（扣除收缩丢弃的部分）。
    pub allocated_bytes: usize,
    /// 自由链表中可直接复用的字节数。
    pub available_bytes: usize,
    /// 仍被存储持有的块数。
    pub active_blocks: usize,
    /// 命中自由链表的次数。
    pub reused_blocks: u64,
}

impl StorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 租借一个零填充、长度为 `size` 的堆块，并挂接本池作为回收器。
    pub fn alloc(&self, size: usize) -> Result<HeapStore> {
        let buf = self.inner.acquire(size)?;
        let recycler: Arc<dyn StoreRecycler> = self.inner.clone();
        Ok(HeapStore::from_bytes_mut(buf, Some(recycler)))
    }

    /// 清空自由链表，返回释放的字节数。
    pub fn shrink(&self) -> usize {
        let mut list = self.inner.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::capacity).sum();
        list.clear();
        self.inner.metrics.forget(reclaimed);
        reclaimed
    }

    pub fn stats(&self) -> StorePoolStats {
        let metrics = &self.inner.metrics;
        StorePoolStats {
            allocated_bytes: metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: metrics.available_bytes.load(Ordering::Relaxed),
            active_blocks: metrics.active_blocks.load(Ordering::Relaxed),
            reused_blocks: metrics.reused_blocks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn acquire(&self, size: usize) -> Result<BytesMut> {
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= size)
                .map(|index| list.swap_remove(index))
        };
        let mut buf = match reused {
            Some(buf) => {
                self.metrics.on_reuse(buf.capacity());
                buf
            }
            None => {
                let buf = try_zeroed(size)?;
                self.metrics.on_allocate(buf.capacity());
                buf
            }
        };
        buf.clear();
        buf.resize(size, 0);
        self.metrics.active_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }
}

impl StoreRecycler for PoolInner {
    fn reclaim(&self, buf: BytesMut) {
        saturating_sub(&self.metrics.active_blocks, 1);
        self.metrics
            .available_bytes
            .fetch_add(buf.capacity(), Ordering::Relaxed);
        self.free_list.lock().push(buf);
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_blocks: AtomicUsize,
    reused_blocks: AtomicU64,
}

impl PoolMetrics {
    fn on_allocate(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn on_reuse(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
        self.reused_blocks.fetch_add(1, Ordering::Relaxed);
    }

    fn forget(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
        saturating_sub(&self.allocated_bytes, capacity);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
