//! 后备存储：段背后的引用计数原始字节。
//!
//! # 模块定位（Why）
//! - 同一块报文内存常被多个段共享：`extract` 出的子链、插入后被拆开的两半、改写补丁；
//!   引擎只关心“能否读到窗口内的字节”以及“写入前是否需要私有副本”，不关心内存来自何处；
//! - 捕获源（抓包环形区、映射文件、内存池）各自决定分配与回收策略，
//!   因此存储抽象为 [`BackingStore`] trait，由段以 `Arc<dyn BackingStore>` 共享持有。
//!
//! # 设计概要（How）
//! - 引用计数即 `Arc` 的强计数：克隆等价于 `addref`，`Drop` 等价于 `release`，计数操作为原子操作；
//! - `get_mut` 返回 `None` 表示存储不能就地写入（共享、只读映射）；
//!   写时复制由段在写入前完成，复制范围只覆盖段自身的窗口；
//! - 三种内建实现：[`HeapStore`]（`BytesMut`，可写，可挂接回收器）、
//!   [`SharedStore`]（`Bytes`，零拷贝共享只读）、[`MappedStore`]（任意 `AsRef<[u8]>`，例如映射区域）。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::{Result, VbufferError, raise};
use crate::pool::StoreRecycler;

/// 存储来源分类，用于日志与调试。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// 引擎或内存池分配的可写堆块。
    Heap,
    /// 与外部共享的不可变字节（`bytes::Bytes`）。
    Shared,
    /// 外部映射区域，只读。
    Mapped,
}

/// 后备存储能力集。
///
/// # 契约说明（What）
/// - `get` 返回存储的完整连续范围，段只访问其中 `[offset, offset + length)` 的窗口；
/// - `get_mut` 仅在存储允许就地写入时返回 `Some`，且返回切片长度必须等于 `len()`；
/// - 实现必须 `Send + Sync`，以便共享同一存储的链可以分别移动到不同线程。
pub trait BackingStore: Send + Sync + 'static {
    /// 存储来源。
    fn kind(&self) -> StoreKind;

    /// 只读访问。
    fn get(&self) -> &[u8];

    /// 可写访问；不支持就地写入时返回 `None`。
    fn get_mut(&mut self) -> Option<&mut [u8]>;

    /// 存储的字节数。
    fn len(&self) -> usize {
        self.get().len()
    }

    /// 是否为空存储。
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 段对存储的共享引用。
pub type StoreRef = Arc<dyn BackingStore>;

/// 可写堆块。
///
/// 挂接 [`StoreRecycler`] 后，最后一个引用释放时底层 `BytesMut` 会交还回收器，
/// 供捕获源复用同一块内存。
pub struct HeapStore {
    buf: BytesMut,
    recycler: Option<Arc<dyn StoreRecycler>>,
}

impl HeapStore {
    /// 分配 `size` 字节的零填充堆块；分配失败时返回资源耗尽错误。
    pub fn zeroed(size: usize) -> Result<Self> {
        Ok(Self::from_bytes_mut(try_zeroed(size)?, None))
    }

    /// 复制 `data` 生成新的堆块。
    pub fn copy_from_slice(data: &[u8]) -> Result<Self> {
        let mut raw = Vec::new();
        if raw.try_reserve_exact(data.len()).is_err() {
            return raise(VbufferError::ResourceExhausted {
                requested: data.len(),
            });
        }
        raw.extend_from_slice(data);
        Ok(Self::from_vec(raw))
    }

    /// 接管已有的 `Vec<u8>`。
    pub fn from_vec(raw: Vec<u8>) -> Self {
        Self::from_bytes_mut(vec_into_bytes_mut(raw), None)
    }

    /// 接管已有的 `BytesMut`，可附带回收器。
    pub fn from_bytes_mut(buf: BytesMut, recycler: Option<Arc<dyn StoreRecycler>>) -> Self {
        Self { buf, recycler }
    }
}

impl BackingStore for HeapStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Heap
    }

    fn get(&self) -> &[u8] {
        &self.buf
    }

    fn get_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.buf)
    }
}

impl Drop for HeapStore {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            let mut buf = core::mem::take(&mut self.buf);
            buf.clear();
            recycler.reclaim(buf);
        }
    }
}

/// 共享只读字节，例如捕获层交付的报文。
///
/// 写入经过该存储的段时，段会复制自身窗口到新的 [`HeapStore`]，原始报文保持不变。
pub struct SharedStore {
    bytes: Bytes,
}

impl SharedStore {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl BackingStore for SharedStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Shared
    }

    fn get(&self) -> &[u8] {
        &self.bytes
    }

    fn get_mut(&mut self) -> Option<&mut [u8]> {
        None
    }
}

/// 外部映射区域（例如 `memmap2::Mmap` 或 `&'static [u8]`），只读。
pub struct MappedStore<T> {
    region: T,
}

impl<T> MappedStore<T>
where
    T: AsRef<[u8]> + Send + Sync + 'static,
{
    pub fn new(region: T) -> Self {
        Self { region }
    }
}

impl<T> BackingStore for MappedStore<T>
where
    T: AsRef<[u8]> + Send + Sync + 'static,
{
    fn kind(&self) -> StoreKind {
        StoreKind::Mapped
    }

    fn get(&self) -> &[u8] {
        self.region.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut [u8]> {
        None
    }
}

/// 以可失败的方式分配零填充的 `BytesMut`。
pub(crate) fn try_zeroed(size: usize) -> Result<BytesMut> {
    let mut raw = Vec::new();
    if raw.try_reserve_exact(size).is_err() {
        return raise(VbufferError::ResourceExhausted { requested: size });
    }
    raw.resize(size, 0);
    Ok(vec_into_bytes_mut(raw))
}

fn vec_into_bytes_mut(raw: Vec<u8>) -> BytesMut {
    match Bytes::from(raw).try_into_mut() {
        Ok(buf) => buf,
        Err(shared) => BytesMut::from(&shared[..]),
    }
}

/// 判断存储能否被当前持有者就地写入：引用唯一且实现允许写入。
pub(crate) fn writable_in_place(store: &mut StoreRef) -> bool {
    Arc::get_mut(store).is_some_and(|inner| inner.get_mut().is_some())
}
