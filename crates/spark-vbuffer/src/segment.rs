//! 段：指向一个后备存储窗口的链节点。

use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::ArenaKey;
use crate::error::Result;
use crate::store::{HeapStore, StoreRef, writable_in_place};

/// 段在竞技场中的键。
pub(crate) type SegmentKey = ArenaKey;
/// 已注册迭代器在注册表中的键。
pub(crate) type IterKey = ArenaKey;

/// 段级标志。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    /// 段内字节或其拼接点被改写过。
    pub modified: bool,
    /// 段允许写入；封存的链上所有段均为 `false`。
    pub writable: bool,
}

/// 链节点。
///
/// # 契约说明（What）
/// - 段只拥有 `store` 中 `[offset, offset + length)` 的窗口，兄弟段可以共享同一存储的其它窗口；
/// - `iterators` 记录挂在本段上的已注册迭代器键，与注册表槽位中的 `segment` 字段双向一致；
/// - 长度为 0 的段只允许作为空链的唯一锚点存在，编辑过程中产生的空段在返回前被清理。
pub(crate) struct Segment {
    pub(crate) store: StoreRef,
    pub(crate) offset: usize,
    pub(crate) length: usize,
    pub(crate) next: Option<SegmentKey>,
    pub(crate) flags: SegmentFlags,
    pub(crate) iterators: SmallVec<[IterKey; 4]>,
}

impl Segment {
    pub(crate) fn new(store: StoreRef, offset: usize, length: usize, writable: bool) -> Self {
        debug_assert!(offset + length <= store.len());
        Self {
            store,
            offset,
            length,
            next: None,
            flags: SegmentFlags {
                modified: false,
                writable,
            },
            iterators: SmallVec::new(),
        }
    }

    /// 段窗口的只读视图。
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.store.get()[self.offset..self.offset + self.length]
    }

    /// 段窗口的可写视图。
    ///
    /// 存储被共享或不支持就地写入时，先把窗口复制到新的私有堆块（写时复制），
    /// 随后 `offset` 归零。复制失败时段保持原状。
    pub(crate) fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if !writable_in_place(&mut self.store) {
            let private = HeapStore::copy_from_slice(self.bytes())?;
            tracing::trace!(len = self.length, "vbuffer segment copied on write");
            self.store = Arc::new(private);
            self.offset = 0;
        }
        let (start, end) = (self.offset, self.offset + self.length);
        match Arc::get_mut(&mut self.store).and_then(|store| store.get_mut()) {
            Some(raw) => Ok(&mut raw[start..end]),
            None => unreachable!("segment store was made private above"),
        }
    }

    /// 构造从 `at` 开始的后半段（共享同一存储），本段不变；调用方随后截短本段。
    pub(crate) fn tail_at(&self, at: usize) -> Segment {
        debug_assert!(at <= self.length);
        Segment {
            store: Arc::clone(&self.store),
            offset: self.offset + at,
            length: self.length - at,
            next: self.next,
            flags: self.flags,
            iterators: SmallVec::new(),
        }
    }

    /// 判断 `other` 是否紧接在本段窗口之后且共享同一存储，可零拷贝合并。
    pub(crate) fn is_contiguous_with(&self, other: &Segment) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
            && self.offset + self.length == other.offset
            && self.flags.writable == other.flags.writable
    }
}
