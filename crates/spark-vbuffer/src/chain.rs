//! 缓冲链：构造、销毁、尺寸查询与结构编辑（插入、擦除、提取）。
//!
//! # 设计概要（How）
//! - 段存放在 [`Arena`] 中，通过 `next` 键串成单链，`head` 指向首段；链至少包含一个段，
//!   空链由唯一的零长度锚点段表示；
//! - 已注册迭代器存放在同一条链的注册表中，槽位记录 `(段键, 段内偏移)`；
//!   结构编辑只需改写被拆分或被拼接段上的迭代器，下游段上的迭代器以段内偏移表达位置，天然保持正确；
//! - 每次结构编辑递增 `epoch`，未注册的迭代器快照与 mmap 游标据此识别失效。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use smallvec::SmallVec;
use thiserror::Error;

use crate::arena::Arena;
use crate::config::VbufferConfig;
use crate::error::{Result, VbufferError, raise, record};
use crate::owner::OwnerBinding;
use crate::pool::StorePool;
use crate::segment::{IterKey, Segment, SegmentKey};
use crate::store::{HeapStore, SharedStore, StoreRef};
use crate::ALL;

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// 缓冲链的进程内唯一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u64);

impl ChainId {
    fn next() -> Self {
        ChainId(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 原始数值，用于日志与绑定层令牌。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vbuf-{}", self.0)
    }
}

/// 注册表槽位：已注册迭代器的权威位置。
#[derive(Clone, Copy, Debug)]
pub(crate) struct IterSlot {
    pub(crate) segment: SegmentKey,
    pub(crate) offset: usize,
    pub(crate) post: bool,
    pub(crate) readonly: bool,
}

/// `Vbuffer` 是由多个段拼接而成的逻辑字节流。
///
/// # 设计动机（Why）
/// - 报文改写需要在捕获内存、插入补丁与提取片段之间自由拼接，而不复制整个报文；
/// - 协议解析器在改写期间仍持有指向报文内部的游标，结构编辑必须就地修正这些游标。
///
/// # 契约说明（What）
/// - 同一条链同一时刻只有一个可变所有者，引擎不做内部同步；`Vbuffer` 可在线程间移动；
/// - 所有失败操作返回 [`VbufferError`] 并保持链的逻辑内容与迭代器位置不变；
/// - 释放时若仍有已注册迭代器，[`Vbuffer::free`] 拒绝释放并交还链，隐式 `Drop` 则记录错误日志后强制解绑。
pub struct Vbuffer {
    pub(crate) id: ChainId,
    pub(crate) segments: Arena<Segment>,
    pub(crate) head: SegmentKey,
    pub(crate) registry: Arena<IterSlot>,
    pub(crate) epoch: u64,
    pub(crate) sealed: bool,
    pub(crate) config: VbufferConfig,
    pub(crate) owner: Option<OwnerBinding>,
}

/// [`Vbuffer::free`] 的失败结果，携带被拒绝释放的链。
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FreeError {
    error: VbufferError,
    buffer: Vbuffer,
}

impl FreeError {
    pub fn error(&self) -> &VbufferError {
        &self.error
    }

    /// 取回未被释放的链，调用方可先注销迭代器再重试。
    pub fn into_buffer(self) -> Vbuffer {
        self.buffer
    }
}

impl Vbuffer {
    /// 分配 `size` 字节的零填充可写链。
    pub fn create_new(size: usize) -> Result<Self> {
        let store: StoreRef = Arc::new(HeapStore::zeroed(size)?);
        Self::from_segment(Segment::new(store, 0, size, true), VbufferConfig::default())
    }

    /// 从内存池租借存储创建链，存储在最后一个引用释放后回到池中。
    pub fn create_new_in(pool: &StorePool, size: usize) -> Result<Self> {
        let store: StoreRef = Arc::new(pool.alloc(size)?);
        Self::from_segment(Segment::new(store, 0, size, true), VbufferConfig::default())
    }

    /// 包装调用方提供的存储，不复制字节；`length` 为 [`ALL`] 时覆盖整个存储。
    pub fn create_from(store: StoreRef, length: usize) -> Result<Self> {
        let available = store.len();
        let length = if length == ALL { available } else { length };
        if length > available {
            return raise(VbufferError::out_of_bounds(0, length, available));
        }
        Self::from_segment(Segment::new(store, 0, length, true), VbufferConfig::default())
    }

    /// 零拷贝包装共享字节。
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let len = bytes.len();
        Self::create_from(Arc::new(SharedStore::new(bytes)), len)
    }

    /// 复制切片生成新的可写链。
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let store: StoreRef = Arc::new(HeapStore::copy_from_slice(data)?);
        Self::from_segment(
            Segment::new(store, 0, data.len(), true),
            VbufferConfig::default(),
        )
    }

    /// 接管 `Vec<u8>` 作为可写存储，不复制字节。
    pub fn from_vec(raw: Vec<u8>) -> Result<Self> {
        let len = raw.len();
        let store: StoreRef = Arc::new(HeapStore::from_vec(raw));
        Self::from_segment(Segment::new(store, 0, len, true), VbufferConfig::default())
    }

    /// 替换链配置，配置非法时返回错误且链保持不变。
    pub fn with_config(mut self, config: VbufferConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &VbufferConfig {
        &self.config
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub(crate) fn from_segment(first: Segment, config: VbufferConfig) -> Result<Self> {
        let mut segments = Arena::new();
        let Some(head) = segments.insert(first) else {
            return raise(VbufferError::ResourceExhausted {
                requested: core::mem::size_of::<Segment>(),
            });
        };
        Ok(Self {
            id: ChainId::next(),
            segments,
            head,
            registry: Arena::new(),
            epoch: 0,
            sealed: false,
            config,
            owner: None,
        })
    }

    fn empty_anchor(writable: bool) -> Result<Segment> {
        let store: StoreRef = Arc::new(HeapStore::zeroed(0)?);
        Ok(Segment::new(store, 0, 0, writable))
    }

    /// 释放链。仍有已注册迭代器时拒绝释放，并把链交还给调用方。
    pub fn free(self) -> core::result::Result<(), FreeError> {
        let live = self.registry.len();
        if live > 0 {
            let error = VbufferError::LiveIterators { count: live };
            record(&error);
            return Err(FreeError {
                error,
                buffer: self,
            });
        }
        drop(self);
        Ok(())
    }

    /// 封存或解封整条链；封存后写入与结构编辑均返回只读错误。
    pub fn setmode(&mut self, readonly: bool) {
        self.sealed = readonly;
        for key in self.segment_keys() {
            self.segments[key].flags.writable = !readonly;
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.sealed
    }

    /// 逻辑长度，O(段数)。
    pub fn size(&self) -> usize {
        self.segment_iter().map(|(_, seg)| seg.length).sum()
    }

    /// 判断逻辑长度是否至少为 `min`，达到即停止遍历。
    pub fn checksize(&self, min: usize) -> bool {
        let mut total = 0usize;
        for (_, seg) in self.segment_iter() {
            total += seg.length;
            if total >= min {
                return true;
            }
        }
        total >= min
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 以 0 覆盖全部字节。
    pub fn zero(&mut self, mark_modified: bool) -> Result<()> {
        self.check_writable("chain")?;
        for key in self.segment_keys() {
            let seg = &mut self.segments[key];
            if seg.length == 0 {
                continue;
            }
            seg.bytes_mut()?.fill(0);
            if mark_modified {
                seg.flags.modified = true;
            }
        }
        Ok(())
    }

    pub fn getbyte(&self, offset: usize) -> Result<u8> {
        let (key, intra) = self.locate_byte(offset)?;
        Ok(self.segments[key].bytes()[intra])
    }

    pub fn setbyte(&mut self, offset: usize, byte: u8) -> Result<()> {
        self.check_writable("chain")?;
        let (key, intra) = self.locate_byte(offset)?;
        let seg = &mut self.segments[key];
        seg.bytes_mut()?[intra] = byte;
        seg.flags.modified = true;
        Ok(())
    }

    pub fn ismodified(&self) -> bool {
        self.segment_iter().any(|(_, seg)| seg.flags.modified)
    }

    pub fn clearmodified(&mut self) {
        for key in self.segment_keys() {
            self.segments[key].flags.modified = false;
        }
    }

    /// 复制整条流为 `Vec<u8>`。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for (_, seg) in self.segment_iter() {
            out.extend_from_slice(seg.bytes());
        }
        out
    }

    /// 在逻辑偏移 `offset` 处插入 `data` 的全部段。
    ///
    /// # 契约说明（What）
    /// - `data` 被消费，其存储引用整体迁入本链，不复制字节；`data` 上仍注册的迭代器被强制解绑；
    /// - 位于 `offset` 之后的迭代器后移 `data.size()`；恰好位于 `offset` 的迭代器，
    ///   `post = true` 者落在插入内容之后，`post = false` 者留在插入内容之前；
    /// - `mark_modified` 为真时插入的段被标记为已修改；
    /// - 段槽位耗尽时返回资源耗尽错误，本链逻辑内容不变，已被消费的 `data` 随之释放。
    pub fn insert(&mut self, offset: usize, mut data: Vbuffer, mark_modified: bool) -> Result<()> {
        self.check_writable("chain")?;
        let size = self.size();
        if offset > size {
            return raise(VbufferError::out_of_bounds(offset, 0, size));
        }
        let inserted = data.size();
        if inserted == 0 {
            return Ok(());
        }
        data.detach_all("insert");

        let (left, right) = self.split_at(offset)?;
        let moved = data.take_segments();
        let mut keys: SmallVec<[SegmentKey; 8]> = SmallVec::with_capacity(moved.len());
        for mut seg in moved {
            seg.flags.writable = true;
            if mark_modified {
                seg.flags.modified = true;
            }
            match self.segments.insert(seg) {
                Some(key) => keys.push(key),
                None => {
                    for key in keys {
                        self.segments.remove(key);
                    }
                    return raise(VbufferError::ResourceExhausted {
                        requested: inserted,
                    });
                }
            }
        }
        let (first, last) = (keys[0], keys[keys.len() - 1]);
        for pair in keys.windows(2) {
            self.segments[pair[0]].next = Some(pair[1]);
        }

        self.segments[last].next = right;
        match left {
            Some(l) => self.segments[l].next = Some(first),
            None => self.head = first,
        }

        let mut at_point: SmallVec<[IterKey; 4]> = SmallVec::new();
        if let Some(l) = left {
            let seg = &self.segments[l];
            at_point.extend(
                seg.iterators
                    .iter()
                    .copied()
                    .filter(|ik| self.registry[*ik].offset == seg.length),
            );
        }
        if let Some(r) = right {
            at_point.extend(
                self.segments[r]
                    .iterators
                    .iter()
                    .copied()
                    .filter(|ik| self.registry[*ik].offset == 0),
            );
        }
        for ik in at_point {
            let target = if self.registry[ik].post {
                match right {
                    Some(r) => (r, 0),
                    None => (last, self.segments[last].length),
                }
            } else {
                match left {
                    Some(l) => (l, self.segments[l].length),
                    None => (first, 0),
                }
            };
            self.move_iterator(ik, target.0, target.1);
        }

        self.prune_empty();
        self.bump_epoch();
        tracing::debug!(chain = %self.id, offset, len = inserted, "vbuffer insert");
        if let Some(limit) = self.config.auto_compact_segments {
            // 插入本身已经完成，整理失败只影响段数。
            if self.segments.len() > limit && self.compact().is_err() {
                tracing::warn!(chain = %self.id, limit, "vbuffer auto compact skipped");
            }
        }
        Ok(())
    }

    /// 擦除 `[offset, offset + len)`，`len` 为 [`ALL`] 时擦除到流末尾，返回实际擦除的字节数。
    ///
    /// 严格位于区间内部的迭代器收拢到 `offset`，并被置为 `post = false`；
    /// 区间之后的迭代器前移 `len`。拼接点被标记为已修改。
    pub fn erase(&mut self, offset: usize, len: usize) -> Result<usize> {
        self.check_writable("chain")?;
        let len = self.resolve_range(offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        let removed = self.unlink_range(offset, len, true)?;
        drop(removed);
        tracing::debug!(chain = %self.id, offset, len, "vbuffer erase");
        Ok(len)
    }

    /// 把 `[offset, offset + length)` 从本链摘出为独立的新链，两者共享存储引用。
    ///
    /// 迭代器规则与 [`Vbuffer::erase`] 一致；`mark_modified` 为真时源链拼接点被标记为已修改。
    pub fn extract(&mut self, offset: usize, length: usize, mark_modified: bool) -> Result<Vbuffer> {
        self.check_writable("chain")?;
        let length = self.resolve_range(offset, length)?;
        if length == 0 {
            return Self::from_segment(Self::empty_anchor(true)?, self.config);
        }
        let removed = self.unlink_range(offset, length, mark_modified)?;
        let extracted = Self::from_segments(removed, self.config)?;
        tracing::debug!(
            chain = %self.id,
            extracted = %extracted.id,
            offset,
            len = length,
            "vbuffer extract"
        );
        Ok(extracted)
    }

    /// 用一组已按序排列、已脱离原链的段组装新链。
    fn from_segments(segments: Vec<Segment>, config: VbufferConfig) -> Result<Self> {
        let mut iter = segments.into_iter();
        let Some(mut first) = iter.next() else {
            return Self::from_segment(Self::empty_anchor(true)?, config);
        };
        first.flags.writable = true;
        let mut chain = Self::from_segment(first, config)?;
        let mut tail = chain.head;
        for mut seg in iter {
            seg.flags.writable = true;
            let Some(key) = chain.segments.insert(seg) else {
                return raise(VbufferError::ResourceExhausted {
                    requested: core::mem::size_of::<Segment>(),
                });
            };
            chain.segments[tail].next = Some(key);
            tail = key;
        }
        Ok(chain)
    }

    /// 摘除 `[offset, offset + len)` 对应的段并返回它们（按序，已清空 `next` 与迭代器集合）。
    ///
    /// 调用方保证 `len > 0` 且区间位于流内。
    fn unlink_range(&mut self, offset: usize, len: usize, mark_splice: bool) -> Result<Vec<Segment>> {
        let anchor = if offset == 0 && len == self.size() {
            Some(Self::empty_anchor(!self.sealed)?)
        } else {
            None
        };
        let (left, _) = self.split_at(offset)?;
        let (_, right) = self.split_at(offset + len)?;

        let mut removed_keys: SmallVec<[SegmentKey; 8]> = SmallVec::new();
        let mut cursor = match left {
            Some(l) => self.segments[l].next,
            None => Some(self.head),
        };
        while let Some(key) = cursor {
            if Some(key) == right {
                break;
            }
            removed_keys.push(key);
            cursor = self.segments[key].next;
        }

        let target = match (left, right, anchor) {
            (_, Some(r), _) => (r, 0),
            (Some(l), None, _) => (l, self.segments[l].length),
            (None, None, Some(anchor)) => match self.segments.insert(anchor) {
                Some(key) => (key, 0),
                None => {
                    return raise(VbufferError::ResourceExhausted {
                        requested: core::mem::size_of::<Segment>(),
                    });
                }
            },
            (None, None, None) => unreachable!("range covering the whole chain prepares an anchor"),
        };

        match left {
            Some(l) => self.segments[l].next = right,
            None => self.head = target.0,
        }

        let mut rel_start = 0usize;
        let mut removed = Vec::with_capacity(removed_keys.len());
        for key in removed_keys {
            let iters: SmallVec<[IterKey; 4]> = self.segments[key].iterators.clone();
            for ik in iters {
                let rel = rel_start + self.registry[ik].offset;
                if rel > 0 && rel < len {
                    self.registry[ik].post = false;
                }
                self.move_iterator(ik, target.0, target.1);
            }
            if let Some(mut seg) = self.segments.remove(key) {
                rel_start += seg.length;
                seg.next = None;
                seg.iterators.clear();
                removed.push(seg);
            }
        }

        if mark_splice {
            self.segments[target.0].flags.modified = true;
        }
        self.prune_empty();
        self.bump_epoch();
        Ok(removed)
    }

    /// 把 `ALL` 展开为到流末尾的长度，并校验区间位于流内。
    pub(crate) fn resolve_range(&self, offset: usize, len: usize) -> Result<usize> {
        let size = self.size();
        if offset > size {
            return raise(VbufferError::out_of_bounds(offset, len, size));
        }
        if len == ALL {
            return Ok(size - offset);
        }
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(len),
            _ => raise(VbufferError::out_of_bounds(offset, len, size)),
        }
    }

    pub(crate) fn check_writable(&self, target: &'static str) -> Result<()> {
        if self.sealed {
            return raise(VbufferError::ReadOnly { target });
        }
        Ok(())
    }

    pub(crate) fn bump_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// 按链序遍历段。
    pub(crate) fn segment_iter(&self) -> SegmentIter<'_> {
        SegmentIter {
            chain: self,
            next: Some(self.head),
        }
    }

    pub(crate) fn segment_keys(&self) -> SmallVec<[SegmentKey; 8]> {
        self.segment_iter().map(|(key, _)| key).collect()
    }

    /// 段首在流中的逻辑偏移。
    pub(crate) fn segment_start(&self, target: SegmentKey) -> usize {
        let mut start = 0;
        for (key, seg) in self.segment_iter() {
            if key == target {
                return start;
            }
            start += seg.length;
        }
        unreachable!("segment {target:?} is not linked into chain {}", self.id)
    }

    /// 定位逻辑偏移：返回首个满足 `offset < 段尾` 的段；`offset == size` 时返回末段尾部。
    pub(crate) fn locate(&self, offset: usize) -> Result<(SegmentKey, usize)> {
        let mut start = 0usize;
        let mut last = (self.head, 0usize);
        for (key, seg) in self.segment_iter() {
            if offset < start + seg.length {
                return Ok((key, offset - start));
            }
            start += seg.length;
            last = (key, seg.length);
        }
        if offset == start {
            Ok(last)
        } else {
            raise(VbufferError::out_of_bounds(offset, 0, start))
        }
    }

    fn locate_byte(&self, offset: usize) -> Result<(SegmentKey, usize)> {
        let size = self.size();
        if offset >= size {
            return raise(VbufferError::out_of_bounds(offset, 1, size));
        }
        self.locate(offset)
    }

    /// 在逻辑偏移处建立段边界，返回 `(左段, 右段)`：左段止于 `offset`，右段始于 `offset`。
    ///
    /// 拆分只改变段结构，不改变逻辑内容与已注册迭代器的逻辑位置；
    /// 发生拆分时 epoch 递增，未注册快照随之失效。
    pub(crate) fn split_at(&mut self, offset: usize) -> Result<(Option<SegmentKey>, Option<SegmentKey>)> {
        let mut prev = None;
        let mut cursor = Some(self.head);
        let mut start = 0usize;
        while let Some(key) = cursor {
            let (length, next) = {
                let seg = &self.segments[key];
                (seg.length, seg.next)
            };
            if offset == start && length > 0 {
                return Ok((prev, Some(key)));
            }
            if offset < start + length {
                let tail = self.split_segment(key, offset - start)?;
                return Ok((Some(key), Some(tail)));
            }
            if offset == start + length && next.is_none() {
                return Ok((Some(key), None));
            }
            start += length;
            prev = Some(key);
            cursor = next;
        }
        let size = self.size();
        raise(VbufferError::out_of_bounds(offset, 0, size))
    }

    /// 在段内偏移 `at` 处拆分，段内偏移大于 `at` 的迭代器迁往新段。
    pub(crate) fn split_segment(&mut self, key: SegmentKey, at: usize) -> Result<SegmentKey> {
        let tail = self.segments[key].tail_at(at);
        let Some(tail_key) = self.segments.insert(tail) else {
            return raise(VbufferError::ResourceExhausted {
                requested: core::mem::size_of::<Segment>(),
            });
        };
        self.segments[key].length = at;
        self.segments[key].next = Some(tail_key);
        // 快照记录的段内偏移可能已越过截短后的段尾。
        self.bump_epoch();
        let movers: SmallVec<[IterKey; 4]> = self.segments[key]
            .iterators
            .iter()
            .copied()
            .filter(|ik| self.registry[*ik].offset > at)
            .collect();
        for ik in movers {
            let offset = self.registry[ik].offset - at;
            self.move_iterator(ik, tail_key, offset);
        }
        Ok(tail_key)
    }

    /// 把已注册迭代器改挂到 `(segment, offset)`。
    pub(crate) fn move_iterator(&mut self, ik: IterKey, segment: SegmentKey, offset: usize) {
        let from = self.registry[ik].segment;
        if from != segment {
            if let Some(seg) = self.segments.get_mut(from) {
                seg.iterators.retain(|k| *k != ik);
            }
            self.segments[segment].iterators.push(ik);
        }
        let slot = &mut self.registry[ik];
        slot.segment = segment;
        slot.offset = offset;
    }

    /// 清理编辑过程中产生的零长度段；链只剩一个段时保留它作为锚点。
    pub(crate) fn prune_empty(&mut self) {
        let mut prev: Option<SegmentKey> = None;
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let (length, next) = {
                let seg = &self.segments[key];
                (seg.length, seg.next)
            };
            let sole = prev.is_none() && next.is_none();
            if length > 0 || sole {
                prev = Some(key);
                cursor = next;
                continue;
            }
            let target = match (next, prev) {
                (Some(n), _) => (n, 0),
                (None, Some(p)) => (p, self.segments[p].length),
                (None, None) => unreachable!("sole segment is kept"),
            };
            let iters: SmallVec<[IterKey; 4]> = self.segments[key].iterators.clone();
            for ik in iters {
                self.move_iterator(ik, target.0, target.1);
            }
            match prev {
                Some(p) => self.segments[p].next = next,
                None => {
                    if let Some(n) = next {
                        self.head = n;
                    }
                }
            }
            self.segments.remove(key);
            cursor = next;
        }
    }

    /// 取出全部段（按链序），本链随后只应被丢弃。
    fn take_segments(&mut self) -> Vec<Segment> {
        let keys = self.segment_keys();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(mut seg) = self.segments.remove(key) {
                seg.next = None;
                seg.iterators.clear();
                out.push(seg);
            }
        }
        out
    }

    /// 强制解绑全部已注册迭代器，返回解绑数量。
    pub(crate) fn detach_all(&mut self, reason: &'static str) -> usize {
        let count = self.registry.len();
        if count == 0 {
            return 0;
        }
        tracing::warn!(chain = %self.id, count, reason, "vbuffer detaching registered iterators");
        self.registry.drain();
        for key in self.segment_keys() {
            self.segments[key].iterators.clear();
        }
        count
    }
}

impl Drop for Vbuffer {
    fn drop(&mut self) {
        let live = self.registry.len();
        if live > 0 {
            tracing::error!(chain = %self.id, live, "vbuffer dropped with registered iterators");
            self.detach_all("drop");
        }
        if let Some(binding) = self.owner.take() {
            binding.release();
        }
    }
}

impl fmt::Debug for Vbuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vbuffer")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("segments", &self.segments.len())
            .field("live_iterators", &self.registry.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}

/// 按链序遍历段的迭代器。
pub(crate) struct SegmentIter<'a> {
    chain: &'a Vbuffer,
    next: Option<SegmentKey>,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = (SegmentKey, &'a Segment);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        let seg = &self.chain.segments[key];
        self.next = seg.next;
        Some((key, seg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn chain_of(parts: &[&[u8]]) -> Vbuffer {
        let mut chain = Vbuffer::from_slice(parts[0]).expect("构造首段");
        for part in &parts[1..] {
            let size = chain.size();
            chain
                .insert(size, Vbuffer::from_slice(part).expect("构造段"), false)
                .expect("追加段");
        }
        chain
    }

    #[test]
    fn insert_splits_segment_and_preserves_bytes() {
        let mut chain = Vbuffer::from_slice(b"hello world").expect("构造链");
        chain
            .insert(5, Vbuffer::from_slice(b",").expect("补丁"), true)
            .expect("插入补丁");
        assert_eq!(chain.to_vec(), b"hello, world");
        assert_eq!(chain.segment_count(), 3);
        assert!(chain.ismodified());
    }

    #[test]
    fn erase_whole_chain_leaves_empty_anchor() {
        let mut chain = chain_of(&[b"ab", b"cd"]);
        assert_eq!(chain.erase(0, ALL).expect("擦除全部"), 4);
        assert_eq!(chain.size(), 0);
        assert_eq!(chain.segment_count(), 1);
        chain
            .insert(0, Vbuffer::from_slice(b"xy").expect("补丁"), false)
            .expect("空链上插入");
        assert_eq!(chain.to_vec(), b"xy");
        assert_eq!(chain.segment_count(), 1, "锚点段应被清理");
    }

    #[test]
    fn extract_shares_store_and_keeps_source_consistent() {
        let mut chain = Vbuffer::from_bytes(Bytes::from_static(b"0123456789")).expect("构造链");
        let mut middle = chain.extract(3, 4, true).expect("提取");
        assert_eq!(middle.to_vec(), b"3456");
        assert_eq!(chain.to_vec(), b"012789");
        assert!(chain.ismodified());
        middle.setbyte(0, b'X').expect("写时复制");
        assert_eq!(middle.to_vec(), b"X456");
        assert_eq!(chain.to_vec(), b"012789");
    }

    #[test]
    fn out_of_range_edits_are_rejected_without_side_effects() {
        let mut chain = chain_of(&[b"abc", b"def"]);
        let before = chain.segment_count();
        assert!(chain.erase(4, 5).is_err());
        assert!(chain.extract(7, 1, false).is_err());
        assert!(
            chain
                .insert(9, Vbuffer::from_slice(b"z").expect("补丁"), false)
                .is_err()
        );
        assert_eq!(chain.to_vec(), b"abcdef");
        assert_eq!(chain.segment_count(), before);
    }

    #[test]
    fn sealed_chain_rejects_edits() {
        let mut chain = Vbuffer::from_slice(b"abc").expect("构造链");
        chain.setmode(true);
        assert!(chain.setbyte(0, 1).is_err());
        assert!(chain.erase(0, 1).is_err());
        assert!(chain.zero(true).is_err());
        chain.setmode(false);
        chain.zero(true).expect("解封后可写");
        assert_eq!(chain.to_vec(), [0, 0, 0]);
    }

    #[test]
    fn split_invalidates_snapshots_past_the_cut() {
        let mut chain = Vbuffer::from_slice(b"abcdef").expect("构造链");
        let mut it = chain.iterator_at(4, false, false).expect("定位");
        chain.split_at(2).expect("拆分");
        assert_eq!(chain.to_vec(), b"abcdef");
        assert!(matches!(
            chain.iterator_position(&it),
            Err(VbufferError::StaleIterator { .. })
        ));
        let mut byte = [0u8; 1];
        assert!(matches!(
            chain.iterator_read(&mut it, &mut byte, true),
            Err(VbufferError::StaleIterator { .. })
        ));
        assert!(matches!(
            chain.iterator_advance(&mut it, 1),
            Err(VbufferError::StaleIterator { .. })
        ));
    }

    #[test]
    fn split_keeps_registered_positions() {
        let mut chain = Vbuffer::from_slice(b"abcdef").expect("构造链");
        let mut it = chain.iterator_at(4, false, false).expect("定位");
        chain.iterator_register(&mut it).expect("注册");
        chain.split_at(2).expect("拆分");
        assert_eq!(chain.segment_count(), 2);
        assert_eq!(chain.iterator_position(&it).expect("位置"), 4);
        let mut byte = [0u8; 1];
        chain.iterator_read(&mut it, &mut byte, false).expect("读取");
        assert_eq!(byte[0], b'e');
        chain.iterator_unregister(&mut it).expect("注销");
    }

    #[test]
    fn checksize_stops_early() {
        let chain = chain_of(&[b"abc", b"def", b"ghi"]);
        assert!(chain.checksize(4));
        assert!(chain.checksize(9));
        assert!(!chain.checksize(10));
    }

    #[test]
    #[traced_test]
    fn dropping_chain_with_live_iterators_logs_error() {
        let mut chain = Vbuffer::from_slice(b"abc").expect("构造链");
        let mut it = chain.iterator(false, false);
        chain.iterator_register(&mut it).expect("注册迭代器");
        drop(chain);
        assert!(logs_contain("vbuffer dropped with registered iterators"));
    }
}
