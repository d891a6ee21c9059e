//! 迭代器：链内游标的句柄、注册表操作与基于游标的读写编辑。
//!
//! # 设计背景（Why）
//! - 解析器在报文改写期间持有多个游标，编辑发生在游标之前、之上或之后时，
//!   游标必须继续指向“同一个逻辑字节”；
//! - 句柄若直接借用链，编辑期间便无法同时持有游标，因此句柄只保存键，位置由链的注册表权威维护。
//!
//! # 设计概要（How）
//! - 未注册句柄是一个快照：`(段键, 段内偏移, epoch)`，链的 epoch 变化后使用即报 `StaleIterator`；
//! - 注册后句柄只保存注册表键，结构编辑改写注册表槽位，句柄本身无需更新；
//! - `iterator_clear` 或链在销毁时强制解绑后，句柄进入 `Detached` 状态，之后的使用返回 `DetachedIterator`。
//!
//! # 契约说明（What）
//! - 句柄不可 `Clone`，复制位置请使用 [`Vbuffer::iterator_copy`]，副本永远不继承注册状态；
//! - 句柄记录所属链的 [`ChainId`]，交给其它链使用返回 `ForeignIterator`；
//! - 只读句柄拒绝写入、插入与擦除。

use smallvec::SmallVec;

use crate::chain::{ChainId, IterSlot, Vbuffer};
use crate::error::{Result, VbufferError, raise};
use crate::segment::{IterKey, SegmentKey};
use crate::subbuffer::Subbuffer;

/// 链内游标句柄。
#[derive(Debug)]
pub struct VbufferIterator {
    pub(crate) chain: ChainId,
    pub(crate) state: IterState,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum IterState {
    Snapshot {
        segment: SegmentKey,
        offset: usize,
        epoch: u64,
        post: bool,
        readonly: bool,
    },
    Live(IterKey),
    Detached,
}

/// 解析后的游标位置。
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor {
    pub(crate) segment: SegmentKey,
    pub(crate) offset: usize,
    pub(crate) post: bool,
    pub(crate) readonly: bool,
}

impl VbufferIterator {
    /// 句柄所属的链。
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// 句柄当前是否处于注册状态。
    pub fn is_registered(&self) -> bool {
        matches!(self.state, IterState::Live(_))
    }

    /// 句柄是否已被强制解绑。
    pub fn is_detached(&self) -> bool {
        matches!(self.state, IterState::Detached)
    }
}

impl Vbuffer {
    /// 在流首创建未注册句柄。
    pub fn iterator(&self, post: bool, readonly: bool) -> VbufferIterator {
        self.snapshot(Cursor {
            segment: self.head,
            offset: 0,
            post,
            readonly,
        })
    }

    /// 在逻辑偏移处创建未注册句柄，`offset` 可以等于流长度（流尾）。
    pub fn iterator_at(&self, offset: usize, post: bool, readonly: bool) -> Result<VbufferIterator> {
        let (segment, intra) = self.locate(offset)?;
        Ok(self.snapshot(Cursor {
            segment,
            offset: intra,
            post,
            readonly,
        }))
    }

    pub(crate) fn snapshot(&self, cursor: Cursor) -> VbufferIterator {
        VbufferIterator {
            chain: self.id,
            state: IterState::Snapshot {
                segment: cursor.segment,
                offset: cursor.offset,
                epoch: self.epoch,
                post: cursor.post,
                readonly: cursor.readonly,
            },
        }
    }

    /// 校验句柄归属与有效性，返回当前位置。
    pub(crate) fn resolve(&self, it: &VbufferIterator) -> Result<Cursor> {
        if it.chain != self.id {
            return raise(VbufferError::ForeignIterator {
                expected: self.id.get(),
                found: it.chain.get(),
            });
        }
        match it.state {
            IterState::Snapshot {
                segment,
                offset,
                epoch,
                post,
                readonly,
            } => {
                if epoch != self.epoch || !self.segments.contains(segment) {
                    return raise(VbufferError::StaleIterator {
                        recorded: epoch,
                        current: self.epoch,
                    });
                }
                Ok(Cursor {
                    segment,
                    offset,
                    post,
                    readonly,
                })
            }
            IterState::Live(key) => match self.registry.get(key) {
                Some(slot) => Ok(Cursor {
                    segment: slot.segment,
                    offset: slot.offset,
                    post: slot.post,
                    readonly: slot.readonly,
                }),
                None => raise(VbufferError::DetachedIterator),
            },
            IterState::Detached => raise(VbufferError::DetachedIterator),
        }
    }

    /// 注册句柄，使其参与结构编辑时的位置修正。重复注册是空操作。
    pub fn iterator_register(&mut self, it: &mut VbufferIterator) -> Result<()> {
        let cursor = self.resolve(it)?;
        if it.is_registered() {
            return Ok(());
        }
        let slot = IterSlot {
            segment: cursor.segment,
            offset: cursor.offset,
            post: cursor.post,
            readonly: cursor.readonly,
        };
        let Some(key) = self.registry.insert(slot) else {
            return raise(VbufferError::ResourceExhausted {
                requested: core::mem::size_of::<IterSlot>(),
            });
        };
        self.segments[cursor.segment].iterators.push(key);
        it.state = IterState::Live(key);
        Ok(())
    }

    /// 注销句柄：从注册表移除，句柄退化为当前位置的快照。
    pub fn iterator_unregister(&mut self, it: &mut VbufferIterator) -> Result<()> {
        let cursor = self.resolve(it)?;
        if let IterState::Live(key) = it.state {
            self.forget(key);
            *it = self.snapshot(cursor);
        }
        Ok(())
    }

    /// 强制解绑句柄，之后任何使用都返回 `DetachedIterator`。
    ///
    /// 句柄属于其它链时只改变句柄自身状态，不触碰本链。
    pub fn iterator_clear(&mut self, it: &mut VbufferIterator) {
        if it.chain == self.id {
            if let IterState::Live(key) = it.state {
                self.forget(key);
            }
        }
        it.state = IterState::Detached;
    }

    fn forget(&mut self, key: IterKey) {
        if let Some(slot) = self.registry.remove(key) {
            if let Some(seg) = self.segments.get_mut(slot.segment) {
                seg.iterators.retain(|k| *k != key);
            }
        }
    }

    /// 复制句柄位置，副本是未注册快照。
    pub fn iterator_copy(&self, it: &VbufferIterator) -> Result<VbufferIterator> {
        Ok(self.snapshot(self.resolve(it)?))
    }

    /// 句柄的逻辑偏移。
    pub fn iterator_position(&self, it: &VbufferIterator) -> Result<usize> {
        let cursor = self.resolve(it)?;
        Ok(self.segment_start(cursor.segment) + cursor.offset)
    }

    pub fn iterator_is_post(&self, it: &VbufferIterator) -> Result<bool> {
        Ok(self.resolve(it)?.post)
    }

    pub fn iterator_is_readonly(&self, it: &VbufferIterator) -> Result<bool> {
        Ok(self.resolve(it)?.readonly)
    }

    /// 已注册句柄数量。
    pub fn live_iterators(&self) -> usize {
        self.registry.len()
    }

    /// 前移 `len` 个逻辑字节，返回实际前移量；到达流尾时提前停止，不视为错误。
    pub fn iterator_advance(&mut self, it: &mut VbufferIterator, len: usize) -> Result<usize> {
        let cursor = self.resolve(it)?;
        let (segment, offset, advanced) = self.walk(cursor.segment, cursor.offset, len);
        self.set_cursor(it, segment, offset);
        Ok(advanced)
    }

    /// 从句柄位置读取至多 `dst.len()` 字节，返回实际读取量。
    pub fn iterator_read(
        &mut self,
        it: &mut VbufferIterator,
        dst: &mut [u8],
        advance: bool,
    ) -> Result<usize> {
        let cursor = self.resolve(it)?;
        let copied = self.copy_out(cursor.segment, cursor.offset, dst);
        if advance {
            let (segment, offset, _) = self.walk(cursor.segment, cursor.offset, copied);
            self.set_cursor(it, segment, offset);
        }
        Ok(copied)
    }

    /// 从句柄位置覆盖写入 `src`；写入不扩展流，超出流尾返回越界错误。
    pub fn iterator_write(
        &mut self,
        it: &mut VbufferIterator,
        src: &[u8],
        advance: bool,
    ) -> Result<usize> {
        let cursor = self.writable_cursor(it)?;
        let position = self.segment_start(cursor.segment) + cursor.offset;
        let size = self.size();
        if src.len() > size - position {
            return raise(VbufferError::out_of_bounds(position, src.len(), size));
        }
        self.copy_in(cursor.segment, cursor.offset, src)?;
        if advance {
            let (segment, offset, _) = self.walk(cursor.segment, cursor.offset, src.len());
            self.set_cursor(it, segment, offset);
        }
        Ok(src.len())
    }

    /// 在句柄位置插入 `data`，插入内容被标记为已修改。
    ///
    /// 句柄自身按 `post` 标志落位：`post = true` 落在插入内容之后，否则留在之前。
    pub fn iterator_insert(&mut self, it: &mut VbufferIterator, data: Vbuffer) -> Result<()> {
        let cursor = self.writable_cursor(it)?;
        let position = self.segment_start(cursor.segment) + cursor.offset;
        let inserted = data.size();
        self.insert(position, data, true)?;
        if !it.is_registered() {
            let target = if cursor.post {
                position + inserted
            } else {
                position
            };
            self.reposition(it, target)?;
        }
        Ok(())
    }

    /// 从句柄位置擦除 `len` 字节（[`ALL`](crate::ALL) 表示到流尾），返回实际擦除量。
    pub fn iterator_erase(&mut self, it: &mut VbufferIterator, len: usize) -> Result<usize> {
        let cursor = self.writable_cursor(it)?;
        let position = self.segment_start(cursor.segment) + cursor.offset;
        let erased = self.erase(position, len)?;
        if !it.is_registered() {
            self.reposition(it, position)?;
        }
        Ok(erased)
    }

    /// 以句柄位置为起点划定长度为 `len` 的子视图；`advance` 为真时句柄越过该窗口。
    pub fn iterator_sub(
        &mut self,
        it: &mut VbufferIterator,
        len: usize,
        advance: bool,
    ) -> Result<Subbuffer> {
        let cursor = self.resolve(it)?;
        let position = self.segment_start(cursor.segment) + cursor.offset;
        let span = self.resolve_range(position, len)?;
        let sub = Subbuffer::new(self.snapshot(cursor), len);
        if advance {
            let (segment, offset, _) = self.walk(cursor.segment, cursor.offset, span);
            self.set_cursor(it, segment, offset);
        }
        Ok(sub)
    }

    fn writable_cursor(&self, it: &VbufferIterator) -> Result<Cursor> {
        let cursor = self.resolve(it)?;
        if cursor.readonly {
            return raise(VbufferError::ReadOnly { target: "iterator" });
        }
        self.check_writable("chain")?;
        Ok(cursor)
    }

    /// 把句柄重新定位到逻辑偏移，快照会刷新为当前 epoch。
    pub(crate) fn reposition(&mut self, it: &mut VbufferIterator, position: usize) -> Result<()> {
        let (segment, offset) = self.locate(position)?;
        match it.state {
            IterState::Live(key) => self.move_iterator(key, segment, offset),
            IterState::Snapshot { post, readonly, .. } => {
                *it = self.snapshot(Cursor {
                    segment,
                    offset,
                    post,
                    readonly,
                });
            }
            IterState::Detached => return raise(VbufferError::DetachedIterator),
        }
        Ok(())
    }

    fn set_cursor(&mut self, it: &mut VbufferIterator, segment: SegmentKey, offset: usize) {
        match &mut it.state {
            IterState::Live(key) => {
                let key = *key;
                self.move_iterator(key, segment, offset);
            }
            IterState::Snapshot {
                segment: seg,
                offset: off,
                ..
            } => {
                *seg = segment;
                *off = offset;
            }
            IterState::Detached => {}
        }
    }

    /// 从 `(segment, offset)` 前移至多 `len` 字节，返回新位置与实际前移量。
    ///
    /// 前移量恰好用尽在段尾时停在该段尾部，而不是下一段首。
    pub(crate) fn walk(
        &self,
        segment: SegmentKey,
        offset: usize,
        len: usize,
    ) -> (SegmentKey, usize, usize) {
        let (mut seg, mut off) = (segment, offset);
        let mut remaining = len;
        let mut advanced = 0usize;
        loop {
            let node = &self.segments[seg];
            let available = node.length - off;
            if remaining <= available {
                off += remaining;
                advanced += remaining;
                break;
            }
            advanced += available;
            remaining -= available;
            match node.next {
                Some(next) => {
                    seg = next;
                    off = 0;
                }
                None => {
                    off = node.length;
                    break;
                }
            }
        }
        (seg, off, advanced)
    }

    /// 从 `(segment, offset)` 复制至多 `dst.len()` 字节，返回复制量。
    pub(crate) fn copy_out(&self, segment: SegmentKey, offset: usize, dst: &mut [u8]) -> usize {
        let mut copied = 0usize;
        let mut cursor = Some((segment, offset));
        while let Some((key, off)) = cursor {
            if copied == dst.len() {
                break;
            }
            let node = &self.segments[key];
            let run = &node.bytes()[off..];
            let take = run.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&run[..take]);
            copied += take;
            cursor = node.next.map(|next| (next, 0));
        }
        copied
    }

    /// 从 `(segment, offset)` 覆盖写入 `src`，调用方保证范围位于流内。
    ///
    /// 先确认覆盖到的段全部可写，再逐段写入；写入段被标记为已修改。
    pub(crate) fn copy_in(&mut self, segment: SegmentKey, offset: usize, src: &[u8]) -> Result<()> {
        let mut touched: SmallVec<[(SegmentKey, usize, usize); 4]> = SmallVec::new();
        let mut pending = src.len();
        let mut cursor = Some((segment, offset));
        while let Some((key, off)) = cursor {
            if pending == 0 {
                break;
            }
            let node = &self.segments[key];
            let take = (node.length - off).min(pending);
            if take > 0 {
                if !node.flags.writable {
                    return raise(VbufferError::ReadOnly { target: "segment" });
                }
                touched.push((key, off, take));
                pending -= take;
            }
            cursor = node.next.map(|next| (next, 0));
        }
        if pending > 0 {
            let position = self.segment_start(segment) + offset;
            return raise(VbufferError::out_of_bounds(position, src.len(), self.size()));
        }
        let mut written = 0usize;
        for (key, off, take) in touched {
            let node = &mut self.segments[key];
            node.bytes_mut()?[off..off + take].copy_from_slice(&src[written..written + take]);
            node.flags.modified = true;
            written += take;
        }
        Ok(())
    }
}
