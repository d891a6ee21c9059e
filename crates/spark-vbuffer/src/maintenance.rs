//! 段结构维护：合并为连续段（flatten）与合并碎片段（compact）。
//!
//! # 设计概要（How）
//! - 两类操作都只改变段结构，不改变逻辑内容；迭代器按“新段起点 + 原段内偏移”重新挂接，
//!   逻辑位置保持不变；
//! - `compact` 先做零拷贝合并：相邻段若共享同一存储且窗口首尾相接，只需延长前段窗口；
//!   随后把连续的短段复制进一个新堆块，合并后的大小受 `compact_max_merged` 约束。

use std::sync::Arc;

use smallvec::SmallVec;

use crate::chain::Vbuffer;
use crate::error::{Result, VbufferError, raise};
use crate::segment::{IterKey, Segment, SegmentKey};
use crate::store::{HeapStore, StoreRef};
use crate::ALL;

impl Vbuffer {
    /// 把整条链合并为一个连续段。封存的链同样允许合并，合并后的段保持只读。
    pub fn flatten(&mut self) -> Result<()> {
        self.flatten_range(0, ALL)
    }

    /// 只合并 `[offset, offset + len)` 覆盖的段，使该范围连续。
    pub fn flatten_range(&mut self, offset: usize, len: usize) -> Result<()> {
        let len = self.resolve_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let (key, intra) = self.locate(offset)?;
        if intra + len <= self.segments[key].length {
            return Ok(());
        }
        let (left, _) = self.split_at(offset)?;
        let (_, right) = self.split_at(offset + len)?;
        let mut run: SmallVec<[SegmentKey; 8]> = SmallVec::new();
        let mut cursor = match left {
            Some(l) => self.segments[l].next,
            None => Some(self.head),
        };
        while let Some(key) = cursor {
            if Some(key) == right {
                break;
            }
            run.push(key);
            cursor = self.segments[key].next;
        }
        self.merge_run(left, &run)?;
        self.bump_epoch();
        tracing::debug!(chain = %self.id, offset, len, segments = run.len(), "vbuffer flatten");
        Ok(())
    }

    /// 链是否只有一个段。
    pub fn isflat(&self) -> bool {
        self.segments.len() == 1
    }

    /// 合并碎片段，返回减少的段数。
    pub fn compact(&mut self) -> Result<usize> {
        let before = self.segments.len();

        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let Some(next) = self.segments[key].next else {
                break;
            };
            if self.segments[key].is_contiguous_with(&self.segments[next]) {
                self.absorb(key, next);
            } else {
                cursor = Some(next);
            }
        }

        let threshold = self.config.compact_threshold;
        let max_merged = self.config.compact_max_merged;
        let mut prev: Option<SegmentKey> = None;
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let mut run: SmallVec<[SegmentKey; 8]> = SmallVec::new();
            let mut total = 0usize;
            let mut probe = Some(key);
            while let Some(candidate) = probe {
                let length = self.segments[candidate].length;
                if length >= threshold || total + length > max_merged {
                    break;
                }
                run.push(candidate);
                total += length;
                probe = self.segments[candidate].next;
            }
            let current = if run.len() >= 2 {
                self.merge_run(prev, &run)?
            } else {
                key
            };
            prev = Some(current);
            cursor = self.segments[current].next;
        }

        let eliminated = before - self.segments.len();
        if eliminated > 0 {
            self.bump_epoch();
            tracing::debug!(chain = %self.id, eliminated, "vbuffer compact");
        }
        Ok(eliminated)
    }

    /// 零拷贝吞并紧邻的后继段。
    fn absorb(&mut self, key: SegmentKey, next: SegmentKey) {
        let base = self.segments[key].length;
        let movers: SmallVec<[IterKey; 4]> = self.segments[next].iterators.clone();
        for ik in movers {
            let offset = base + self.registry[ik].offset;
            self.move_iterator(ik, key, offset);
        }
        if let Some(victim) = self.segments.remove(next) {
            let seg = &mut self.segments[key];
            seg.length += victim.length;
            seg.flags.modified |= victim.flags.modified;
            seg.next = victim.next;
        }
    }

    /// 把一段连续的段复制进一个新堆块，返回新段的键。`prev` 是首段的前驱。
    fn merge_run(&mut self, prev: Option<SegmentKey>, run: &[SegmentKey]) -> Result<SegmentKey> {
        let total: usize = run.iter().map(|key| self.segments[*key].length).sum();
        let mut raw = Vec::new();
        if raw.try_reserve_exact(total).is_err() {
            return raise(VbufferError::ResourceExhausted { requested: total });
        }
        let mut modified = false;
        for key in run {
            let seg = &self.segments[*key];
            raw.extend_from_slice(seg.bytes());
            modified |= seg.flags.modified;
        }
        let store: StoreRef = Arc::new(HeapStore::from_vec(raw));
        let mut merged = Segment::new(store, 0, total, !self.sealed);
        merged.flags.modified = modified;
        merged.next = run.last().and_then(|key| self.segments[*key].next);
        let Some(merged_key) = self.segments.insert(merged) else {
            return raise(VbufferError::ResourceExhausted {
                requested: core::mem::size_of::<Segment>(),
            });
        };
        match prev {
            Some(p) => self.segments[p].next = Some(merged_key),
            None => self.head = merged_key,
        }
        let mut base = 0usize;
        for key in run {
            let movers: SmallVec<[IterKey; 4]> = self.segments[*key].iterators.clone();
            for ik in movers {
                let offset = base + self.registry[ik].offset;
                self.move_iterator(ik, merged_key, offset);
            }
            if let Some(seg) = self.segments.remove(*key) {
                base += seg.length;
            }
        }
        Ok(merged_key)
    }
}
