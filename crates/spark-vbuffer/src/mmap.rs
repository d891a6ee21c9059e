//! 逐段直接访问：不复制字节，按连续片段遍历流。
//!
//! 扫描器与校验和计算只需要依次看到每一段连续内存，不需要整条流连续。
//! [`MmapCursor`] 记录下一段片段的起点与剩余窗口长度，调用方循环调用
//! [`Vbuffer::mmap_next`] 直到返回 `None`。需要一整块连续内存时改用
//! [`Vbuffer::flatten`](crate::Vbuffer::flatten)。

use crate::chain::{ChainId, Vbuffer};
use crate::error::{Result, VbufferError, raise};
use crate::iterator::VbufferIterator;
use crate::segment::SegmentKey;

/// 片段游标。
///
/// 游标记录创建时链的 epoch，链发生结构编辑后继续使用返回 `StaleIterator`。
#[derive(Clone, Debug)]
pub struct MmapCursor {
    chain: ChainId,
    epoch: u64,
    next: Option<(SegmentKey, usize)>,
    limit: Option<usize>,
    readonly: bool,
}

impl MmapCursor {
    /// 窗口内尚未交付的字节数；不限长的游标返回 `None`。
    pub fn remaining(&self) -> Option<usize> {
        self.limit
    }

    /// 游标是否已交付全部片段。
    pub fn is_exhausted(&self) -> bool {
        self.next.is_none() || self.limit == Some(0)
    }
}

impl Vbuffer {
    /// 从句柄位置开始遍历到流尾。
    pub fn mmap(&self, it: &VbufferIterator) -> Result<MmapCursor> {
        self.mmap_window(it, None)
    }

    pub(crate) fn mmap_window(&self, it: &VbufferIterator, limit: Option<usize>) -> Result<MmapCursor> {
        let cursor = self.resolve(it)?;
        Ok(MmapCursor {
            chain: self.id,
            epoch: self.epoch,
            next: Some((cursor.segment, cursor.offset)),
            limit,
            readonly: cursor.readonly,
        })
    }

    /// 计算下一段片段 `(段, 段内起点, 长度)` 并推进游标。
    fn advance_cursor(&self, cursor: &mut MmapCursor) -> Result<Option<(SegmentKey, usize, usize)>> {
        if cursor.chain != self.id {
            return raise(VbufferError::ForeignIterator {
                expected: self.id.get(),
                found: cursor.chain.get(),
            });
        }
        if cursor.epoch != self.epoch {
            return raise(VbufferError::StaleIterator {
                recorded: cursor.epoch,
                current: self.epoch,
            });
        }
        if cursor.limit == Some(0) {
            cursor.next = None;
            return Ok(None);
        }
        let mut position = cursor.next;
        while let Some((key, offset)) = position {
            let seg = &self.segments[key];
            if offset < seg.length {
                let mut len = seg.length - offset;
                if let Some(limit) = cursor.limit.as_mut() {
                    len = len.min(*limit);
                    *limit -= len;
                }
                cursor.next = Some((key, offset + len));
                return Ok(Some((key, offset, len)));
            }
            position = seg.next.map(|next| (next, 0));
        }
        cursor.next = None;
        Ok(None)
    }

    /// 交付下一段只读片段，遍历结束返回 `None`。
    pub fn mmap_next<'a>(&'a self, cursor: &mut MmapCursor) -> Result<Option<&'a [u8]>> {
        Ok(self
            .advance_cursor(cursor)?
            .map(|(key, offset, len)| &self.segments[key].bytes()[offset..offset + len]))
    }

    /// 交付下一段可写片段；共享存储先做写时复制，片段所在段被标记为已修改。
    pub fn mmap_next_mut<'a>(&'a mut self, cursor: &mut MmapCursor) -> Result<Option<&'a mut [u8]>> {
        if cursor.readonly {
            return raise(VbufferError::ReadOnly { target: "iterator" });
        }
        self.check_writable("chain")?;
        let probe = cursor.clone();
        let Some((key, offset, len)) = self.advance_cursor(cursor)? else {
            return Ok(None);
        };
        let seg = &mut self.segments[key];
        if !seg.flags.writable {
            *cursor = probe;
            return raise(VbufferError::ReadOnly { target: "segment" });
        }
        // 先完成写时复制，失败时游标回退到本次调用之前。
        if let Err(err) = seg.bytes_mut().map(|_| ()) {
            *cursor = probe;
            return Err(err);
        }
        seg.flags.modified = true;
        let bytes = seg.bytes_mut()?;
        Ok(Some(&mut bytes[offset..offset + len]))
    }

    /// 以迭代器形式遍历只读片段。
    pub fn chunks(&self, it: &VbufferIterator) -> Result<Chunks<'_>> {
        Ok(Chunks {
            buf: self,
            cursor: self.mmap(it)?,
        })
    }
}

/// [`Vbuffer::chunks`] 返回的片段迭代器。
pub struct Chunks<'a> {
    buf: &'a Vbuffer,
    cursor: MmapCursor,
}

impl<'a> Chunks<'a> {
    pub(crate) fn bounded(buf: &'a Vbuffer, cursor: MmapCursor) -> Self {
        Self { buf, cursor }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        // 游标由本迭代器独占创建，链又被共享借用，epoch 不会变化。
        let run = self.buf.mmap_next(&mut self.cursor);
        debug_assert!(run.is_ok(), "chunk cursor invalidated under a shared borrow");
        run.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_follow_segment_boundaries() {
        let mut chain = Vbuffer::from_slice(b"abc").expect("构造链");
        chain
            .insert(3, Vbuffer::from_slice(b"defg").expect("补丁"), false)
            .expect("追加段");
        let it = chain.iterator_at(1, false, true).expect("定位");
        let runs: Vec<&[u8]> = chain.chunks(&it).expect("遍历").collect();
        assert_eq!(runs, vec![&b"bc"[..], &b"defg"[..]]);
    }

    #[test]
    fn window_chunks_stop_at_window_end() {
        let mut chain = Vbuffer::from_slice(b"abc").expect("构造链");
        chain
            .insert(3, Vbuffer::from_slice(b"defg").expect("补丁"), false)
            .expect("追加段");
        let view = chain.sub(2, 3).expect("视图");
        let mut chunks = view.chunks(&chain).expect("遍历");
        assert_eq!(chunks.next(), Some(&b"c"[..]));
        assert_eq!(chunks.next(), Some(&b"de"[..]));
        assert_eq!(chunks.next(), None);
        assert_eq!(chunks.next(), None, "耗尽后保持结束状态");
    }

    #[test]
    fn mutable_runs_copy_shared_storage() {
        let original = bytes::Bytes::from_static(b"shared");
        let mut chain = Vbuffer::from_bytes(original.clone()).expect("构造链");
        let it = chain.iterator(false, false);
        let mut cursor = chain.mmap(&it).expect("游标");
        let run = chain.mmap_next_mut(&mut cursor).expect("可写片段").expect("存在片段");
        run.make_ascii_uppercase();
        assert_eq!(chain.to_vec(), b"SHARED");
        assert_eq!(&original[..], b"shared");
        assert!(chain.ismodified());
    }

    #[test]
    fn cursor_rejects_use_after_edit() {
        let mut chain = Vbuffer::from_slice(b"abcdef").expect("构造链");
        let it = chain.iterator(false, false);
        let mut cursor = chain.mmap(&it).expect("游标");
        chain.erase(0, 1).expect("擦除");
        assert!(matches!(
            chain.mmap_next(&mut cursor),
            Err(VbufferError::StaleIterator { .. })
        ));
    }
}
