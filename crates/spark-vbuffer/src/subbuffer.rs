//! 子视图：以起点句柄加长度划定的窗口，不拥有任何段。

use crate::chain::Vbuffer;
use crate::error::{Result, VbufferError, raise};
use crate::iterator::VbufferIterator;
use crate::mmap::{Chunks, MmapCursor};
use crate::ALL;

/// `Subbuffer` 把字段访问限定在 `[start, start + length)` 内。
///
/// # 契约说明（What）
/// - `length` 为 [`ALL`] 时窗口延伸到流尾，长度随链动态变化；
/// - 起点默认是未注册快照，链发生结构编辑后需重新划定；
///   需要跨编辑存活时调用 [`Subbuffer::register`]，并在结束前调用 [`Subbuffer::unregister`]；
/// - 所有方法都显式接收所属链，交给其它链会返回 `ForeignIterator`。
#[derive(Debug)]
pub struct Subbuffer {
    pub(crate) start: VbufferIterator,
    pub(crate) length: usize,
}

impl Vbuffer {
    /// 划定 `[offset, offset + length)` 的子视图。
    pub fn sub(&self, offset: usize, length: usize) -> Result<Subbuffer> {
        self.resolve_range(offset, length)?;
        Ok(Subbuffer::new(self.iterator_at(offset, false, false)?, length))
    }
}

impl Subbuffer {
    pub(crate) fn new(start: VbufferIterator, length: usize) -> Self {
        Self { start, length }
    }

    pub fn start(&self) -> &VbufferIterator {
        &self.start
    }

    /// 起点的逻辑偏移。
    pub fn position(&self, buf: &Vbuffer) -> Result<usize> {
        buf.iterator_position(&self.start)
    }

    /// 窗口长度；链在窗口之后被截短时按实际可见长度返回。
    pub fn size(&self, buf: &Vbuffer) -> Result<usize> {
        let position = self.position(buf)?;
        let visible = buf.size().saturating_sub(position);
        Ok(if self.length == ALL {
            visible
        } else {
            self.length.min(visible)
        })
    }

    /// 在本窗口内再划定 `[offset, offset + length)`。
    pub fn sub(&self, buf: &Vbuffer, offset: usize, length: usize) -> Result<Subbuffer> {
        let size = self.size(buf)?;
        if offset > size {
            return raise(VbufferError::out_of_bounds(offset, length, size));
        }
        let span = match length {
            ALL if self.length == ALL => ALL,
            ALL => size - offset,
            _ => match offset.checked_add(length) {
                Some(end) if end <= size => length,
                _ => return raise(VbufferError::out_of_bounds(offset, length, size)),
            },
        };
        let position = self.position(buf)?;
        let readonly = buf.iterator_is_readonly(&self.start)?;
        let start = buf.iterator_at(position + offset, false, readonly)?;
        Ok(Subbuffer::new(start, span))
    }

    /// 窗口是否落在单个段内。
    pub fn is_flat(&self, buf: &Vbuffer) -> Result<bool> {
        let size = self.size(buf)?;
        let cursor = buf.resolve(&self.start)?;
        let seg = &buf.segments[cursor.segment];
        if cursor.offset + size <= seg.length {
            return Ok(true);
        }
        // 起点位于段尾时，窗口可能整体落在下一段。
        Ok(cursor.offset == seg.length
            && seg
                .next
                .is_some_and(|next| size <= buf.segments[next].length))
    }

    /// 把窗口合并为一个连续段，起点随之刷新。
    pub fn flatten(&mut self, buf: &mut Vbuffer) -> Result<()> {
        let position = self.position(buf)?;
        let size = self.size(buf)?;
        buf.flatten_range(position, size)?;
        if !self.start.is_registered() {
            buf.reposition(&mut self.start, position)?;
        }
        Ok(())
    }

    /// 在窗口内逐段直接访问，片段被窗口长度截断。
    pub fn mmap(&self, buf: &Vbuffer) -> Result<MmapCursor> {
        let size = self.size(buf)?;
        buf.mmap_window(&self.start, Some(size))
    }

    /// 以迭代器形式遍历窗口内的只读片段。
    pub fn chunks<'a>(&self, buf: &'a Vbuffer) -> Result<Chunks<'a>> {
        Ok(Chunks::bounded(buf, self.mmap(buf)?))
    }

    pub fn get_byte(&self, buf: &Vbuffer, offset: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_at(buf, offset, &mut byte)?;
        Ok(byte[0])
    }

    pub fn set_byte(&self, buf: &mut Vbuffer, offset: usize, byte: u8) -> Result<()> {
        self.write_at(buf, offset, &[byte])
    }

    /// 复制整个窗口。
    pub fn to_vec(&self, buf: &Vbuffer) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size(buf)?];
        self.read_at(buf, 0, &mut out)?;
        Ok(out)
    }

    /// 注册起点，使窗口跨结构编辑存活。
    pub fn register(&mut self, buf: &mut Vbuffer) -> Result<()> {
        buf.iterator_register(&mut self.start)
    }

    pub fn unregister(&mut self, buf: &mut Vbuffer) -> Result<()> {
        buf.iterator_unregister(&mut self.start)
    }

    /// 从窗口内偏移 `offset` 读取 `dst.len()` 字节，越出窗口返回越界错误。
    pub(crate) fn read_at(&self, buf: &Vbuffer, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_span(buf, offset, dst.len())?;
        let cursor = buf.resolve(&self.start)?;
        let (segment, intra, _) = buf.walk(cursor.segment, cursor.offset, offset);
        buf.copy_out(segment, intra, dst);
        Ok(())
    }

    /// 从窗口内偏移 `offset` 覆盖写入 `src`。
    pub(crate) fn write_at(&self, buf: &mut Vbuffer, offset: usize, src: &[u8]) -> Result<()> {
        self.check_span(buf, offset, src.len())?;
        let cursor = buf.resolve(&self.start)?;
        if cursor.readonly {
            return raise(VbufferError::ReadOnly { target: "iterator" });
        }
        buf.check_writable("chain")?;
        let (segment, intra, _) = buf.walk(cursor.segment, cursor.offset, offset);
        buf.copy_in(segment, intra, src)
    }

    fn check_span(&self, buf: &Vbuffer, offset: usize, len: usize) -> Result<usize> {
        let size = self.size(buf)?;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(size),
            _ => raise(VbufferError::out_of_bounds(offset, len, size)),
        }
    }
}
