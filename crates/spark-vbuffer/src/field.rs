//! 字段访问：在子视图上按整数、位域与字符串解释字节。
//!
//! # 模块定位（Why）
//! - 协议解析器读取报头时面对的是跨段的字节，字段可能恰好跨越补丁与原始报文的边界；
//! - 访问器先把字段字节收集到栈上的小缓冲（整数至多 8 字节，位域至多 9 字节），
//!   再做纯算术的解码与编码，跨段细节全部由子视图的读写承担。
//!
//! # 契约说明（What）
//! - 整数字段宽度为子视图长度，须在 1..=8 之间；
//! - 位域宽度 1..=64，`bit_offset + bits` 不得超出子视图的位数；
//!   大端时位从首字节最高位开始编号，小端时字节按低位在前拼接、位从最低位开始编号；
//! - 写入的数值必须能以该宽度的无符号或二补码形式表示，否则返回参数错误且不写入任何字节。

use crate::chain::Vbuffer;
use crate::error::{Result, VbufferError, raise};
use crate::subbuffer::Subbuffer;

/// 字节序。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endian {
    /// 网络字节序。
    #[default]
    Big,
    Little,
}

impl Subbuffer {
    /// 把整个窗口解释为无符号整数（宽度小于 8 时结果非负）。
    pub fn as_number(&self, buf: &Vbuffer, endian: Endian) -> Result<i64> {
        let width = self.number_width(buf)?;
        let mut raw = [0u8; 8];
        self.read_at(buf, 0, &mut raw[..width])?;
        Ok(decode(&raw[..width], endian) as i64)
    }

    /// 以给定字节序写入整数。
    pub fn set_number(&self, buf: &mut Vbuffer, endian: Endian, value: i64) -> Result<()> {
        let width = self.number_width(buf)?;
        check_fits(value, width * 8)?;
        let mut raw = [0u8; 8];
        encode(value as u64, &mut raw[..width], endian);
        self.write_at(buf, 0, &raw[..width])
    }

    /// 读取 `[bit_offset, bit_offset + bits)` 位域，结果为无符号值。
    pub fn as_bits(&self, buf: &Vbuffer, bit_offset: usize, bits: usize, endian: Endian) -> Result<i64> {
        let span = self.bit_span(buf, bit_offset, bits)?;
        let mut raw = [0u8; 9];
        self.read_at(buf, span.first_byte, &mut raw[..span.bytes])?;
        let acc = assemble(&raw[..span.bytes], endian);
        Ok(((acc >> span.shift(endian)) & span.mask()) as u64 as i64)
    }

    /// 写入位域，窗口内其它位保持不变。
    pub fn set_bits(
        &self,
        buf: &mut Vbuffer,
        bit_offset: usize,
        bits: usize,
        endian: Endian,
        value: i64,
    ) -> Result<()> {
        let span = self.bit_span(buf, bit_offset, bits)?;
        check_fits(value, bits)?;
        let mut raw = [0u8; 9];
        self.read_at(buf, span.first_byte, &mut raw[..span.bytes])?;
        let mut acc = assemble(&raw[..span.bytes], endian);
        let shift = span.shift(endian);
        let mask = span.mask();
        acc = (acc & !(mask << shift)) | (((value as u64 as u128) & mask) << shift);
        scatter(acc, &mut raw[..span.bytes], endian);
        self.write_at(buf, span.first_byte, &raw[..span.bytes])
    }

    /// 读取字符串，遇到第一个 NUL 字节即停止。
    pub fn as_string(&self, buf: &Vbuffer) -> Result<Vec<u8>> {
        let mut out = self.to_vec(buf)?;
        if let Some(end) = out.iter().position(|b| *b == 0) {
            out.truncate(end);
        }
        Ok(out)
    }

    /// 把窗口字节复制到 `dst`，返回复制量（窗口与 `dst` 中较短者）。
    pub fn copy_string(&self, buf: &Vbuffer, dst: &mut [u8]) -> Result<usize> {
        let len = self.size(buf)?.min(dst.len());
        self.read_at(buf, 0, &mut dst[..len])?;
        Ok(len)
    }

    /// 写入定长字符串：不足部分以 0 填充，超出窗口返回越界错误。
    pub fn set_fixed_string(&self, buf: &mut Vbuffer, value: &[u8]) -> Result<()> {
        let size = self.size(buf)?;
        if value.len() > size {
            return raise(VbufferError::out_of_bounds(0, value.len(), size));
        }
        let mut padded = vec![0u8; size];
        padded[..value.len()].copy_from_slice(value);
        self.write_at(buf, 0, &padded)
    }

    /// 以 `value` 替换整个窗口，链随之伸缩，窗口长度更新为 `value.len()`。
    pub fn set_string(&mut self, buf: &mut Vbuffer, value: &[u8]) -> Result<()> {
        let cursor = buf.resolve(&self.start)?;
        if cursor.readonly {
            return raise(VbufferError::ReadOnly { target: "iterator" });
        }
        buf.check_writable("chain")?;
        let position = self.position(buf)?;
        let size = self.size(buf)?;
        let replacement = Vbuffer::from_slice(value)?;
        buf.erase(position, size)?;
        buf.insert(position, replacement, true)?;
        buf.reposition(&mut self.start, position)?;
        if self.length != crate::ALL {
            self.length = value.len();
        }
        Ok(())
    }

    fn number_width(&self, buf: &Vbuffer) -> Result<usize> {
        let width = self.size(buf)?;
        if !(1..=8).contains(&width) {
            return raise(VbufferError::invalid("number field width must be 1..=8 bytes"));
        }
        Ok(width)
    }

    fn bit_span(&self, buf: &Vbuffer, bit_offset: usize, bits: usize) -> Result<BitSpan> {
        if !(1..=64).contains(&bits) {
            return raise(VbufferError::invalid("bit field width must be 1..=64"));
        }
        let size = self.size(buf)?;
        let end = bit_offset.checked_add(bits);
        if end.is_none_or(|end| end > size.saturating_mul(8)) {
            return raise(VbufferError::out_of_bounds(bit_offset / 8, bits.div_ceil(8), size));
        }
        let first_byte = bit_offset / 8;
        let lead = bit_offset % 8;
        Ok(BitSpan {
            first_byte,
            lead,
            bits,
            bytes: (lead + bits).div_ceil(8),
        })
    }
}

/// 位域覆盖的字节范围。
struct BitSpan {
    first_byte: usize,
    lead: usize,
    bits: usize,
    bytes: usize,
}

impl BitSpan {
    fn shift(&self, endian: Endian) -> usize {
        match endian {
            Endian::Big => self.bytes * 8 - self.lead - self.bits,
            Endian::Little => self.lead,
        }
    }

    fn mask(&self) -> u128 {
        (1u128 << self.bits) - 1
    }
}

/// 值能否以 `bits` 位的无符号或二补码形式表示。
fn check_fits(value: i64, bits: usize) -> Result<()> {
    if bits >= 64 {
        return Ok(());
    }
    let min = -(1i128 << (bits - 1));
    let max = (1i128 << bits) - 1;
    let value = i128::from(value);
    if value < min || value > max {
        return raise(VbufferError::invalid("value does not fit in field width"));
    }
    Ok(())
}

fn decode(raw: &[u8], endian: Endian) -> u64 {
    assemble(raw, endian) as u64
}

fn encode(value: u64, out: &mut [u8], endian: Endian) {
    scatter(u128::from(value), out, endian);
}

fn assemble(raw: &[u8], endian: Endian) -> u128 {
    match endian {
        Endian::Big => raw.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b)),
        Endian::Little => raw
            .iter()
            .rev()
            .fold(0u128, |acc, b| (acc << 8) | u128::from(*b)),
    }
}

fn scatter(mut acc: u128, out: &mut [u8], endian: Endian) {
    match endian {
        Endian::Big => {
            for byte in out.iter_mut().rev() {
                *byte = acc as u8;
                acc >>= 8;
            }
        }
        Endian::Little => {
            for byte in out.iter_mut() {
                *byte = acc as u8;
                acc >>= 8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_bits_count_from_msb() {
        let chain = Vbuffer::from_slice(&[0b1010_0000, 0b0000_0001]).expect("构造链");
        let view = chain.sub(0, 2).expect("视图");
        assert_eq!(view.as_bits(&chain, 0, 3, Endian::Big).expect("读位域"), 0b101);
        assert_eq!(view.as_bits(&chain, 15, 1, Endian::Big).expect("读位域"), 1);
        assert_eq!(view.as_bits(&chain, 7, 2, Endian::Big).expect("读位域"), 0);
    }

    #[test]
    fn little_endian_bits_count_from_lsb() {
        let chain = Vbuffer::from_slice(&[0b0000_0110, 0b1000_0000]).expect("构造链");
        let view = chain.sub(0, 2).expect("视图");
        assert_eq!(view.as_bits(&chain, 1, 2, Endian::Little).expect("读位域"), 0b11);
        assert_eq!(view.as_bits(&chain, 15, 1, Endian::Little).expect("读位域"), 1);
    }

    #[test]
    fn set_bits_preserves_neighbouring_bits() {
        let mut chain = Vbuffer::from_slice(&[0xFF, 0xFF]).expect("构造链");
        let view = chain.sub(0, 2).expect("视图");
        view.set_bits(&mut chain, 4, 8, Endian::Big, 0).expect("写位域");
        assert_eq!(chain.to_vec(), [0xF0, 0x0F]);
    }

    #[test]
    fn number_width_and_range_are_checked() {
        let mut chain = Vbuffer::from_slice(&[0u8; 10]).expect("构造链");
        assert!(chain.sub(0, 9).expect("视图").as_number(&chain, Endian::Big).is_err());
        let byte = chain.sub(0, 1).expect("视图");
        assert!(byte.set_number(&mut chain, Endian::Big, 256).is_err());
        assert!(byte.set_number(&mut chain, Endian::Big, -129).is_err());
        byte.set_number(&mut chain, Endian::Big, -1).expect("二补码写入");
        assert_eq!(byte.as_number(&chain, Endian::Big).expect("读取"), 255);
        assert_eq!(chain.getbyte(1).expect("邻近字节"), 0);
    }

    #[test]
    fn eight_byte_numbers_round_trip_through_sign_bit() {
        let mut chain = Vbuffer::from_slice(&[0u8; 8]).expect("构造链");
        let view = chain.sub(0, 8).expect("视图");
        view.set_number(&mut chain, Endian::Little, i64::MIN).expect("写入");
        assert_eq!(view.as_number(&chain, Endian::Little).expect("读取"), i64::MIN);
        assert_eq!(chain.getbyte(7).expect("最高字节"), 0x80);
    }

    #[test]
    fn set_string_resizes_chain() {
        let mut chain = Vbuffer::from_slice(b"GET /a HTTP").expect("构造链");
        let mut path = chain.sub(4, 2).expect("视图");
        path.set_string(&mut chain, b"/index").expect("替换");
        assert_eq!(chain.to_vec(), b"GET /index HTTP");
        assert_eq!(path.size(&chain).expect("长度"), 6);
        assert_eq!(path.as_string(&chain).expect("读取"), b"/index");
    }
}
