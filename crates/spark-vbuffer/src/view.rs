//! 类型化字段视图：在构造时确定字段种类，之后以统一的值类型读写。

use crate::chain::Vbuffer;
use crate::error::{Result, VbufferError, raise};
use crate::field::Endian;
use crate::subbuffer::Subbuffer;

/// 字段种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    /// 定长、以 0 填充的字符串，读取时截断到第一个 NUL。
    FixedString,
    /// 变长字符串，写入时替换整个窗口。
    String,
}

impl FieldKind {
    /// 整数字段的字节宽度；字符串字段返回 `None`。
    pub const fn width(self) -> Option<usize> {
        match self {
            FieldKind::Int8 | FieldKind::UInt8 => Some(1),
            FieldKind::Int16 | FieldKind::UInt16 => Some(2),
            FieldKind::Int32 | FieldKind::UInt32 => Some(4),
            FieldKind::Int64 | FieldKind::UInt64 => Some(8),
            FieldKind::FixedString | FieldKind::String => None,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            FieldKind::Int8 | FieldKind::Int16 | FieldKind::Int32 | FieldKind::Int64
        )
    }
}

/// 字段值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Signed(i64),
    Unsigned(u64),
    Bytes(Vec<u8>),
}

/// 绑定了种类与字节序的子视图。
///
/// # 契约说明（What）
/// - 构造时校验窗口宽度与整数种类一致，之后的读写不再重复判断种类；
/// - 有符号种类读出时做符号扩展，无符号种类拒绝负值写入；
/// - 值的形态与种类不符（例如向整数字段写入字节串）返回参数错误。
#[derive(Debug)]
pub struct FieldView {
    sub: Subbuffer,
    kind: FieldKind,
    endian: Endian,
}

impl FieldView {
    pub fn new(buf: &Vbuffer, sub: Subbuffer, kind: FieldKind, endian: Endian) -> Result<Self> {
        if let Some(width) = kind.width() {
            if sub.size(buf)? != width {
                return raise(VbufferError::invalid("window width does not match field kind"));
            }
        }
        Ok(Self { sub, kind, endian })
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn subbuffer(&self) -> &Subbuffer {
        &self.sub
    }

    pub fn into_subbuffer(self) -> Subbuffer {
        self.sub
    }

    pub fn get(&self, buf: &Vbuffer) -> Result<FieldValue> {
        match (self.kind.width(), self.kind) {
            (Some(width), kind) => {
                let raw = self.sub.as_number(buf, self.endian)? as u64;
                if kind.is_signed() {
                    let shift = 64 - width * 8;
                    Ok(FieldValue::Signed(((raw << shift) as i64) >> shift))
                } else {
                    Ok(FieldValue::Unsigned(raw))
                }
            }
            (None, FieldKind::FixedString) => Ok(FieldValue::Bytes(self.sub.as_string(buf)?)),
            (None, _) => Ok(FieldValue::Bytes(self.sub.to_vec(buf)?)),
        }
    }

    pub fn set(&mut self, buf: &mut Vbuffer, value: &FieldValue) -> Result<()> {
        match (self.kind, value) {
            (FieldKind::FixedString, FieldValue::Bytes(bytes)) => {
                self.sub.set_fixed_string(buf, bytes)
            }
            (FieldKind::String, FieldValue::Bytes(bytes)) => self.sub.set_string(buf, bytes),
            (kind, FieldValue::Signed(v)) if kind.width().is_some() => {
                if !kind.is_signed() && *v < 0 {
                    return raise(VbufferError::invalid("negative value for unsigned field"));
                }
                let bits = kind.width().map_or(64, |width| width * 8);
                if kind.is_signed() && bits < 64 {
                    let limit = 1i64 << (bits - 1);
                    if *v < -limit || *v >= limit {
                        return raise(VbufferError::invalid("value exceeds signed field range"));
                    }
                }
                self.sub.set_number(buf, self.endian, *v)
            }
            (kind, FieldValue::Unsigned(v)) if kind.width().is_some() => {
                let signed_max = kind
                    .width()
                    .map_or(u64::MAX, |width| (1u64 << (width * 8 - 1)) - 1);
                if kind.is_signed() && *v > signed_max {
                    return raise(VbufferError::invalid("value exceeds signed field range"));
                }
                self.sub.set_number(buf, self.endian, *v as i64)
            }
            _ => raise(VbufferError::invalid("value shape does not match field kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_fields_are_sign_extended() {
        let chain = Vbuffer::from_slice(&[0xFF, 0xFE]).expect("构造链");
        let view = FieldView::new(&chain, chain.sub(0, 2).expect("视图"), FieldKind::Int16, Endian::Big)
            .expect("字段视图");
        assert_eq!(view.get(&chain).expect("读取"), FieldValue::Signed(-2));
    }

    #[test]
    fn width_mismatch_is_rejected_at_construction() {
        let chain = Vbuffer::from_slice(&[0u8; 3]).expect("构造链");
        let sub = chain.sub(0, 3).expect("视图");
        assert!(FieldView::new(&chain, sub, FieldKind::UInt32, Endian::Big).is_err());
    }

    #[test]
    fn shape_and_sign_mismatches_are_rejected() {
        let mut chain = Vbuffer::from_slice(&[0u8; 4]).expect("构造链");
        let sub = chain.sub(0, 1).expect("视图");
        let mut view = FieldView::new(&chain, sub, FieldKind::UInt8, Endian::Big).expect("字段视图");
        assert!(view.set(&mut chain, &FieldValue::Signed(-1)).is_err());
        assert!(view.set(&mut chain, &FieldValue::Bytes(vec![1])).is_err());
        view.set(&mut chain, &FieldValue::Unsigned(200)).expect("写入");
        assert_eq!(view.get(&chain).expect("读取"), FieldValue::Unsigned(200));

        let sub = chain.sub(1, 1).expect("视图");
        let mut signed = FieldView::new(&chain, sub, FieldKind::Int8, Endian::Big).expect("字段视图");
        assert!(signed.set(&mut chain, &FieldValue::Unsigned(200)).is_err());
    }

    #[test]
    fn fixed_string_field_pads_with_zeros() {
        let mut chain = Vbuffer::from_slice(b"abcd").expect("构造链");
        let sub = chain.sub(0, 4).expect("视图");
        let mut view = FieldView::new(&chain, sub, FieldKind::FixedString, Endian::Big).expect("字段视图");
        view.set(&mut chain, &FieldValue::Bytes(b"xy".to_vec())).expect("写入");
        assert_eq!(chain.to_vec(), b"xy\0\0");
        assert_eq!(view.get(&chain).expect("读取"), FieldValue::Bytes(b"xy".to_vec()));
    }
}
