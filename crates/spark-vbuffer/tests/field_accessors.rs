//! `field_accessors` 集成测试：验证子视图上的整数、位域与字符串访问。
//!
//! # 测试目标（Why）
//! - 解析器读取的报头字段经常跨越补丁与原始报文的段边界，访问器必须对段结构透明；
//! - 定长字符串字段沿袭传统协议的填充语义，写入短串时补 0，写入长串时报错。

use spark_vbuffer::{
    ALL, Endian, ErrorClass, FieldKind, FieldValue, FieldView, Vbuffer, VbufferError, codes,
};

/// 由两段拼成的链，边界位于偏移 3。
fn split_chain(bytes: &[u8]) -> Vbuffer {
    let mut chain = Vbuffer::from_slice(&bytes[..3]).expect("构造首段");
    chain
        .insert(3, Vbuffer::from_slice(&bytes[3..]).expect("构造次段"), false)
        .expect("追加段");
    assert_eq!(chain.segment_count(), 2);
    chain
}

/// 跨段边界的 32 位整数按两种字节序读写。
#[test]
fn numbers_straddle_segment_boundary() {
    let mut chain = split_chain(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    let field = chain.sub(1, 4).expect("视图");
    assert_eq!(field.as_number(&chain, Endian::Big).expect("大端读取"), 0x1122_3344);
    assert_eq!(field.as_number(&chain, Endian::Little).expect("小端读取"), 0x4433_2211);

    field
        .set_number(&mut chain, Endian::Little, 0x0A0B_0C0D)
        .expect("小端写入");
    assert_eq!(chain.to_vec(), [0x00, 0x0D, 0x0C, 0x0B, 0x0A, 0x55]);
    assert_eq!(chain.segment_count(), 2, "覆盖写入不改变段结构");
}

/// 位域跨越段边界读写。
#[test]
fn bits_straddle_segment_boundary() {
    let mut chain = split_chain(&[0, 0, 0b0000_0011, 0b1100_0000, 0]);
    let field = chain.sub(2, 2).expect("视图");
    assert_eq!(field.as_bits(&chain, 6, 4, Endian::Big).expect("读取"), 0b1111);
    field.set_bits(&mut chain, 6, 4, Endian::Big, 0b1001).expect("写入");
    assert_eq!(chain.to_vec(), [0, 0, 0b0000_0010, 0b0100_0000, 0]);
}

/// 位域参数校验。
#[test]
fn bit_field_arguments_are_validated() {
    let mut chain = Vbuffer::from_slice(&[0u8; 2]).expect("构造链");
    let field = chain.sub(0, 2).expect("视图");
    assert_eq!(
        field.as_bits(&chain, 0, 0, Endian::Big).expect_err("零宽度必须失败").code(),
        codes::INVALID_ARGUMENT
    );
    assert!(field.as_bits(&chain, 10, 7, Endian::Big).is_err());
    assert!(field.set_bits(&mut chain, 0, 3, Endian::Big, 8).is_err());
    assert_eq!(chain.to_vec(), [0, 0], "失败的写入不得改动字节");
}

/// 定长字符串场景：`"ab\0\0"` 读出 `"ab"`，写入 `"xyz"` 后第 4 字节仍为 0。
#[test]
fn fixed_string_scenario() {
    let mut chain = Vbuffer::from_slice(b"ab\0\0").expect("构造链");
    let field = chain.sub(0, 4).expect("视图");
    assert_eq!(field.as_string(&chain).expect("读取"), b"ab");
    field.set_fixed_string(&mut chain, b"xyz").expect("写入");
    assert_eq!(field.as_string(&chain).expect("读取"), b"xyz");
    assert_eq!(chain.getbyte(3).expect("第 4 字节"), 0);

    let err = field
        .set_fixed_string(&mut chain, b"toolong")
        .expect_err("超出窗口必须失败");
    assert_eq!(err.class(), ErrorClass::InvalidArgument);
    assert_eq!(chain.to_vec(), b"xyz\0");
}

/// `copy_string` 复制较短者的长度。
#[test]
fn copy_string_is_bounded_by_destination() {
    let chain = split_chain(b"header");
    let field = chain.sub(1, ALL).expect("视图");
    let mut small = [0u8; 3];
    assert_eq!(field.copy_string(&chain, &mut small).expect("复制"), 3);
    assert_eq!(&small, b"ead");
    let mut large = [0u8; 16];
    assert_eq!(field.copy_string(&chain, &mut large).expect("复制"), 5);
    assert_eq!(&large[..5], b"eader");
}

/// 变长字符串写入会伸缩链，后续字节随之平移。
#[test]
fn set_string_grows_and_shrinks_chain() {
    let mut chain = split_chain(b"k=v;rest");
    let mut value = chain.sub(2, 1).expect("视图");
    value.set_string(&mut chain, b"longer").expect("加长");
    assert_eq!(chain.to_vec(), b"k=longer;rest");
    value.set_string(&mut chain, b"").expect("清空");
    assert_eq!(chain.to_vec(), b"k=;rest");
    assert_eq!(value.size(&chain).expect("长度"), 0);
}

/// 只读游标划定的视图拒绝写入。
#[test]
fn readonly_view_rejects_writes() {
    let mut chain = Vbuffer::from_slice(&[1, 2, 3, 4]).expect("构造链");
    let mut it = chain.iterator(false, true);
    let field = chain.iterator_sub(&mut it, 2, false).expect("视图");
    assert_eq!(field.as_number(&chain, Endian::Big).expect("读取"), 0x0102);
    assert_eq!(
        field.set_number(&mut chain, Endian::Big, 1).expect_err("只读视图必须拒绝写入"),
        VbufferError::ReadOnly { target: "iterator" }
    );
}

/// 类型化字段视图在整数与字符串之间统一读写。
#[test]
fn field_views_dispatch_on_kind() {
    let mut chain = split_chain(&[0x80, 0x00, 0x00, 0x01, b'o', b'k', 0, 0]);
    let signed = FieldView::new(&chain, chain.sub(0, 4).expect("视图"), FieldKind::Int32, Endian::Big)
        .expect("有符号视图");
    assert_eq!(
        signed.get(&chain).expect("读取"),
        FieldValue::Signed(i64::from(i32::MIN) + 1)
    );
    let unsigned = FieldView::new(&chain, chain.sub(0, 4).expect("视图"), FieldKind::UInt32, Endian::Big)
        .expect("无符号视图");
    assert_eq!(unsigned.get(&chain).expect("读取"), FieldValue::Unsigned(0x8000_0001));

    let mut name = FieldView::new(
        &chain,
        chain.sub(4, 4).expect("视图"),
        FieldKind::FixedString,
        Endian::Big,
    )
    .expect("字符串视图");
    assert_eq!(name.get(&chain).expect("读取"), FieldValue::Bytes(b"ok".to_vec()));
    name.set(&mut chain, &FieldValue::Bytes(b"hey".to_vec())).expect("写入");
    assert_eq!(chain.to_vec()[4..], *b"hey\0");
    assert!(name.set(&mut chain, &FieldValue::Unsigned(1)).is_err());
}
