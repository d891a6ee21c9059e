//! `spark-vbuffer` 提供面向报文改写的非连续可变字节缓冲引擎。
//!
//! # 模块定位（Why）
//! - 流量检测与改写场景下，一个报文载荷可能由捕获内存、插入的补丁与提取出的片段拼接而成；
//!   引擎把这些不连续的内存表示为单一逻辑字节流，读取零拷贝，改写可就地或插入；
//! - 协议解析器在改写期间持有指向报文内部的游标，结构编辑必须保持这些游标指向同一逻辑字节。
//!
//! # 设计概要（How）
//! - `store` 以 `Arc<dyn BackingStore>` 表达引用计数的后备存储，`pool` 为捕获源提供可回收的堆块；
//! - `chain` 中的 [`Vbuffer`] 以竞技场存放段与已注册迭代器，编辑只改写被拆分或拼接段上的迭代器；
//! - `iterator`、`subbuffer`、`mmap` 提供游标、窗口与逐段直接访问，`field`/`view` 在窗口上解释数值与字符串；
//! - `maintenance` 负责合并段，`owner` 为脚本绑定层提供生命周期钩子。
//!
//! # 错误与日志（What）
//! - 所有可失败操作返回 [`Result`]，失败同时记录到线程局部的最近错误槽位，见 [`last_error`]；
//! - 结构编辑以 `tracing` 的 `debug` 级别记录，强制解绑迭代器记录 `warn`，不变量违例记录 `error`；
//!   库本身不安装任何订阅者。
//!
//! # 命名约定（Consistency）
//! - 操作名沿用报文改写领域的既有术语（`extract`、`flatten`、`checksize`、`setmode` 等），
//!   便于脚本绑定层一一映射。

mod arena;
mod chain;
mod config;
mod error;
mod field;
mod iterator;
mod maintenance;
mod mmap;
mod owner;
mod pool;
mod segment;
mod store;
mod subbuffer;
mod view;

/// 长度参数取该值时表示“直到流尾”。
pub const ALL: usize = usize::MAX;

pub use chain::{ChainId, FreeError, Vbuffer};
pub use config::VbufferConfig;
pub use error::{ErrorClass, Result, VbufferError, clear_last_error, codes, last_error};
pub use field::Endian;
pub use iterator::VbufferIterator;
pub use mmap::{Chunks, MmapCursor};
pub use owner::{ExternalOwner, OwnerToken};
pub use pool::{StorePool, StorePoolStats, StoreRecycler};
pub use store::{BackingStore, HeapStore, MappedStore, SharedStore, StoreKind, StoreRef};
pub use subbuffer::Subbuffer;
pub use view::{FieldKind, FieldValue, FieldView};
