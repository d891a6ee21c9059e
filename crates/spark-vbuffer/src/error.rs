//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为虚拟缓冲引擎对外暴露的所有失败路径提供集中定义，调用方（协议解析器、脚本绑定层）
//!   只需匹配一个枚举即可区分“参数非法”“资源耗尽”“不变量被破坏”三类故障；
//! - 绑定层沿用“返回哨兵值 + 查询最近错误”的协议，因此本模块同时维护线程局部的最近错误槽位。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 [`thiserror::Error`]，可直接参与 `?` 传播；
//! - 每个变体映射到稳定错误码（[`codes`]），遵循 `<域>.<语义>` 命名；
//! - 失败的操作不得改变缓冲链状态，错误只描述“为何拒绝”。
//!
//! ## 执行逻辑（How）
//! - 内部统一通过 [`raise`] 构造失败结果：记录最近错误、按错误类别输出 `tracing` 事件，再返回 `Err`。

use core::cell::RefCell;

use thiserror::Error;

/// 引擎统一的 `Result` 别名。
pub type Result<T, E = VbufferError> = core::result::Result<T, E>;

/// 稳定错误码命名空间。
///
/// 码值面向日志与告警聚合，调整时需同步绑定层的错误映射表。
pub mod codes {
    /// 偏移或长度超出流边界。
    pub const OUT_OF_BOUNDS: &str = "vbuffer.out_of_bounds";
    /// 其它参数非法（位宽、字段宽度、数值溢出等）。
    pub const INVALID_ARGUMENT: &str = "vbuffer.invalid_argument";
    /// 缓冲链或迭代器处于只读模式。
    pub const READ_ONLY: &str = "vbuffer.read_only";
    /// 后备存储或段分配失败。
    pub const RESOURCE_EXHAUSTED: &str = "vbuffer.resource_exhausted";
    /// 迭代器属于另一条缓冲链。
    pub const FOREIGN_ITERATOR: &str = "vbuffer.iterator.foreign";
    /// 迭代器已被强制解绑。
    pub const DETACHED_ITERATOR: &str = "vbuffer.iterator.detached";
    /// 未注册迭代器或游标在结构编辑之后继续被使用。
    pub const STALE_ITERATOR: &str = "vbuffer.iterator.stale";
    /// 释放缓冲链时仍有已注册迭代器。
    pub const LIVE_ITERATORS: &str = "vbuffer.free.live_iterators";
}

/// 错误类别，对应调用方的三种处置策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 参数越界或不合法，放弃当前报文操作即可。
    InvalidArgument,
    /// 分配失败，操作未生效，链保持原状。
    ResourceExhaustion,
    /// 编程错误：悬垂位置、跨链使用或带着活跃迭代器释放。
    InvariantViolation,
}

/// 虚拟缓冲引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把越界、只读、分配失败与迭代器误用区分成细粒度变体，
///   既方便解析器做精确重试决策，也让不变量类错误在日志中足够醒目；
/// - **契约 (What)**：所有变体实现 `Clone + Send + Sync + 'static`，可以存入最近错误槽位；
///   [`VbufferError::code`] 返回稳定错误码，[`VbufferError::class`] 返回处置类别；
/// - **设计权衡 (Trade-offs)**：变体只携带定长上下文（偏移、长度、静态描述），
///   失败路径上不产生堆分配。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VbufferError {
    /// 偏移与长度组合超出流边界。
    #[error("range offset {offset} length {length} exceeds stream size {size}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        size: usize,
    },

    /// 参数不满足操作约束，`detail` 为静态描述。
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: &'static str },

    /// 缓冲链已封存或迭代器为只读。
    #[error("write through read-only {target}")]
    ReadOnly { target: &'static str },

    /// 分配 `requested` 字节的后备存储或新的段槽位失败。
    #[error("allocation of {requested} bytes failed")]
    ResourceExhausted { requested: usize },

    /// 迭代器或游标来自另一条缓冲链。
    #[error("iterator belongs to chain {found}, not chain {expected}")]
    ForeignIterator { expected: u64, found: u64 },

    /// 迭代器已被 `iterator_clear` 或链释放强制解绑。
    #[error("iterator has been detached from its chain")]
    DetachedIterator,

    /// 未注册迭代器（或游标）在其记录的 epoch 之后继续使用。
    #[error("unregistered iterator from epoch {recorded} used at epoch {current}")]
    StaleIterator { recorded: u64, current: u64 },

    /// 释放缓冲链时仍有 `count` 个已注册迭代器。
    #[error("chain still has {count} registered iterators")]
    LiveIterators { count: usize },
}

impl VbufferError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            VbufferError::OutOfBounds { .. } => codes::OUT_OF_BOUNDS,
            VbufferError::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
            VbufferError::ReadOnly { .. } => codes::READ_ONLY,
            VbufferError::ResourceExhausted { .. } => codes::RESOURCE_EXHAUSTED,
            VbufferError::ForeignIterator { .. } => codes::FOREIGN_ITERATOR,
            VbufferError::DetachedIterator => codes::DETACHED_ITERATOR,
            VbufferError::StaleIterator { .. } => codes::STALE_ITERATOR,
            VbufferError::LiveIterators { .. } => codes::LIVE_ITERATORS,
        }
    }

    /// 返回错误类别。
    pub fn class(&self) -> ErrorClass {
        match self {
            VbufferError::OutOfBounds { .. }
            | VbufferError::InvalidArgument { .. }
            | VbufferError::ReadOnly { .. } => ErrorClass::InvalidArgument,
            VbufferError::ResourceExhausted { .. } => ErrorClass::ResourceExhaustion,
            VbufferError::ForeignIterator { .. }
            | VbufferError::DetachedIterator
            | VbufferError::StaleIterator { .. }
            | VbufferError::LiveIterators { .. } => ErrorClass::InvariantViolation,
        }
    }

    /// 构造越界错误的便捷函数。
    pub(crate) fn out_of_bounds(offset: usize, length: usize, size: usize) -> Self {
        VbufferError::OutOfBounds {
            offset,
            length,
            size,
        }
    }

    pub(crate) fn invalid(detail: &'static str) -> Self {
        VbufferError::InvalidArgument { detail }
    }
}

std::thread_local! {
    static LAST_ERROR: RefCell<Option<VbufferError>> = const { RefCell::new(None) };
}

/// 返回当前线程最近一次失败操作记录的错误。
///
/// 绑定层在收到哨兵返回值后调用本函数获取详情；成功的操作不会清空槽位。
pub fn last_error() -> Option<VbufferError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// 清空当前线程的最近错误槽位，并返回被清除的值。
pub fn clear_last_error() -> Option<VbufferError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// 记录并返回失败结果。
pub(crate) fn raise<T>(err: VbufferError) -> Result<T> {
    record(&err);
    Err(err)
}

/// 写入最近错误槽位并按类别输出日志，供不以 [`Result`] 返回失败的路径使用。
///
/// 不变量类错误以 `error` 级别输出，资源耗尽以 `warn` 级别输出，参数类错误以 `debug` 级别输出，
/// 避免高频的越界探测淹没日志。
pub(crate) fn record(err: &VbufferError) {
    match err.class() {
        ErrorClass::InvariantViolation => {
            tracing::error!(code = err.code(), error = %err, "vbuffer invariant violated");
        }
        ErrorClass::ResourceExhaustion => {
            tracing::warn!(code = err.code(), error = %err, "vbuffer allocation failed");
        }
        ErrorClass::InvalidArgument => {
            tracing::debug!(code = err.code(), error = %err, "vbuffer operation rejected");
        }
    }
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_records_last_error_per_thread() {
        clear_last_error();
        let result: Result<()> = raise(VbufferError::invalid("bits"));
        assert!(result.is_err());
        assert_eq!(last_error(), Some(VbufferError::invalid("bits")));

        let other = std::thread::spawn(last_error).join().expect("线程不应 panic");
        assert!(other.is_none(), "最近错误槽位必须是线程局部的");

        assert_eq!(clear_last_error(), Some(VbufferError::invalid("bits")));
        assert!(last_error().is_none());
    }

    #[test]
    fn record_fills_slot_without_failing_the_caller() {
        clear_last_error();
        record(&VbufferError::LiveIterators { count: 2 });
        assert_eq!(last_error(), Some(VbufferError::LiveIterators { count: 2 }));
        clear_last_error();
    }

    #[test]
    fn classes_follow_error_taxonomy() {
        assert_eq!(
            VbufferError::out_of_bounds(1, 2, 0).class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(
            VbufferError::ResourceExhausted { requested: 8 }.class(),
            ErrorClass::ResourceExhaustion
        );
        assert_eq!(
            VbufferError::LiveIterators { count: 1 }.class(),
            ErrorClass::InvariantViolation
        );
        assert_eq!(VbufferError::DetachedIterator.code(), codes::DETACHED_ITERATOR);
    }
}
