//! 外部所有权钩子：让脚本绑定层跟踪链的生命周期。
//!
//! # 设计背景（Why）
//! - 绑定层会为链创建宿主语言对象；链被引擎销毁后，宿主对象不得继续持有指向它的引用；
//! - 引擎不了解宿主运行时，只在挂接时与销毁时回调一个能力对象，并交给它一个不透明令牌。
//!
//! # 契约说明（What）
//! - 同一时刻一条链最多挂接一个所有者；
//! - `on_external_release` 对每次挂接恰好调用一次：显式 `detach_owner` 或链销毁时；
//! - 回调在引擎内部同步执行，实现不得回调同一条链。

use std::sync::Arc;

use crate::chain::{ChainId, Vbuffer};
use crate::error::{Result, VbufferError, raise};

/// 绑定层所有者能力。
pub trait ExternalOwner: Send + Sync + 'static {
    /// 链被交给外部所有者时调用。
    fn mark_owned_by_external(&self, token: OwnerToken);

    /// 链被解除挂接或销毁时调用，之后令牌不再指向任何存活的链。
    fn on_external_release(&self, token: OwnerToken);
}

/// 交给绑定层的不透明令牌。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken(ChainId);

impl OwnerToken {
    pub fn chain(self) -> ChainId {
        self.0
    }
}

pub(crate) struct OwnerBinding {
    owner: Arc<dyn ExternalOwner>,
    token: OwnerToken,
}

impl OwnerBinding {
    pub(crate) fn release(self) {
        tracing::trace!(chain = %self.token.0, "vbuffer external owner released");
        self.owner.on_external_release(self.token);
    }
}

impl Vbuffer {
    /// 挂接外部所有者，已有所有者时返回参数错误。
    pub fn attach_owner(&mut self, owner: Arc<dyn ExternalOwner>) -> Result<OwnerToken> {
        if self.owner.is_some() {
            return raise(VbufferError::invalid("chain already has an external owner"));
        }
        let token = OwnerToken(self.id);
        owner.mark_owned_by_external(token);
        self.owner = Some(OwnerBinding { owner, token });
        Ok(token)
    }

    /// 解除挂接并通知所有者，返回原令牌。
    pub fn detach_owner(&mut self) -> Option<OwnerToken> {
        let binding = self.owner.take()?;
        let token = binding.token;
        binding.release();
        Some(token)
    }

    pub fn is_owned_by_external(&self) -> bool {
        self.owner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, OwnerToken)>>,
    }

    impl ExternalOwner for Recorder {
        fn mark_owned_by_external(&self, token: OwnerToken) {
            self.events.lock().expect("锁").push(("mark", token));
        }

        fn on_external_release(&self, token: OwnerToken) {
            self.events.lock().expect("锁").push(("release", token));
        }
    }

    #[test]
    fn release_fires_once_on_drop() {
        let recorder = Arc::new(Recorder::default());
        let mut chain = Vbuffer::from_slice(b"pkt").expect("构造链");
        let token = chain.attach_owner(recorder.clone()).expect("挂接");
        assert!(chain.is_owned_by_external());
        assert!(chain.attach_owner(recorder.clone()).is_err());
        drop(chain);
        let events = recorder.events.lock().expect("锁").clone();
        assert_eq!(events, vec![("mark", token), ("release", token)]);
    }

    #[test]
    fn detach_notifies_and_clears_state() {
        let recorder = Arc::new(Recorder::default());
        let mut chain = Vbuffer::from_slice(b"pkt").expect("构造链");
        let token = chain.attach_owner(recorder.clone()).expect("挂接");
        assert_eq!(chain.detach_owner(), Some(token));
        assert!(!chain.is_owned_by_external());
        drop(chain);
        assert_eq!(recorder.events.lock().expect("锁").len(), 2);
    }
}
