//! 缓冲链的可调参数。
//!
//! # 教案式说明
//! - **意图（Why）**：`compact` 的合并阈值与自动整理时机因流量形态而异（大量小补丁 vs. 少量大报文），
//!   需要由宿主配置而非硬编码；
//! - **逻辑（How）**：`VbufferConfig` 以 serde 派生序列化，字段缺省时回退到 [`Default`]，
//!   启用 `toml-config` 特性后可直接解析 TOML 片段；
//! - **契约（What）**：配置在链创建时按值复制，`extract` 产生的新链继承源链配置。

use serde::{Deserialize, Serialize};

use crate::error::{Result, VbufferError, raise};

/// 缓冲链配置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VbufferConfig {
    /// 长度小于该值的相邻段会被 `compact` 合并。
    pub compact_threshold: usize,
    /// 单个合并块的字节上限。
    pub compact_max_merged: usize,
    /// 插入后若段数超过该值，则自动执行一次 `compact`；`None` 表示从不自动整理。
    pub auto_compact_segments: Option<usize>,
}

impl Default for VbufferConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 256,
            compact_max_merged: 4096,
            auto_compact_segments: None,
        }
    }
}

impl VbufferConfig {
    /// 校验字段之间的约束。
    ///
    /// - `compact_threshold` 必须大于 0；
    /// - `compact_max_merged` 不得小于 `compact_threshold`；
    /// - `auto_compact_segments` 若存在则必须大于 1，否则每次插入都会触发整理。
    pub fn validate(&self) -> Result<()> {
        if self.compact_threshold == 0 {
            return raise(VbufferError::invalid("compact_threshold must be positive"));
        }
        if self.compact_max_merged < self.compact_threshold {
            return raise(VbufferError::invalid(
                "compact_max_merged must not be smaller than compact_threshold",
            ));
        }
        if matches!(self.auto_compact_segments, Some(limit) if limit < 2) {
            return raise(VbufferError::invalid(
                "auto_compact_segments must allow at least two segments",
            ));
        }
        Ok(())
    }

    /// 从 TOML 文本解析并校验配置。
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: VbufferConfig = match toml::from_str(text) {
            Ok(config) => config,
            Err(err) => {
                tracing::debug!(error = %err, "vbuffer config rejected");
                return raise(VbufferError::invalid("malformed vbuffer config"));
            }
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(VbufferConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inconsistent_thresholds() {
        let config = VbufferConfig {
            compact_threshold: 512,
            compact_max_merged: 128,
            auto_compact_segments: None,
        };
        assert_eq!(
            config.validate().unwrap_err().code(),
            crate::error::codes::INVALID_ARGUMENT
        );
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = VbufferConfig::from_toml_str("compact_threshold = 64\nauto_compact_segments = 32\n")
            .expect("合法配置应当解析成功");
        assert_eq!(config.compact_threshold, 64);
        assert_eq!(config.compact_max_merged, 4096);
        assert_eq!(config.auto_compact_segments, Some(32));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn unknown_keys_are_rejected() {
        assert!(VbufferConfig::from_toml_str("compact_treshold = 1").is_err());
    }
}
