//! 屏蔽策略、容错模式与绑定器配置。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BinderError;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// 决定失败是抛给调用方还是吞掉并返回默认值。
///
/// # 契约（What）
/// - `Handled`：吞掉“可处理”的失败（通信异常、超时）；
/// - `Unhandled`：吞掉其余非致命失败；
/// - 致命错误在任何模式下都会传播。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskingMode {
    #[default]
    None,
    Handled,
    Unhandled,
    All,
}

impl MaskingMode {
    pub fn masks_handled(self) -> bool {
        matches!(self, MaskingMode::Handled | MaskingMode::All)
    }

    pub fn masks_unhandled(self) -> bool {
        matches!(self, MaskingMode::Unhandled | MaskingMode::All)
    }

    /// 是否允许作为绑定器的默认模式。
    pub fn is_valid_default(self) -> bool {
        matches!(self, MaskingMode::None | MaskingMode::All)
    }
}

/// 内部通道故障时绑定器是否自愈。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerateFaultsMode {
    Never,
    /// 通道未建立安全会话时容错；安全会话断开意味着会话上下文已丢失。
    #[default]
    IfNotSecuritySession,
    Always,
}

impl TolerateFaultsMode {
    pub fn tolerates(self, has_security_session: bool) -> bool {
        match self {
            TolerateFaultsMode::Never => false,
            TolerateFaultsMode::IfNotSecuritySession => !has_security_session,
            TolerateFaultsMode::Always => true,
        }
    }
}

/// 绑定器配置。
///
/// 时长字段以毫秒整数表示，配置文件只需写出要覆盖的字段。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderSettings {
    pub default_masking_mode: MaskingMode,
    pub tolerate_faults: TolerateFaultsMode,
    #[serde(with = "millis")]
    pub default_close_timeout: Duration,
    #[serde(with = "millis")]
    pub default_send_timeout: Duration,
}

impl Default for BinderSettings {
    fn default() -> Self {
        Self {
            default_masking_mode: MaskingMode::None,
            tolerate_faults: TolerateFaultsMode::default(),
            default_close_timeout: Duration::from_secs(10),
            default_send_timeout: Duration::from_secs(60),
        }
    }
}

impl BinderSettings {
    pub fn with_default_masking_mode(mut self, mode: MaskingMode) -> Self {
        self.default_masking_mode = mode;
        self
    }

    pub fn with_tolerate_faults(mut self, mode: TolerateFaultsMode) -> Self {
        self.tolerate_faults = mode;
        self
    }

    pub fn with_default_close_timeout(mut self, timeout: Duration) -> Self {
        self.default_close_timeout = timeout;
        self
    }

    pub fn with_default_send_timeout(mut self, timeout: Duration) -> Self {
        self.default_send_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BinderError> {
        if self.default_masking_mode.is_valid_default() {
            Ok(())
        } else {
            Err(BinderError::MaskingModeNotAllowed(self.default_masking_mode))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_bits() {
        assert!(!MaskingMode::None.masks_handled());
        assert!(MaskingMode::Handled.masks_handled());
        assert!(!MaskingMode::Handled.masks_unhandled());
        assert!(MaskingMode::Unhandled.masks_unhandled());
        assert!(MaskingMode::All.masks_handled() && MaskingMode::All.masks_unhandled());
    }

    #[test]
    fn only_none_and_all_are_valid_defaults() {
        for mode in [MaskingMode::Handled, MaskingMode::Unhandled] {
            let settings = BinderSettings::default().with_default_masking_mode(mode);
            assert_eq!(settings.validate(), Err(BinderError::MaskingModeNotAllowed(mode)));
        }
        assert!(BinderSettings::default().with_default_masking_mode(MaskingMode::All).validate().is_ok());
    }

    #[test]
    fn tolerate_faults_honours_security_session() {
        assert!(TolerateFaultsMode::IfNotSecuritySession.tolerates(false));
        assert!(!TolerateFaultsMode::IfNotSecuritySession.tolerates(true));
        assert!(!TolerateFaultsMode::Never.tolerates(false));
        assert!(TolerateFaultsMode::Always.tolerates(true));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings: BinderSettings = toml::from_str(
            r#"
                default_masking_mode = "All"
                default_send_timeout = 2500
            "#,
        )
        .unwrap();
        assert_eq!(settings.default_masking_mode, MaskingMode::All);
        assert_eq!(settings.default_send_timeout, Duration::from_millis(2500));
        assert_eq!(settings.default_close_timeout, Duration::from_secs(10));
        assert_eq!(settings.tolerate_faults, TolerateFaultsMode::IfNotSecuritySession);
    }
}
