/// 协议错误定义

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 身份识别阶段的错误码（随 `error` 消息下发给客户端）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthErrorCode {
    /// 缺少 username 或 apiKey
    MissingCredentials,
    /// Bot 未注册
    BotNotRegistered,
    /// Bot 已被停用
    BotDeactivated,
    /// API key 不匹配
    InvalidCredentials,
    /// clientType 既不是 bot 也不是 panel
    InvalidClientType,
    /// 连接已经完成身份识别
    AlreadyIdentified,
}

impl AuthErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::BotNotRegistered => "BOT_NOT_REGISTERED",
            Self::BotDeactivated => "BOT_DEACTIVATED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::InvalidClientType => "INVALID_CLIENT_TYPE",
            Self::AlreadyIdentified => "ALREADY_IDENTIFIED",
        }
    }

    /// 该错误是否需要强制关闭连接
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials
                | Self::BotNotRegistered
                | Self::BotDeactivated
                | Self::InvalidCredentials
        )
    }

    /// 默认的错误描述
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "username and apiKey are required for bots",
            Self::BotNotRegistered => "authentication failed: bot is not registered",
            Self::BotDeactivated => "authentication failed: bot is deactivated",
            Self::InvalidCredentials => "authentication failed: invalid API key",
            Self::InvalidClientType => "invalid client type, use \"bot\" or \"panel\"",
            Self::AlreadyIdentified => "connection is already identified",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 入站帧解析错误
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("无效的 JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("消息不是 JSON 对象")]
    NotAnObject,

    #[error("消息缺少 type 字段")]
    MissingType,

    #[error("{kind} 消息字段无效: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("二进制帧不是有效的 UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings_match_serde() {
        for code in [
            AuthErrorCode::MissingCredentials,
            AuthErrorCode::BotNotRegistered,
            AuthErrorCode::BotDeactivated,
            AuthErrorCode::InvalidCredentials,
            AuthErrorCode::InvalidClientType,
            AuthErrorCode::AlreadyIdentified,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }

    #[test]
    fn test_closes_connection() {
        assert!(AuthErrorCode::InvalidCredentials.closes_connection());
        assert!(AuthErrorCode::MissingCredentials.closes_connection());
        assert!(!AuthErrorCode::InvalidClientType.closes_connection());
        assert!(!AuthErrorCode::AlreadyIdentified.closes_connection());
    }
}
