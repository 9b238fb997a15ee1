/// Bot 凭据校验
///
/// 凭据文件格式（由外部密钥管理工具生成）：
/// `{ "<username>": { "username", "apiKeyHash", "createdAt", "lastUpdated", "isActive" } }`

use async_trait::async_trait;
use common::{AuthErrorCode, Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// 单个 Bot 的凭据记录，其余字段忽略
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub api_key_hash: String,
    #[serde(default)]
    pub is_active: bool,
}

/// 校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    NotRegistered,
    Deactivated,
    InvalidSecret,
}

impl Verification {
    /// 校验失败时对应的错误码
    pub fn rejection(&self) -> Option<AuthErrorCode> {
        match self {
            Self::Valid => None,
            Self::NotRegistered => Some(AuthErrorCode::BotNotRegistered),
            Self::Deactivated => Some(AuthErrorCode::BotDeactivated),
            Self::InvalidSecret => Some(AuthErrorCode::InvalidCredentials),
        }
    }
}

/// 凭据校验接口
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, secret: &str) -> Result<Verification>;
}

/// 基于凭据文件的校验器
///
/// 每次校验都重新读取文件，密钥轮换无需重启 Server
pub struct FileCredentialVerifier {
    path: PathBuf,
}

impl FileCredentialVerifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, CredentialRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("凭据文件不存在: {}", self.path.display());
                Ok(HashMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CredentialVerifier for FileCredentialVerifier {
    async fn verify(&self, username: &str, secret: &str) -> Result<Verification> {
        let mut records = self.load().await?;

        let Some(record) = records.remove(username) else {
            return Ok(Verification::NotRegistered);
        };
        if !record.is_active {
            return Ok(Verification::Deactivated);
        }

        // bcrypt 比较是 CPU 密集操作，放到阻塞线程池执行
        let secret = secret.to_string();
        let hash = record.api_key_hash;
        let matched = tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash))
            .await
            .map_err(|e| Error::Internal(format!("凭据校验任务失败: {}", e)))?
            .map_err(|e| Error::Authentication(format!("无法校验 API key: {}", e)))?;

        Ok(if matched {
            Verification::Valid
        } else {
            Verification::InvalidSecret
        })
    }
}
