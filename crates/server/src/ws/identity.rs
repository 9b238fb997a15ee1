/// 身份识别
///
/// 连接建立后处于未识别状态，只有 identify 消息会被处理。
/// Bot 需要通过凭据校验，控制面板无需认证。

use common::protocol::{ClientType, IdentifyRequest, ServerMessage};
use common::AuthErrorCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::registry::{BotIdentity, ConnectionRegistry, RegistryError, Role};
use crate::auth::{CredentialVerifier, Verification};
use crate::metrics::Metrics;

/// identify 处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// 已识别为指定角色
    Identified(ClientType),
    /// 识别失败，连接保持未识别状态
    Unidentified,
    /// 认证失败，连接需要关闭
    Rejected,
}

#[derive(Clone)]
pub struct IdentityService {
    registry: ConnectionRegistry,
    verifier: Arc<dyn CredentialVerifier>,
    metrics: Arc<Metrics>,
}

impl IdentityService {
    pub fn new(
        registry: ConnectionRegistry,
        verifier: Arc<dyn CredentialVerifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            verifier,
            metrics,
        }
    }

    /// 处理未识别连接的 identify 消息
    pub async fn identify(&self, id: &str, request: IdentifyRequest) -> IdentifyOutcome {
        match request.client_type() {
            Some(ClientType::Bot) => self.identify_bot(id, request).await,
            Some(ClientType::Panel) => {
                self.registry
                    .send_to(
                        id,
                        ServerMessage::Welcome {
                            message: "Control panel connected!".to_string(),
                            authenticated: None,
                        },
                    )
                    .await;
                self.assign(id, Role::Panel).await
            }
            None => {
                warn!("未知的客户端类型: {:?} ({})", request.client_type, id);
                self.reject(id, AuthErrorCode::InvalidClientType).await
            }
        }
    }

    /// 已识别连接重复发送 identify
    pub async fn reject_reidentify(&self, id: &str) {
        warn!("连接 {} 重复发送 identify，已拒绝", id);
        self.reply_error(id, AuthErrorCode::AlreadyIdentified).await;
    }

    async fn identify_bot(&self, id: &str, request: IdentifyRequest) -> IdentifyOutcome {
        let (Some(username), Some(api_key)) = (
            request.username.filter(|u| !u.is_empty()),
            request.api_key.filter(|k| !k.is_empty()),
        ) else {
            warn!("Bot 连接缺少凭据: {}", id);
            return self.reject(id, AuthErrorCode::MissingCredentials).await;
        };

        let verification = match self.verifier.verify(&username, &api_key).await {
            Ok(v) => v,
            Err(e) => {
                error!("❌ 校验 Bot {} 的凭据时出错: {}", username, e);
                Verification::InvalidSecret
            }
        };
        if let Some(code) = verification.rejection() {
            warn!("🚫 Bot 认证失败: {} ({})", username, code);
            return self.reject(id, code).await;
        }

        let display_name = request
            .bot_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| username.clone());
        self.registry
            .send_to(
                id,
                ServerMessage::Welcome {
                    message: format!("Welcome, {}!", display_name),
                    authenticated: Some(true),
                },
            )
            .await;

        self.assign(
            id,
            Role::Bot(BotIdentity {
                username,
                display_name,
            }),
        )
        .await
    }

    async fn assign(&self, id: &str, role: Role) -> IdentifyOutcome {
        let client_type = role.client_type();
        match self.registry.set_role(id, role).await {
            Ok(()) => IdentifyOutcome::Identified(client_type),
            Err(RegistryError::RoleAlreadySet(..)) => {
                self.reject_reidentify(id).await;
                IdentifyOutcome::Unidentified
            }
            Err(RegistryError::NotFound(_)) => {
                info!("连接在识别完成前已断开: {}", id);
                IdentifyOutcome::Rejected
            }
        }
    }

    async fn reject(&self, id: &str, code: AuthErrorCode) -> IdentifyOutcome {
        self.metrics.auth_rejections.with_label_values(&[code.as_str()]).inc();
        self.reply_error(id, code).await;
        if code.closes_connection() {
            IdentifyOutcome::Rejected
        } else {
            IdentifyOutcome::Unidentified
        }
    }

    async fn reply_error(&self, id: &str, code: AuthErrorCode) {
        self.registry.send_to(id, ServerMessage::auth_error(code)).await;
    }
}
