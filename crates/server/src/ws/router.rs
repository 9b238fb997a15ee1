/// 消息路由
///
/// 按 (消息类型, 发送方角色) 分发已识别连接的消息。
/// 路由只通过注册表提供的发送接口访问其他连接。

use chrono::Utc;
use common::protocol::{
    ClientMessage, ClientType, CommandRequest, GenericMessage, ServerMessage,
    SystemCommandResponse, TelemetryRecord, TerminalCommand, TerminalFrame,
};
use common::utils::{generate_request_id, is_valid_bot_name};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{ConnectionRegistry, Outbound};
use crate::metrics::Metrics;
use crate::telemetry::TelemetryBuffer;

const COMMAND_ORIGIN: &str = "panel";
const BOT_UNAVAILABLE: &str = "bot not found or not available";
const TELEMETRY_STORED: &str = "Information received and stored";
const TELEMETRY_REJECTED: &str = "Bot name cannot be used for data storage";

#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    telemetry: TelemetryBuffer,
    metrics: Arc<Metrics>,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry, telemetry: TelemetryBuffer, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            telemetry,
            metrics,
        }
    }

    /// 分发一条来自已识别连接的消息
    pub async fn dispatch(&self, sender_id: &str, role: ClientType, message: ClientMessage) {
        match (message, role) {
            (ClientMessage::Heartbeat, ClientType::Bot) => {
                self.registry.touch(sender_id).await;
                self.registry.send_to(sender_id, ServerMessage::HeartbeatAck).await;
            }
            (ClientMessage::Command(request), ClientType::Panel) => {
                self.forward_command(sender_id, request).await;
            }
            (ClientMessage::SystemCommand(request), ClientType::Panel) => {
                self.forward_system_command(sender_id, request).await;
            }
            (ClientMessage::SystemCommandResponse(response), ClientType::Bot) => {
                self.registry.touch(sender_id).await;
                self.fan_out_command_response(sender_id, response).await;
            }
            (ClientMessage::GenericMessage(generic), ClientType::Bot) => {
                self.registry.touch(sender_id).await;
                self.store_telemetry(sender_id, generic).await;
            }
            (ClientMessage::Terminal(frame), ClientType::Panel) => {
                self.forward_terminal(sender_id, frame).await;
            }
            (ClientMessage::Terminal(frame), ClientType::Bot) => {
                self.registry.touch(sender_id).await;
                let count = self
                    .registry
                    .broadcast_to_panels(Outbound::Relay(frame.into_value()))
                    .await;
                debug!("终端消息已从 {} 转发到 {} 个控制面板", sender_id, count);
            }
            (message, role) => {
                debug!(
                    "忽略消息: type={}, 发送方={} ({})",
                    message.kind(),
                    sender_id,
                    role.as_str()
                );
            }
        }
    }

    async fn forward_command(&self, sender_id: &str, request: CommandRequest) {
        let message = ServerMessage::Command {
            command: request.command,
            from: COMMAND_ORIGIN.to_string(),
        };
        if self.registry.send_to_bot(&request.target_bot, message).await {
            info!("命令已从 {} 转发到 Bot {}", sender_id, request.target_bot);
        } else {
            warn!("命令目标不可用，已丢弃: {}", request.target_bot);
        }
    }

    async fn forward_system_command(&self, sender_id: &str, request: CommandRequest) {
        let message = ServerMessage::SystemCommand {
            command: request.command,
            from: COMMAND_ORIGIN.to_string(),
            request_id: generate_request_id("cmd"),
        };
        if self.registry.send_to_bot(&request.target_bot, message).await {
            info!("系统命令已从 {} 转发到 Bot {}", sender_id, request.target_bot);
            return;
        }

        warn!("系统命令目标不可用: {}", request.target_bot);
        let reply = ServerMessage::CommandResponse {
            success: Some(false),
            output: None,
            error: Some(Value::from(BOT_UNAVAILABLE)),
            command: None,
            bot_id: None,
            request_id: None,
        };
        self.registry.send_to(sender_id, reply).await;
    }

    async fn fan_out_command_response(&self, bot_id: &str, response: SystemCommandResponse) {
        let message = ServerMessage::CommandResponse {
            success: response.success,
            output: response.output,
            error: response.error,
            command: response.command,
            bot_id: Some(bot_id.to_string()),
            request_id: response.request_id,
        };
        let count = self.registry.broadcast_to_panels(message).await;
        debug!("命令结果已从 {} 转发到 {} 个控制面板", bot_id, count);
    }

    async fn store_telemetry(&self, sender_id: &str, generic: GenericMessage) {
        let Some(payload) = generic.payload.filter(|p| !p.is_null()) else {
            warn!("generic_message 缺少 payload，已丢弃: {}", sender_id);
            return;
        };
        let Some(bot_name) = self.registry.bot_username(sender_id).await else {
            return;
        };
        let ack_id = generic.request_id.filter(|_| generic.expect_response);

        // 名称无法用作文件名的 Bot 数据永远无法落盘，不进入缓冲区
        if !is_valid_bot_name(&bot_name) {
            warn!("⚠️ Bot 名称 {} 不能用于存储，已丢弃遥测数据", bot_name);
            if let Some(request_id) = ack_id {
                let ack = ServerMessage::GenericMessageResponse {
                    request_id,
                    success: false,
                    message: TELEMETRY_REJECTED.to_string(),
                };
                self.registry.send_to(sender_id, ack).await;
            }
            return;
        }

        let category = generic.category.unwrap_or_else(|| "general".to_string());
        info!("📊 收到 {} 的遥测数据: {}", bot_name, category);

        self.telemetry
            .append(TelemetryRecord {
                bot_name,
                timestamp: Utc::now(),
                category,
                priority: generic.priority.unwrap_or_else(|| "normal".to_string()),
                payload,
                metadata: generic.metadata.unwrap_or_else(|| Value::Object(Default::default())),
            })
            .await;
        self.metrics.telemetry_received.inc();

        if let Some(request_id) = ack_id {
            let ack = ServerMessage::GenericMessageResponse {
                request_id,
                success: true,
                message: TELEMETRY_STORED.to_string(),
            };
            self.registry.send_to(sender_id, ack).await;
        }
    }

    async fn forward_terminal(&self, sender_id: &str, frame: TerminalFrame) {
        let Some(command) = frame.command() else {
            debug!("控制面板发送了未知终端消息: {}", frame.kind);
            return;
        };
        let Some(target) = frame.target_bot().map(str::to_string) else {
            warn!("终端消息缺少 targetBot，已丢弃: {}", frame.kind);
            return;
        };

        let kind = frame.kind.clone();
        let request_id = frame.request_id().cloned();
        let bot_frame = frame.into_bot_frame();

        if self.registry.send_to_bot(&target, Outbound::Relay(bot_frame)).await {
            debug!("终端消息 {} 已从 {} 转发到 Bot {}", kind, sender_id, target);
            return;
        }

        warn!("终端消息目标不可用: {} ({})", target, kind);
        if command == TerminalCommand::Start {
            let reply = ServerMessage::PtyError {
                request_id,
                error: BOT_UNAVAILABLE.to_string(),
            };
            self.registry.send_to(sender_id, reply).await;
        }
    }
}
