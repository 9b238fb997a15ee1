/// WebSocket 消息定义

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ProtocolError;
use super::types::{ClientType, RosterSnapshot};
use crate::utils::generate_request_id;

/// 终端相关消息的 type 前缀
pub const TERMINAL_PREFIX: &str = "pty_";

// ============================================================================
// 入站消息（客户端 -> Server）
// ============================================================================

/// identify 消息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    pub client_type: Option<String>,
    pub username: Option<String>,
    pub api_key: Option<String>,
    pub bot_name: Option<String>,
}

impl IdentifyRequest {
    /// 解析声明的客户端类型，未知类型返回 None
    pub fn client_type(&self) -> Option<ClientType> {
        self.client_type.as_deref().and_then(ClientType::parse)
    }
}

/// command / system_command 消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub target_bot: String,
    #[serde(default)]
    pub command: Value,
}

/// Bot 返回的 system_command_response 消息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemCommandResponse {
    pub success: Option<bool>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub command: Option<Value>,
    pub request_id: Option<Value>,
}

/// Bot 上报的 generic_message 消息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenericMessage {
    pub payload: Option<Value>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub expect_response: bool,
    pub request_id: Option<Value>,
}

/// 控制面板可以发往 Bot 的终端指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCommand {
    Start,
    Input,
    Resize,
    Kill,
    List,
}

impl TerminalCommand {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "pty_start" => Some(Self::Start),
            "pty_input" => Some(Self::Input),
            "pty_resize" => Some(Self::Resize),
            "pty_kill" => Some(Self::Kill),
            "pty_list" => Some(Self::List),
            _ => None,
        }
    }
}

/// 终端消息，Server 不解析其内容，只按原样转发
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalFrame {
    pub kind: String,
    pub body: Map<String, Value>,
}

impl TerminalFrame {
    /// 控制面板指令类型，Bot 侧的输出类消息返回 None
    pub fn command(&self) -> Option<TerminalCommand> {
        TerminalCommand::parse(&self.kind)
    }

    pub fn target_bot(&self) -> Option<&str> {
        self.body.get("targetBot").and_then(Value::as_str)
    }

    pub fn request_id(&self) -> Option<&Value> {
        self.body.get("requestId").filter(|v| !v.is_null())
    }

    /// 转换为发往 Bot 的消息：去掉 targetBot，并补全协议要求的默认字段
    pub fn into_bot_frame(mut self) -> Value {
        self.body.remove("targetBot");
        match self.command() {
            Some(TerminalCommand::Start) => {
                set_default(&mut self.body, "requestId", || {
                    Value::from(generate_request_id("pty"))
                });
                set_default(&mut self.body, "interactive", || Value::Bool(false));
                set_default(&mut self.body, "cols", || Value::from(80));
                set_default(&mut self.body, "rows", || Value::from(24));
                self.body.insert("from".into(), Value::from("panel"));
            }
            Some(TerminalCommand::Kill) => {
                set_default(&mut self.body, "signal", || Value::from("SIGTERM"));
            }
            Some(TerminalCommand::List) => {
                set_default(&mut self.body, "requestId", || {
                    Value::from(format!("list_{}", Utc::now().timestamp_millis()))
                });
            }
            Some(TerminalCommand::Input) | Some(TerminalCommand::Resize) | None => {}
        }
        Value::Object(self.body)
    }

    /// 原样转换为 JSON
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

fn set_default(body: &mut Map<String, Value>, key: &str, value: impl FnOnce() -> Value) {
    if body.get(key).map_or(true, Value::is_null) {
        body.insert(key.to_string(), value());
    }
}

/// 客户端发来的消息
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Identify(IdentifyRequest),
    Heartbeat,
    Command(CommandRequest),
    SystemCommand(CommandRequest),
    SystemCommandResponse(SystemCommandResponse),
    GenericMessage(GenericMessage),
    Terminal(TerminalFrame),
    Unknown(String),
}

impl ClientMessage {
    /// 从 JSON 文本解析
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        Self::from_value(value)
    }

    /// 从二进制帧解析（按 UTF-8 JSON 处理）
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::from_json(text)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(body) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        let message = match kind.as_str() {
            "identify" => Self::Identify(decode(&kind, body)?),
            "heartbeat" => Self::Heartbeat,
            "command" => Self::Command(decode(&kind, body)?),
            "system_command" => Self::SystemCommand(decode(&kind, body)?),
            "system_command_response" => Self::SystemCommandResponse(decode(&kind, body)?),
            "generic_message" => Self::GenericMessage(decode(&kind, body)?),
            k if k.starts_with(TERMINAL_PREFIX) => Self::Terminal(TerminalFrame {
                kind: kind.clone(),
                body,
            }),
            _ => Self::Unknown(kind.clone()),
        };
        Ok(message)
    }

    /// 消息类型字符串
    pub fn kind(&self) -> &str {
        match self {
            Self::Identify(_) => "identify",
            Self::Heartbeat => "heartbeat",
            Self::Command(_) => "command",
            Self::SystemCommand(_) => "system_command",
            Self::SystemCommandResponse(_) => "system_command_response",
            Self::GenericMessage(_) => "generic_message",
            Self::Terminal(frame) => &frame.kind,
            Self::Unknown(kind) => kind,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &str, body: Map<String, Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(body)).map_err(|source| ProtocolError::InvalidFields {
        kind: kind.to_string(),
        source,
    })
}

// ============================================================================
// 出站消息（Server -> 客户端）
// ============================================================================

/// Server 发出的消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// 连接建立后要求客户端表明身份
    IdentifyRequest { message: String, client_id: String },
    /// 身份识别成功
    Welcome {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authenticated: Option<bool>,
    },
    /// 错误
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
    /// 心跳响应
    HeartbeatAck,
    /// 转发给 Bot 的命令
    Command {
        #[serde(default)]
        command: Value,
        from: String,
    },
    /// 转发给 Bot 的系统命令
    SystemCommand {
        #[serde(default)]
        command: Value,
        from: String,
        request_id: String,
    },
    /// 系统命令结果（或路由失败）
    CommandResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bot_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    /// generic_message 的确认
    GenericMessageResponse {
        request_id: Value,
        success: bool,
        message: String,
    },
    /// 终端请求无法送达
    PtyError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        error: String,
    },
    /// 连接列表更新
    ClientsUpdate(RosterSnapshot),
}

impl ServerMessage {
    /// 带错误码的错误消息
    pub fn auth_error(code: super::AuthErrorCode) -> Self {
        Self::Error {
            code: Some(code.as_str().to_string()),
            message: code.default_message().to_string(),
        }
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
