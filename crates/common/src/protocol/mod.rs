/// WebSocket 消息协议
///
/// Bot、控制面板与 Server 之间传输的 JSON 文本帧，每条消息都带有 `type` 字段

pub mod error;
pub mod message;
pub mod types;

pub use error::{AuthErrorCode, ProtocolError};
pub use message::{
    ClientMessage, CommandRequest, GenericMessage, IdentifyRequest, ServerMessage,
    SystemCommandResponse, TerminalCommand, TerminalFrame,
};
pub use types::*;
