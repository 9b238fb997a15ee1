/// Bot Commander - 公共库
///
/// 提供 Server 与 Bot / 控制面板共享的协议类型、错误处理、工具函数等

pub mod errors;
pub mod protocol;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use protocol::{AuthErrorCode, ClientMessage, ClientType, ProtocolError, ServerMessage};
