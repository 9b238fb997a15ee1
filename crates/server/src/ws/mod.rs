/// WebSocket 模块
///
/// 管理 Bot 与控制面板的 WebSocket 连接：身份识别、消息路由和在线列表推送

pub mod handler;
pub mod identity;
pub mod registry;
pub mod router;

pub use handler::{handle_websocket, upgrade};
pub use identity::IdentityService;
pub use registry::ConnectionRegistry;
pub use router::MessageRouter;
