/// 认证模块
///
/// - Bot：WebSocket 身份识别时校验 API key
/// - 控制面板：REST 接口校验 JWT（令牌由外部登录服务签发）

pub mod credentials;
pub mod jwt;

pub use credentials::{CredentialVerifier, FileCredentialVerifier, Verification};
pub use jwt::{require_panel_token, Claims};
