/// 控制面板 REST 接口
///
/// 所有路由都需要 JWT 认证，只提供只读查询

pub mod bot_data;
pub mod bots;

use axum::{http::StatusCode, middleware::from_fn_with_state, Json, Router};
use serde::Serialize;

use crate::{app_state::AppState, auth::require_panel_token};

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// 接口错误类型
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

/// 所有 API 路由（统一入口）
pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(bots::routes())
        .nest("/bot-data", bot_data::routes())
        .route_layer(from_fn_with_state(state, require_panel_token))
}
