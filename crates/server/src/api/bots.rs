/// 在线连接查询接口

use axum::{extract::State, routing::get, Extension, Json, Router};
use common::protocol::{BotSummary, PanelSummary};
use serde::Serialize;

use crate::{app_state::AppState, auth::Claims};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/verify-token", get(verify_token))
        .route("/bots", get(list_bots))
}

#[derive(Debug, Serialize)]
pub struct VerifyTokenResponse {
    pub valid: bool,
    pub username: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub total_bots: usize,
    pub total_panels: usize,
    /// 包括尚未识别身份的连接
    pub total_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct BotListResponse {
    pub bots: Vec<BotSummary>,
    pub panels: Vec<PanelSummary>,
    pub stats: ClientStats,
}

/// 校验令牌
pub async fn verify_token(Extension(claims): Extension<Claims>) -> Json<VerifyTokenResponse> {
    Json(VerifyTokenResponse {
        valid: true,
        username: claims.username,
    })
}

/// 当前在线的 Bot 和控制面板
pub async fn list_bots(State(state): State<AppState>) -> Json<BotListResponse> {
    let snapshot = state.registry.snapshot().await;
    let total_clients = state.registry.connection_count().await;

    Json(BotListResponse {
        stats: ClientStats {
            total_bots: snapshot.stats.total_bots,
            total_panels: snapshot.stats.total_panels,
            total_clients,
        },
        bots: snapshot.bots,
        panels: snapshot.panels,
    })
}
