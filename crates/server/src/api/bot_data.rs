/// 遥测数据查询接口（只读取已落盘的数据）

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use common::utils::parse_date;
use common::Error;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use super::{api_error, ApiError};
use crate::{app_state::AppState, telemetry::DataFileInfo};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bots", get(list_bots))
        .route("/:bot_name/files", get(list_files))
        .route("/:bot_name/date/:date", get(get_by_date))
}

#[derive(Debug, Serialize)]
pub struct BotNamesResponse {
    pub bots: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotFilesResponse {
    pub bot_name: String,
    pub files: Vec<DataFileInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotDataResponse {
    pub bot_name: String,
    pub date: String,
    pub data: Vec<Value>,
    pub total: usize,
}

fn storage_error(e: Error) -> ApiError {
    match e {
        Error::InvalidArgument(message) => api_error(StatusCode::BAD_REQUEST, message),
        e => {
            error!("读取遥测数据失败: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

/// 有数据文件的全部 Bot
pub async fn list_bots(State(state): State<AppState>) -> Result<Json<BotNamesResponse>, ApiError> {
    let bots = state.store.list_bots().await.map_err(storage_error)?;
    Ok(Json(BotNamesResponse {
        total: bots.len(),
        bots,
    }))
}

/// 某个 Bot 的数据文件列表
pub async fn list_files(
    State(state): State<AppState>,
    Path(bot_name): Path<String>,
) -> Result<Json<BotFilesResponse>, ApiError> {
    let files = state.store.list_files(&bot_name).await.map_err(storage_error)?;
    Ok(Json(BotFilesResponse {
        bot_name,
        total: files.len(),
        files,
    }))
}

/// 某个 Bot 某天的全部记录
pub async fn get_by_date(
    State(state): State<AppState>,
    Path((bot_name, date)): Path<(String, String)>,
) -> Result<Json<BotDataResponse>, ApiError> {
    let Some(day) = parse_date(&date) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid date format, use YYYY-MM-DD",
        ));
    };

    let data = state.store.load(&bot_name, day).await.map_err(storage_error)?;
    Ok(Json(BotDataResponse {
        bot_name,
        date,
        total: data.len(),
        data,
    }))
}
