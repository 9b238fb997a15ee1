/// 控制面板 JWT 校验中间件

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{api::ErrorResponse, app_state::AppState};

/// 令牌声明（与登录服务签发的格式一致）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// 校验令牌并返回声明
pub fn verify_token(secret: &str, token: &str) -> jsonwebtoken::errors::Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

fn reject(status: StatusCode, message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse::new(message)))
}

/// 要求请求携带 `Authorization: Bearer <token>`
pub async fn require_panel_token(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let Some(secret) = state.config.jwt_secret() else {
        warn!("未配置 JWT_SECRET，拒绝 REST 请求");
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "authentication is not configured",
        ));
    };

    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_whitespace().nth(1));

    let Some(token) = token else {
        return Err(reject(StatusCode::UNAUTHORIZED, "access token required"));
    };

    let claims = verify_token(secret, token).map_err(|e| {
        debug!("令牌校验失败: {}", e);
        reject(StatusCode::FORBIDDEN, "invalid token")
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &str, username: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        username: username.to_string(),
        exp: now + ttl_secs,
        iat: Some(now),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
