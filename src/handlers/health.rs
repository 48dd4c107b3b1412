//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, http::StatusCode, Json};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::middleware::AppState;

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
}

static START_TIME: OnceCell<Instant> = OnceCell::new();

/// 记录启动时间，重复调用无效
pub fn set_start_time() {
    let _ = START_TIME.set(Instant::now());
}

pub fn get_uptime() -> u64 {
    START_TIME.get().map_or(0, |start| start.elapsed().as_secs())
}

/// 存活探针，不检查依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime(),
    })
}

/// 就绪探针：所有控制器的 informer 都已同步
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let checks: Vec<HealthCheck> = state
        .readiness
        .iter()
        .map(|(name, synced)| HealthCheck {
            name: name.to_string(),
            status: if *synced.borrow() { "synced" } else { "pending" }.to_string(),
        })
        .collect();
    let ready = checks.iter().all(|c| c.status == "synced");

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, checks }))
}
