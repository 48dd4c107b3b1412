//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::handlers::{health, resources::*};
use crate::middleware::AppState;
use crate::models::{Cluster, MultiClusterRoleBinding, Policy, Role};

/// 请求体上限
const MAX_BODY_BYTES: usize = 1024 * 1024;

const API_PREFIX: &str = "/apis/authz.tkestack.io/v1";

/// 命名空间资源的集合与对象路由
fn namespaced<T: ServedResource>(plural: &str) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            &format!("{}/namespaces/{{namespace}}/{}", API_PREFIX, plural),
            get(list_namespaced::<T>).post(create_namespaced::<T>),
        )
        .route(
            &format!("{}/namespaces/{{namespace}}/{}/{{name}}", API_PREFIX, plural),
            get(get_object::<T>)
                .put(update_object::<T>)
                .delete(delete_object::<T>),
        )
}

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check));

    let binding_object = format!(
        "{}/namespaces/{{namespace}}/multiclusterrolebindings/{{name}}",
        API_PREFIX
    );
    let api_routes = Router::new()
        .merge(namespaced::<Policy>("policies"))
        .merge(namespaced::<Role>("roles"))
        .route(
            &format!("{}/namespaces/{{namespace}}/roles/{{name}}/finalize", API_PREFIX),
            put(finalize_object::<Role>),
        )
        .merge(namespaced::<MultiClusterRoleBinding>("multiclusterrolebindings"))
        .route(
            &format!("{}/status", binding_object),
            put(update_status::<MultiClusterRoleBinding>),
        )
        .route(
            &format!("{}/finalize", binding_object),
            put(finalize_object::<MultiClusterRoleBinding>),
        )
        // 集群级资源
        .route(
            &format!("{}/clusters", API_PREFIX),
            get(list_cluster_scoped::<Cluster>).post(create_cluster_scoped::<Cluster>),
        )
        .route(
            &format!("{}/clusters/{{name}}", API_PREFIX),
            get(get_object::<Cluster>)
                .put(update_object::<Cluster>)
                .delete(delete_object::<Cluster>),
        )
        .route(
            &format!("{}/clusters/{{name}}/status", API_PREFIX),
            put(update_status::<Cluster>),
        )
        .route(
            &format!("{}/clusters/{{name}}/finalize", API_PREFIX),
            put(finalize_object::<Cluster>),
        );

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
