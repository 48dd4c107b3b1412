//! 资源 CRUD 处理器
//!
//! 四种资源共用一套泛型处理器，命名空间资源与集群级资源只在路由上区分。
//! 请求体以原始字节读取后再解析，便于把格式错误统一映射为 400。

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::middleware::AppState;
use crate::models::{
    object_key, Cluster, MultiClusterRoleBinding, Policy, Role, API_VERSION, GROUP_NAME,
};
use crate::registry::{Admission, DeleteOptions, DeleteOutcome, Registry};
use crate::repository::ListOptions;

/// 可以通过 HTTP 访问的资源
pub trait ServedResource: Admission {
    fn registry(state: &AppState) -> &Registry<Self>;
}

impl ServedResource for Policy {
    fn registry(state: &AppState) -> &Registry<Self> {
        &state.policies
    }
}

impl ServedResource for Role {
    fn registry(state: &AppState) -> &Registry<Self> {
        &state.roles
    }
}

impl ServedResource for MultiClusterRoleBinding {
    fn registry(state: &AppState) -> &Registry<Self> {
        &state.bindings
    }
}

impl ServedResource for Cluster {
    fn registry(state: &AppState) -> &Registry<Self> {
        &state.clusters
    }
}

/// 单个对象的路径参数，集群级资源没有 namespace
#[derive(Debug, Deserialize)]
pub struct ObjectPath {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectPath {
    fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// 形如 `k1=v1,k2=v2`，全部相等才匹配
    pub label_selector: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList<T> {
    pub kind: String,
    pub api_version: String,
    pub revision: u64,
    pub items: Vec<T>,
}

/// 单个对象的响应，补上 kind 和 apiVersion
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResponse<T> {
    pub kind: &'static str,
    pub api_version: String,
    #[serde(flatten)]
    pub object: T,
}

fn api_version() -> String {
    format!("{}/{}", GROUP_NAME, API_VERSION)
}

fn wrap<T: ServedResource>(object: T) -> Json<ObjectResponse<T>> {
    Json(ObjectResponse {
        kind: T::KIND,
        api_version: api_version(),
        object,
    })
}

/// 解析标签选择器
pub fn parse_label_selector(selector: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| !k.is_empty())
            .ok_or_else(|| {
                AppError::BadRequest(format!("invalid label selector term \"{}\"", term))
            })?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

/// 解析请求体并对齐路径中的 namespace / name
fn decode_object<T: ServedResource>(body: &Bytes, namespace: &str, name: Option<&str>) -> Result<T> {
    let mut obj: T = serde_json::from_slice(body)?;
    let meta = obj.meta_mut();

    if T::NAMESPACED {
        if meta.namespace.is_empty() {
            meta.namespace = namespace.to_string();
        } else if meta.namespace != namespace {
            return Err(AppError::BadRequest(format!(
                "the namespace of the provided object ({}) does not match the namespace sent on the request ({})",
                meta.namespace, namespace
            )));
        }
    }

    if let Some(name) = name {
        if meta.name.is_empty() {
            meta.name = name.to_string();
        } else if meta.name != name {
            return Err(AppError::BadRequest(format!(
                "the name of the object ({}) does not match the name on the URL ({})",
                meta.name, name
            )));
        }
    }
    Ok(obj)
}

async fn list_in<T: ServedResource>(
    state: &AppState,
    namespace: Option<String>,
    query: ListQuery,
) -> Result<Json<ResourceList<T>>> {
    let mut options = ListOptions {
        namespace,
        ..ListOptions::all()
    };
    if let Some(selector) = query.label_selector.as_deref() {
        options.label_selector = parse_label_selector(selector)?;
    }

    let result = T::registry(state).list(&options).await;
    Ok(Json(ResourceList {
        kind: format!("{}List", T::KIND),
        api_version: api_version(),
        revision: result.revision,
        items: result.items,
    }))
}

/// 列出命名空间内的资源
pub async fn list_namespaced<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    list_in::<T>(&state, Some(namespace), query).await
}

/// 列出集群级资源
pub async fn list_cluster_scoped<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    list_in::<T>(&state, None, query).await
}

pub async fn create_namespaced<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let obj: T = decode_object(&body, &namespace, None)?;
    let created = T::registry(&state).create(obj).await?;
    Ok((StatusCode::CREATED, wrap(created)))
}

pub async fn create_cluster_scoped<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let obj: T = decode_object(&body, "", None)?;
    let created = T::registry(&state).create(obj).await?;
    Ok((StatusCode::CREATED, wrap(created)))
}

pub async fn get_object<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ObjectPath>,
) -> Result<impl IntoResponse> {
    let obj = T::registry(&state).get(&path.key()).await?;
    Ok(wrap(obj))
}

pub async fn update_object<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ObjectPath>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let obj: T = decode_object(&body, &path.namespace, Some(&path.name))?;
    let updated = T::registry(&state).update(obj).await?;
    Ok(wrap(updated))
}

/// 删除资源
///
/// 进入 Terminating 返回 202，物理删除返回 200。请求体可省略。
pub async fn delete_object<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ObjectPath>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let options: DeleteOptions = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteOptions::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let outcome = T::registry(&state).delete(&path.key(), options).await?;
    let status = match outcome {
        DeleteOutcome::Terminating(_) => StatusCode::ACCEPTED,
        DeleteOutcome::Deleted(_) => StatusCode::OK,
    };
    Ok((status, wrap(outcome.into_object())))
}

/// finalize 子资源：以请求体中的领域终结器替换现有列表
pub async fn finalize_object<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ObjectPath>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let obj: T = decode_object(&body, &path.namespace, Some(&path.name))?;
    let uid = Some(obj.meta().uid.as_str()).filter(|uid| !uid.is_empty());
    let finalized = T::registry(&state)
        .finalize(&path.key(), obj.finalizers().to_vec(), uid)
        .await?;
    Ok(wrap(finalized))
}

/// status 子资源
pub async fn update_status<T: ServedResource>(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ObjectPath>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let obj: T = decode_object(&body, &path.namespace, Some(&path.name))?;
    let updated = T::registry(&state).update_status(obj).await?;
    Ok(wrap(updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_selector() {
        let labels = parse_label_selector("a=1, b = 2").unwrap();
        assert_eq!(labels.get("a").map(String::as_str), Some("1"));
        assert_eq!(labels.get("b").map(String::as_str), Some("2"));
        assert!(parse_label_selector("").unwrap().is_empty());
        assert!(parse_label_selector("novalue").is_err());
        assert!(parse_label_selector("=x").is_err());
    }

    #[test]
    fn test_decode_object_rejects_namespace_mismatch() {
        let body = Bytes::from_static(br#"{"metadata":{"namespace":"other","name":"p1"},"spec":{}}"#);
        let err = decode_object::<Policy>(&body, "tenant-a", None).unwrap_err();
        assert_eq!(err.code(), 400);

        let body = Bytes::from_static(br#"{"metadata":{"name":"p1"},"spec":{}}"#);
        let policy = decode_object::<Policy>(&body, "tenant-a", Some("p1")).unwrap();
        assert_eq!(policy.metadata.key(), "tenant-a/p1");

        let err = decode_object::<Policy>(&body, "tenant-a", Some("p2")).unwrap_err();
        assert_eq!(err.code(), 400);
    }
}
