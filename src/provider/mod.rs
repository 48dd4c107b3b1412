//! 跨集群下发 Provider 抽象
//!
//! 每个部署可以注册多个 Provider，对象通过 `provider-name` 注解选择；
//! 空名称的默认 Provider 总是存在，所有操作都是安全的空操作。

pub mod default;
pub mod platform;
pub mod registry;

pub use default::{DelegateProvider, DEFAULT_PROVIDER_NAME};
pub use platform::*;
pub use registry::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::models::{MultiClusterRoleBinding, PolicyRule, ALL_CLUSTERS, ANNOTATION_LAST_DISPATCHED_CLUSTERS};

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Provider 错误
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("cluster {cluster}: {message}")]
    Cluster { cluster: String, message: String },

    /// 多个集群失败时聚合为一个错误，整个键重试
    #[error("{} cluster operation(s) failed: {}", .failures.len(), join_failures(.failures))]
    Aggregate { failures: Vec<ProviderError> },

    #[error("cluster directory error: {0}")]
    Directory(String),

    #[error("provider {0:?} already registered")]
    AlreadyRegistered(String),
}

fn join_failures(failures: &[ProviderError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ProviderError {
    pub fn cluster(cluster: &str, message: impl Into<String>) -> Self {
        ProviderError::Cluster {
            cluster: cluster.to_string(),
            message: message.into(),
        }
    }

    /// 没有失败返回 Ok
    pub fn aggregate(failures: Vec<ProviderError>) -> Result<(), ProviderError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::Aggregate { failures })
        }
    }

    /// 失败的集群名称
    pub fn failed_clusters(&self) -> Vec<String> {
        match self {
            ProviderError::Cluster { cluster, .. } => vec![cluster.clone()],
            ProviderError::Aggregate { failures } => {
                failures.iter().flat_map(|f| f.failed_clusters()).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectKind {
    User,
    Group,
}

/// 成员集群内的 RBAC 主体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
    pub api_group: String,
}

impl Subject {
    pub fn user(name: &str) -> Self {
        Self {
            kind: SubjectKind::User,
            name: name.to_string(),
            api_group: RBAC_API_GROUP.to_string(),
        }
    }
}

/// 跨集群下发策略
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// 对象注解是否归本 Provider 处理
    fn on_filter(&self, annotations: &BTreeMap<String, String>) -> bool;

    /// 租户可下发的集群（排除 Initializing / Terminating 和 global）
    async fn get_tenant_clusters(&self, tenant_id: &str) -> Result<Vec<String>, ProviderError>;

    async fn get_subject(&self, username: &str, cluster: &str) -> Result<Subject, ProviderError>;

    /// 幂等
    async fn dispatch_multi_cluster_role_binding(
        &self,
        binding: &MultiClusterRoleBinding,
        rules: &[PolicyRule],
        subjects: &BTreeMap<String, Subject>,
    ) -> Result<(), ProviderError>;

    async fn delete_unbinding_resources(
        &self,
        binding: &MultiClusterRoleBinding,
        removed_clusters: &[String],
    ) -> Result<(), ProviderError>;

    async fn delete_multi_cluster_role_binding_resources(
        &self,
        binding: &MultiClusterRoleBinding,
    ) -> Result<(), ProviderError>;
}

/// 读取 last-dispatched-clusters 注解
pub fn last_dispatched_clusters(binding: &MultiClusterRoleBinding) -> Option<Vec<String>> {
    binding
        .metadata
        .annotation(ANNOTATION_LAST_DISPATCHED_CLUSTERS)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
}

/// spec 中显式列出的集群（去掉通配符）
pub fn explicit_clusters(binding: &MultiClusterRoleBinding) -> Vec<String> {
    binding
        .spec
        .clusters
        .iter()
        .filter(|c| c.as_str() != ALL_CLUSTERS)
        .cloned()
        .collect()
}

/// 拆除范围：快照与 spec 中显式集群的并集
///
/// 控制器在调用 Provider 下发前先写入快照，因此快照覆盖了所有可能持有资源的集群；
/// 从未写过快照的通配绑定没有任何集群持有资源。
pub fn teardown_clusters(binding: &MultiClusterRoleBinding) -> Vec<String> {
    let mut clusters: BTreeSet<String> = last_dispatched_clusters(binding)
        .unwrap_or_default()
        .into_iter()
        .collect();
    clusters.extend(explicit_clusters(binding));
    clusters.into_iter().collect()
}
