//! 平台 Provider
//!
//! 通过 ClusterDirectory 发现租户集群，通过 MemberClusterClient 在每个成员集群中
//! 维护一个 ClusterRole 和一个 ClusterRoleBinding（以绑定对象命名）。
//! 各集群并发执行，单个集群失败不影响其它集群，最后聚合成一个错误。

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{teardown_clusters, Provider, ProviderError, Subject};
use crate::models::{
    Cluster, MultiClusterRoleBinding, PolicyRule, ANNOTATION_REGION, LABEL_ROLE_NAME,
    LABEL_ROLE_NAMESPACE, LABEL_USERNAME,
};
use crate::repository::{ListOptions, MemoryStore};

pub const PLATFORM_PROVIDER_NAME: &str = "platform";

// ==================== 成员集群对象 ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRole {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBinding {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub role_ref: String,
    pub subjects: Vec<Subject>,
}

/// 成员集群中 RBAC 对象的名称
pub fn member_object_name(binding: &MultiClusterRoleBinding) -> String {
    format!(
        "authz:{}:{}",
        binding.metadata.namespace, binding.metadata.name
    )
}

// ==================== 协作者接口 ====================

/// 租户集群目录
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn list_tenant_clusters(&self, tenant_id: &str) -> Result<Vec<Cluster>, ProviderError>;
}

/// 成员集群 RBAC 客户端
#[async_trait]
pub trait MemberClusterClient: Send + Sync {
    async fn apply_cluster_role(&self, cluster: &str, role: ClusterRole) -> Result<(), ProviderError>;

    async fn apply_cluster_role_binding(
        &self,
        cluster: &str,
        binding: ClusterRoleBinding,
    ) -> Result<(), ProviderError>;

    /// 对象不存在视为成功
    async fn delete_cluster_role(&self, cluster: &str, name: &str) -> Result<(), ProviderError>;

    async fn delete_cluster_role_binding(&self, cluster: &str, name: &str) -> Result<(), ProviderError>;
}

/// 以 Cluster 存储为数据源的集群目录
pub struct StoreClusterDirectory {
    clusters: Arc<MemoryStore<Cluster>>,
}

impl StoreClusterDirectory {
    pub fn new(clusters: Arc<MemoryStore<Cluster>>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl ClusterDirectory for StoreClusterDirectory {
    async fn list_tenant_clusters(&self, tenant_id: &str) -> Result<Vec<Cluster>, ProviderError> {
        let listed = self.clusters.list(&ListOptions::all()).await;
        Ok(listed
            .items
            .into_iter()
            .filter(|c| c.spec.tenant_id == tenant_id)
            .collect())
    }
}

#[derive(Debug, Default)]
struct MemberState {
    roles: BTreeMap<String, ClusterRole>,
    bindings: BTreeMap<String, ClusterRoleBinding>,
}

/// 进程内的成员集群模拟，支持注入不可达集群
#[derive(Default)]
pub struct InMemoryMemberClusters {
    members: DashMap<String, MemberState>,
    unreachable: DashSet<String>,
    writes: AtomicU64,
}

impl InMemoryMemberClusters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, cluster: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(cluster.to_string());
        } else {
            self.unreachable.remove(cluster);
        }
    }

    /// 实际发生变化的写入次数
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn cluster_role(&self, cluster: &str, name: &str) -> Option<ClusterRole> {
        self.members
            .get(cluster)
            .and_then(|m| m.roles.get(name).cloned())
    }

    pub fn cluster_role_binding(&self, cluster: &str, name: &str) -> Option<ClusterRoleBinding> {
        self.members
            .get(cluster)
            .and_then(|m| m.bindings.get(name).cloned())
    }

    /// 持有指定名称 ClusterRoleBinding 的集群
    pub fn clusters_with_binding(&self, name: &str) -> BTreeSet<String> {
        self.members
            .iter()
            .filter(|entry| entry.value().bindings.contains_key(name))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn check_reachable(&self, cluster: &str) -> Result<(), ProviderError> {
        if self.unreachable.contains(cluster) {
            Err(ProviderError::cluster(cluster, "cluster unreachable"))
        } else {
            Ok(())
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MemberClusterClient for InMemoryMemberClusters {
    async fn apply_cluster_role(&self, cluster: &str, role: ClusterRole) -> Result<(), ProviderError> {
        self.check_reachable(cluster)?;
        let mut member = self.members.entry(cluster.to_string()).or_default();
        if member.roles.get(&role.name) != Some(&role) {
            member.roles.insert(role.name.clone(), role);
            self.record_write();
        }
        Ok(())
    }

    async fn apply_cluster_role_binding(
        &self,
        cluster: &str,
        binding: ClusterRoleBinding,
    ) -> Result<(), ProviderError> {
        self.check_reachable(cluster)?;
        let mut member = self.members.entry(cluster.to_string()).or_default();
        if member.bindings.get(&binding.name) != Some(&binding) {
            member.bindings.insert(binding.name.clone(), binding);
            self.record_write();
        }
        Ok(())
    }

    async fn delete_cluster_role(&self, cluster: &str, name: &str) -> Result<(), ProviderError> {
        self.check_reachable(cluster)?;
        if let Some(mut member) = self.members.get_mut(cluster) {
            if member.roles.remove(name).is_some() {
                self.record_write();
            }
        }
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, cluster: &str, name: &str) -> Result<(), ProviderError> {
        self.check_reachable(cluster)?;
        if let Some(mut member) = self.members.get_mut(cluster) {
            if member.bindings.remove(name).is_some() {
                self.record_write();
            }
        }
        Ok(())
    }
}

// ==================== Provider ====================

pub struct PlatformProvider {
    directory: Arc<dyn ClusterDirectory>,
    members: Arc<dyn MemberClusterClient>,
    region: Option<String>,
}

impl PlatformProvider {
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        members: Arc<dyn MemberClusterClient>,
        region: Option<String>,
    ) -> Self {
        Self {
            directory,
            members,
            region,
        }
    }

    async fn dispatch_to_cluster(
        &self,
        cluster: &str,
        role: ClusterRole,
        subject: &Subject,
    ) -> Result<(), ProviderError> {
        let binding = ClusterRoleBinding {
            name: role.name.clone(),
            labels: role.labels.clone(),
            role_ref: role.name.clone(),
            subjects: vec![subject.clone()],
        };
        self.members.apply_cluster_role(cluster, role).await?;
        self.members.apply_cluster_role_binding(cluster, binding).await
    }

    async fn delete_from_cluster(&self, cluster: &str, name: &str) -> Result<(), ProviderError> {
        self.members.delete_cluster_role_binding(cluster, name).await?;
        self.members.delete_cluster_role(cluster, name).await
    }

    async fn delete_from_clusters(&self, name: &str, clusters: &[String]) -> Result<(), ProviderError> {
        let results = join_all(
            clusters
                .iter()
                .map(|cluster| self.delete_from_cluster(cluster, name)),
        )
        .await;
        ProviderError::aggregate(results.into_iter().filter_map(|r| r.err()).collect())
    }
}

fn member_labels(binding: &MultiClusterRoleBinding) -> BTreeMap<String, String> {
    [LABEL_ROLE_NAMESPACE, LABEL_ROLE_NAME, LABEL_USERNAME]
        .iter()
        .filter_map(|key| {
            binding
                .metadata
                .labels
                .get(*key)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}

#[async_trait]
impl Provider for PlatformProvider {
    fn name(&self) -> &str {
        PLATFORM_PROVIDER_NAME
    }

    /// 对象带 region 提示时必须与本实例的 region 一致
    fn on_filter(&self, annotations: &BTreeMap<String, String>) -> bool {
        match (&self.region, annotations.get(ANNOTATION_REGION)) {
            (Some(region), Some(hint)) => region == hint,
            _ => true,
        }
    }

    async fn get_tenant_clusters(&self, tenant_id: &str) -> Result<Vec<String>, ProviderError> {
        let clusters = self.directory.list_tenant_clusters(tenant_id).await?;
        let mut names: Vec<String> = clusters
            .into_iter()
            .filter(Cluster::is_dispatchable)
            .map(|c| c.metadata.name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_subject(&self, username: &str, _cluster: &str) -> Result<Subject, ProviderError> {
        Ok(Subject::user(username))
    }

    async fn dispatch_multi_cluster_role_binding(
        &self,
        binding: &MultiClusterRoleBinding,
        rules: &[PolicyRule],
        subjects: &BTreeMap<String, Subject>,
    ) -> Result<(), ProviderError> {
        let role = ClusterRole {
            name: member_object_name(binding),
            labels: member_labels(binding),
            rules: rules.to_vec(),
        };

        let results = join_all(
            subjects
                .iter()
                .map(|(cluster, subject)| self.dispatch_to_cluster(cluster, role.clone(), subject)),
        )
        .await;
        let failures: Vec<ProviderError> = results.into_iter().filter_map(|r| r.err()).collect();

        let result = if failures.is_empty() { "success" } else { "error" };
        metrics::counter!(
            "authz_provider_dispatch_total",
            "provider" => PLATFORM_PROVIDER_NAME,
            "result" => result
        )
        .increment(1);

        if failures.is_empty() {
            debug!(
                binding = %binding.metadata.key(),
                clusters = subjects.len(),
                "Binding dispatched"
            );
        } else {
            warn!(
                binding = %binding.metadata.key(),
                failed = failures.len(),
                total = subjects.len(),
                "Binding dispatch partially failed"
            );
        }
        ProviderError::aggregate(failures)
    }

    async fn delete_unbinding_resources(
        &self,
        binding: &MultiClusterRoleBinding,
        removed_clusters: &[String],
    ) -> Result<(), ProviderError> {
        if removed_clusters.is_empty() {
            return Ok(());
        }
        info!(
            binding = %binding.metadata.key(),
            clusters = ?removed_clusters,
            "Removing binding resources from unbound clusters"
        );
        self.delete_from_clusters(&member_object_name(binding), removed_clusters)
            .await
    }

    async fn delete_multi_cluster_role_binding_resources(
        &self,
        binding: &MultiClusterRoleBinding,
    ) -> Result<(), ProviderError> {
        let clusters = teardown_clusters(binding);
        info!(
            binding = %binding.metadata.key(),
            clusters = ?clusters,
            "Tearing down binding resources"
        );
        self.delete_from_clusters(&member_object_name(binding), &clusters)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterPhase, ANNOTATION_LAST_DISPATCHED_CLUSTERS};

    async fn provider_with(clusters: &[(&str, &str, ClusterPhase)]) -> (PlatformProvider, Arc<InMemoryMemberClusters>) {
        let store = Arc::new(MemoryStore::new(16));
        for (name, tenant, phase) in clusters {
            store.create(Cluster::new(name, tenant, *phase)).await.unwrap();
        }
        let members = Arc::new(InMemoryMemberClusters::new());
        let provider = PlatformProvider::new(
            Arc::new(StoreClusterDirectory::new(store)),
            members.clone(),
            None,
        );
        (provider, members)
    }

    fn subjects(clusters: &[&str]) -> BTreeMap<String, Subject> {
        clusters
            .iter()
            .map(|c| (c.to_string(), Subject::user("alice")))
            .collect()
    }

    #[tokio::test]
    async fn test_tenant_clusters_exclude_unready_and_global() {
        let (provider, _) = provider_with(&[
            ("c", "tenant-a", ClusterPhase::Running),
            ("a", "tenant-a", ClusterPhase::Running),
            ("b", "tenant-a", ClusterPhase::Failed),
            ("init", "tenant-a", ClusterPhase::Initializing),
            ("gone", "tenant-a", ClusterPhase::Terminating),
            ("global", "tenant-a", ClusterPhase::Running),
            ("other", "tenant-b", ClusterPhase::Running),
        ])
        .await;

        let clusters = provider.get_tenant_clusters("tenant-a").await.unwrap();
        assert_eq!(clusters, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_dispatch_is_idempotent() {
        let (provider, members) = provider_with(&[]).await;
        let binding = MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", &["a", "b"]);
        let rules = vec![PolicyRule::new(&["get"], &[""], &["pods"])];

        provider
            .dispatch_multi_cluster_role_binding(&binding, &rules, &subjects(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(members.write_count(), 4);
        provider
            .dispatch_multi_cluster_role_binding(&binding, &rules, &subjects(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(members.write_count(), 4);

        let name = member_object_name(&binding);
        let crb = members.cluster_role_binding("a", &name).unwrap();
        assert_eq!(crb.role_ref, name);
        assert_eq!(crb.subjects, vec![Subject::user("alice")]);
        assert_eq!(members.cluster_role("b", &name).unwrap().rules, rules);
    }

    #[tokio::test]
    async fn test_partial_failure_is_aggregated() {
        let (provider, members) = provider_with(&[]).await;
        members.set_unreachable("b", true);
        let binding = MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", &["a", "b"]);

        let err = provider
            .dispatch_multi_cluster_role_binding(&binding, &[], &subjects(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.failed_clusters(), vec!["b".to_string()]);
        // 可达集群照常下发
        assert!(members
            .clusters_with_binding(&member_object_name(&binding))
            .contains("a"));
    }

    #[tokio::test]
    async fn test_teardown_uses_last_dispatched_snapshot() {
        let (provider, members) = provider_with(&[]).await;
        let mut binding = MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", &["*"]);
        provider
            .dispatch_multi_cluster_role_binding(&binding, &[], &subjects(&["a", "b"]))
            .await
            .unwrap();
        binding.metadata.annotations.insert(
            ANNOTATION_LAST_DISPATCHED_CLUSTERS.to_string(),
            r#"["a","b"]"#.to_string(),
        );

        provider
            .delete_multi_cluster_role_binding_resources(&binding)
            .await
            .unwrap();
        assert!(members
            .clusters_with_binding(&member_object_name(&binding))
            .is_empty());
    }

    #[tokio::test]
    async fn test_teardown_covers_spec_clusters_missing_from_snapshot() {
        let (provider, members) = provider_with(&[]).await;
        let mut binding = MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", &["a", "c"]);
        provider
            .dispatch_multi_cluster_role_binding(&binding, &[], &subjects(&["a", "c"]))
            .await
            .unwrap();
        binding.metadata.annotations.insert(
            ANNOTATION_LAST_DISPATCHED_CLUSTERS.to_string(),
            r#"["a"]"#.to_string(),
        );

        provider
            .delete_multi_cluster_role_binding_resources(&binding)
            .await
            .unwrap();
        assert!(members
            .clusters_with_binding(&member_object_name(&binding))
            .is_empty());
    }

    #[test]
    fn test_region_filter() {
        let provider = PlatformProvider::new(
            Arc::new(StoreClusterDirectory::new(Arc::new(MemoryStore::new(16)))),
            Arc::new(InMemoryMemberClusters::new()),
            Some("gz".to_string()),
        );
        let mut annotations = BTreeMap::new();
        assert!(provider.on_filter(&annotations));
        annotations.insert(ANNOTATION_REGION.to_string(), "sh".to_string());
        assert!(!provider.on_filter(&annotations));
    }
}
