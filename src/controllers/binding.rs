//! MultiClusterRoleBinding 控制器
//!
//! Active：解析 Role 的规则、展开通配集群、解析主体、调用 Provider 下发，
//! 清理从 spec 中移除的集群，并记录 last-dispatched-clusters 快照。
//! Terminating：交给 Deleter 拆除并完成删除。
//! 默认 Provider 不持有任何集群，不写条件和快照。
//! 租户集群变化时，所有通配绑定重新入队。

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::deleter::MultiClusterRoleBindingDeleter;
use super::informer::{Informer, Lister, ResourceEventHandler};
use super::{new_queue, process_queue, Reconciler};
use crate::concurrency::WorkQueue;
use crate::config::ControllerConfig;
use crate::error::{AppError, Result};
use crate::models::{
    BindingCondition, Cluster, MultiClusterRoleBinding, Policy, PolicyRule, Role,
    ANNOTATION_LAST_DISPATCHED_CLUSTERS, ANNOTATION_UPDATED_BY_ROLE_CONTROLLER,
    CONDITION_DISPATCHED, LABEL_DISPATCH_ALL_CLUSTERS,
};
use crate::provider::{
    last_dispatched_clusters, Provider, ProviderError, ProviderRegistry, DEFAULT_PROVIDER_NAME,
};
use crate::registry::Registry;
use crate::repository::ListOptions;

struct BindingEventHandler {
    queue: Arc<WorkQueue>,
    providers: Arc<ProviderRegistry>,
    debounce: Duration,
}

impl BindingEventHandler {
    /// 删除中的绑定即使 Provider 未注册也要入队完成终结
    async fn enqueue(&self, binding: &MultiClusterRoleBinding) {
        if self.providers.accepts(&binding.metadata.annotations) || binding.metadata.is_terminating() {
            self.queue
                .add_after(&binding.metadata.key(), self.debounce)
                .await;
        }
    }
}

fn binding_changed(old: &MultiClusterRoleBinding, new: &MultiClusterRoleBinding) -> bool {
    old.metadata.uid != new.metadata.uid
        || old.spec != new.spec
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.annotation(ANNOTATION_UPDATED_BY_ROLE_CONTROLLER)
            != new.metadata.annotation(ANNOTATION_UPDATED_BY_ROLE_CONTROLLER)
}

#[async_trait]
impl ResourceEventHandler<MultiClusterRoleBinding> for BindingEventHandler {
    async fn on_add(&self, binding: &MultiClusterRoleBinding) {
        self.enqueue(binding).await;
    }

    async fn on_update(&self, old: &MultiClusterRoleBinding, new: &MultiClusterRoleBinding) {
        if binding_changed(old, new) {
            self.enqueue(new).await;
        }
    }

    async fn on_delete(&self, binding: &MultiClusterRoleBinding) {
        self.enqueue(binding).await;
    }
}

/// 集群变化时重新下发通配绑定
struct ClusterEventHandler {
    queue: Arc<WorkQueue>,
    bindings: Lister<MultiClusterRoleBinding>,
    providers: Arc<ProviderRegistry>,
    debounce: Duration,
}

impl ClusterEventHandler {
    async fn requeue_wildcard_bindings(&self, cluster: &Cluster) {
        let selector = ListOptions::all().with_label(LABEL_DISPATCH_ALL_CLUSTERS, "true");
        let bindings = self.bindings.list(&selector).await;
        debug!(
            cluster = %cluster.metadata.name,
            bindings = bindings.len(),
            "Tenant clusters changed, requeueing wildcard bindings"
        );
        for binding in bindings {
            if self.providers.accepts(&binding.metadata.annotations) {
                self.queue
                    .add_after(&binding.metadata.key(), self.debounce)
                    .await;
            }
        }
    }
}

#[async_trait]
impl ResourceEventHandler<Cluster> for ClusterEventHandler {
    async fn on_add(&self, cluster: &Cluster) {
        self.requeue_wildcard_bindings(cluster).await;
    }

    async fn on_update(&self, old: &Cluster, new: &Cluster) {
        if old.is_dispatchable() != new.is_dispatchable()
            || old.spec.tenant_id != new.spec.tenant_id
        {
            self.requeue_wildcard_bindings(new).await;
        }
    }

    async fn on_delete(&self, cluster: &Cluster) {
        self.requeue_wildcard_bindings(cluster).await;
    }
}

type BindingInformers = (Informer<MultiClusterRoleBinding>, Informer<Cluster>);

pub struct MultiClusterRoleBindingController {
    bindings: Registry<MultiClusterRoleBinding>,
    roles: Registry<Role>,
    policies: Registry<Policy>,
    providers: Arc<ProviderRegistry>,
    deleter: MultiClusterRoleBindingDeleter,
    queue: Arc<WorkQueue>,
    informers: Mutex<Option<BindingInformers>>,
    synced: Vec<watch::Receiver<bool>>,
    config: ControllerConfig,
}

impl MultiClusterRoleBindingController {
    pub fn new(
        bindings: Registry<MultiClusterRoleBinding>,
        roles: Registry<Role>,
        policies: Registry<Policy>,
        clusters: Registry<Cluster>,
        providers: Arc<ProviderRegistry>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let queue = new_queue("multiclusterrolebinding", &config);
        let binding_informer = Informer::new(bindings.store().clone()).with_handler(Arc::new(
            BindingEventHandler {
                queue: queue.clone(),
                providers: providers.clone(),
                debounce: config.debounce(),
            },
        ));
        let cluster_informer = Informer::new(clusters.store().clone()).with_handler(Arc::new(
            ClusterEventHandler {
                queue: queue.clone(),
                bindings: binding_informer.lister(),
                providers: providers.clone(),
                debounce: config.debounce(),
            },
        ));
        let synced = vec![binding_informer.synced(), cluster_informer.synced()];

        Arc::new(Self {
            deleter: MultiClusterRoleBindingDeleter::new(bindings.clone()),
            bindings,
            roles,
            policies,
            providers,
            queue,
            informers: Mutex::new(Some((binding_informer, cluster_informer))),
            synced,
            config,
        })
    }

    pub fn synced(&self) -> Vec<watch::Receiver<bool>> {
        self.synced.clone()
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let (binding_informer, cluster_informer) = self
            .informers
            .lock()
            .await
            .take()
            .ok_or_else(|| {
                AppError::internal_error("multiclusterrolebinding controller already started")
            })?;
        tokio::spawn(binding_informer.run(shutdown.clone()));
        tokio::spawn(cluster_informer.run(shutdown.clone()));

        info!("Starting multiclusterrolebinding controller");
        let config = self.config.clone();
        process_queue(self.clone(), self.queue.clone(), self.synced(), &config, shutdown).await
    }

    /// 从存活的 Policy 解析规则，悬空引用跳过
    async fn resolve_rules(&self, role: &Role) -> Result<Vec<PolicyRule>> {
        let mut rules = Vec::new();
        for policy_key in &role.spec.policies {
            match self.policies.get(policy_key).await {
                Ok(policy) if policy.metadata.is_terminating() => {
                    debug!(policy = %policy_key, "Skipping terminating policy");
                }
                Ok(policy) => rules.extend(policy.spec.rules),
                Err(e) if e.is_not_found() => {
                    debug!(policy = %policy_key, "Skipping dangling policy reference");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rules)
    }

    /// 目标集群；"*" 在这里展开，不会写回 spec
    async fn target_clusters(
        &self,
        binding: &MultiClusterRoleBinding,
        role: &Role,
        provider: &dyn Provider,
    ) -> Result<Vec<String>> {
        let clusters: BTreeSet<String> = if binding.dispatches_all_clusters() {
            provider
                .get_tenant_clusters(&role.spec.tenant_id)
                .await?
                .into_iter()
                .collect()
        } else {
            binding.spec.clusters.iter().cloned().collect()
        };
        Ok(clusters.into_iter().collect())
    }

    async fn dispatch(
        &self,
        binding: &MultiClusterRoleBinding,
        provider: Arc<dyn Provider>,
    ) -> Result<()> {
        let key = binding.metadata.key();
        let role = match self.roles.get(&binding.spec.role_name).await {
            Ok(role) => role,
            Err(e) if e.is_not_found() => {
                debug!(role = %binding.spec.role_name, "Bound role not found, nothing to dispatch");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let rules = self.resolve_rules(&role).await?;
        let clusters = self.target_clusters(binding, &role, provider.as_ref()).await?;
        let mut subjects = BTreeMap::new();
        for cluster in &clusters {
            let subject = provider.get_subject(&binding.spec.username, cluster).await?;
            subjects.insert(cluster.clone(), subject);
        }

        // 先把将要触达的集群并入快照，下发中途失败时拆除仍能覆盖它们
        let previous = last_dispatched_clusters(binding).unwrap_or_default();
        let intent: BTreeSet<String> = previous.iter().chain(clusters.iter()).cloned().collect();
        let intent: Vec<String> = intent.into_iter().collect();
        let binding = match self.record_snapshot(binding, &intent).await? {
            Some(binding) => binding,
            None => return Ok(()),
        };

        let dispatched = provider
            .dispatch_multi_cluster_role_binding(&binding, &rules, &subjects)
            .await;
        self.record_dispatch_condition(&binding, &clusters, dispatched.as_ref().err())
            .await?;
        dispatched?;

        let removed: Vec<String> = previous
            .into_iter()
            .filter(|c| !clusters.contains(c))
            .collect();
        if !removed.is_empty() {
            provider.delete_unbinding_resources(&binding, &removed).await?;
        }
        self.record_snapshot(&binding, &clusters).await?;

        info!(
            binding = %key,
            clusters = ?clusters,
            removed = ?removed,
            rules = rules.len(),
            "Binding dispatched"
        );
        Ok(())
    }

    /// 写入 last-dispatched-clusters 快照，内容相同时不写；绑定已变化或不存在时返回 None
    async fn record_snapshot(
        &self,
        binding: &MultiClusterRoleBinding,
        clusters: &[String],
    ) -> Result<Option<MultiClusterRoleBinding>> {
        let snapshot = serde_json::to_string(clusters)
            .map_err(|e| AppError::Internal(format!("failed to encode cluster snapshot: {}", e)))?;
        if binding.metadata.annotation(ANNOTATION_LAST_DISPATCHED_CLUSTERS) == Some(snapshot.as_str()) {
            return Ok(Some(binding.clone()));
        }

        let result = self
            .bindings
            .patch_metadata(&binding.metadata.key(), Some(&binding.metadata.uid), |meta| {
                meta.annotations
                    .insert(ANNOTATION_LAST_DISPATCHED_CLUSTERS.to_string(), snapshot);
            })
            .await;
        match result {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(error = %e, "Binding gone before recording dispatched clusters");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatched 条件只在内容变化时写入
    async fn record_dispatch_condition(
        &self,
        binding: &MultiClusterRoleBinding,
        clusters: &[String],
        failure: Option<&ProviderError>,
    ) -> Result<()> {
        let condition = match failure {
            None => BindingCondition {
                condition_type: CONDITION_DISPATCHED.to_string(),
                status: "True".to_string(),
                reason: "Dispatched".to_string(),
                message: format!("dispatched to {} cluster(s)", clusters.len()),
                last_transition_time: Some(Utc::now()),
            },
            Some(e) => BindingCondition {
                condition_type: CONDITION_DISPATCHED.to_string(),
                status: "False".to_string(),
                reason: "DispatchFailed".to_string(),
                message: e.to_string(),
                last_transition_time: Some(Utc::now()),
            },
        };
        if let Some(e) = failure {
            warn!(failed_clusters = ?e.failed_clusters(), error = %e, "Dispatch failed");
        }

        let mut updated = binding.clone();
        if !updated.status.set_condition(condition) {
            return Ok(());
        }
        match self.bindings.update_status(updated).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(error = %e, "Skipped status update for changed binding");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler for MultiClusterRoleBindingController {
    fn name(&self) -> &'static str {
        "multiclusterrolebinding"
    }

    #[instrument(skip(self), fields(controller = "multiclusterrolebinding"))]
    async fn reconcile(&self, key: &str) -> Result<()> {
        let binding = match self.bindings.get(key).await {
            Ok(binding) => binding,
            Err(e) if e.is_not_found() => {
                debug!("Binding no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let provider = match self.providers.for_annotations(&binding.metadata.annotations) {
            Some(provider) => provider,
            None if binding.metadata.is_terminating() => {
                // 没有 Provider 可以拆除，直接完成删除
                warn!("No provider registered for terminating binding, finalizing without teardown");
                return self.deleter.finalize_and_remove(&binding).await;
            }
            None => {
                debug!("No provider registered for binding, skipping");
                return Ok(());
            }
        };

        if binding.metadata.is_terminating() {
            return self.deleter.delete(&binding, provider).await;
        }
        if provider.name() == DEFAULT_PROVIDER_NAME {
            debug!("Default provider dispatches nothing");
            return Ok(());
        }
        self.dispatch(&binding, provider).await
    }
}
