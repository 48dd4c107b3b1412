//! Policy 控制器
//!
//! Policy 被删除时，把它从所有引用它的 Role 中摘除；Policy 规则变化时，
//! 在引用它的 Role 上写入时间戳注解，触发下游重新下发。
//! 带终结器的 Policy 由控制器清空终结器后完成删除。

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::informer::{Informer, ResourceEventHandler};
use super::{multi_cluster_filter, new_queue, process_queue, Reconciler};
use crate::cache::PolicyRoleCache;
use crate::concurrency::WorkQueue;
use crate::config::ControllerConfig;
use crate::error::{AppError, Result};
use crate::models::{
    format_timestamp, parse_timestamp, Policy, Role, ANNOTATION_UPDATED_BY_POLICY_CONTROLLER,
};
use crate::provider::ProviderRegistry;
use crate::registry::{DeleteOptions, Registry};

struct PolicyEventHandler {
    queue: Arc<WorkQueue>,
    providers: Arc<ProviderRegistry>,
    debounce: Duration,
}

impl PolicyEventHandler {
    fn accepts(&self, policy: &Policy) -> bool {
        multi_cluster_filter(policy.spec.scope, &policy.metadata.annotations, &self.providers)
    }

    fn should_enqueue(&self, policy: &Policy) -> bool {
        self.accepts(policy) || policy.metadata.is_terminating()
    }

    async fn enqueue(&self, policy: &Policy) {
        self.queue
            .add_after(&policy.metadata.key(), self.debounce)
            .await;
    }
}

#[async_trait]
impl ResourceEventHandler<Policy> for PolicyEventHandler {
    async fn on_add(&self, policy: &Policy) {
        if self.should_enqueue(policy) {
            self.enqueue(policy).await;
        }
    }

    async fn on_update(&self, old: &Policy, new: &Policy) {
        if !self.should_enqueue(new) {
            return;
        }
        if old.metadata.uid != new.metadata.uid
            || old.spec.rules != new.spec.rules
            || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        {
            self.enqueue(new).await;
        }
    }

    async fn on_delete(&self, policy: &Policy) {
        if self.accepts(policy) {
            self.enqueue(policy).await;
        }
    }
}

pub struct PolicyController {
    policies: Registry<Policy>,
    roles: Registry<Role>,
    cache: Arc<PolicyRoleCache>,
    providers: Arc<ProviderRegistry>,
    queue: Arc<WorkQueue>,
    informer: Mutex<Option<Informer<Policy>>>,
    synced: watch::Receiver<bool>,
    config: ControllerConfig,
}

impl PolicyController {
    pub fn new(
        policies: Registry<Policy>,
        roles: Registry<Role>,
        cache: Arc<PolicyRoleCache>,
        providers: Arc<ProviderRegistry>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let queue = new_queue("policy", &config);
        let handler = Arc::new(PolicyEventHandler {
            queue: queue.clone(),
            providers: providers.clone(),
            debounce: config.debounce(),
        });
        let informer = Informer::new(policies.store().clone()).with_handler(handler);
        let synced = informer.synced();

        Arc::new(Self {
            policies,
            roles,
            cache,
            providers,
            queue,
            informer: Mutex::new(Some(informer)),
            synced,
            config,
        })
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let informer = self
            .informer
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::internal_error("policy controller already started"))?;
        tokio::spawn(informer.run(shutdown.clone()));

        info!("Starting policy controller");
        let config = self.config.clone();
        process_queue(self.clone(), self.queue.clone(), vec![self.synced()], &config, shutdown).await
    }

    /// 清空终结器后按 UID 删除
    async fn finalize_and_remove(&self, key: &str, policy: &Policy) -> Result<()> {
        let uid = policy.metadata.uid.as_str();
        match self.policies.finalize(key, Vec::new(), Some(uid)).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.policies.delete(key, DeleteOptions::with_uid(uid)).await {
            Ok(_) => {
                info!(policy = %key, "Policy finalized and deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 通知或更新引用该 Policy 的所有 Role
    async fn update_related_roles(
        &self,
        policy_key: &str,
        policy: Option<&Policy>,
        deleted: bool,
    ) -> Result<()> {
        let since = policy.and_then(|p| p.metadata.update_timestamp);

        for role_key in self.cache.get_roles_by_policy(policy_key).await {
            let mut role = match self.roles.get(&role_key).await {
                Ok(role) => role,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            if deleted {
                if !role.references(policy_key) {
                    continue;
                }
                role.spec.policies.retain(|p| p != policy_key);
            } else if let Some(since) = since {
                let stamped = role
                    .metadata
                    .annotation(ANNOTATION_UPDATED_BY_POLICY_CONTROLLER)
                    .and_then(parse_timestamp);
                if stamped.map(|t| t >= since).unwrap_or(false) {
                    continue;
                }
            }

            role.metadata.annotations.insert(
                ANNOTATION_UPDATED_BY_POLICY_CONTROLLER.to_string(),
                format_timestamp(Utc::now()),
            );
            match self.roles.update(role).await {
                Ok(updated) => {
                    info!(
                        policy = %policy_key,
                        role = %role_key,
                        detached = deleted,
                        policies = ?updated.spec.policies,
                        "Role updated for policy change"
                    );
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(role = %role_key, error = %e, "Role changed concurrently, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PolicyController {
    fn name(&self) -> &'static str {
        "policy"
    }

    #[instrument(skip(self), fields(controller = "policy"))]
    async fn reconcile(&self, key: &str) -> Result<()> {
        match self.policies.get(key).await {
            Err(e) if e.is_not_found() => {
                info!("Policy has been deleted, detaching it from roles");
                self.update_related_roles(key, None, true).await?;
                self.cache.delete_policy(key).await;
                Ok(())
            }
            Err(e) => Err(e),
            Ok(policy) => {
                let accepted = multi_cluster_filter(
                    policy.spec.scope,
                    &policy.metadata.annotations,
                    &self.providers,
                );
                if !policy.metadata.is_terminating() {
                    if accepted {
                        self.update_related_roles(key, Some(&policy), false).await?;
                    }
                    return Ok(());
                }
                if accepted {
                    self.update_related_roles(key, Some(&policy), true).await?;
                }
                self.finalize_and_remove(key, &policy).await
            }
        }
    }
}
