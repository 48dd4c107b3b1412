//! Role 控制器
//!
//! 维护 PolicyRoleCache（唯一写入方），并把 Role 的变化级联到绑定：
//! Role 删除时后台级联删除所有绑定，Role 变化时在绑定上写入时间戳注解。

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::informer::{Informer, Lister, ResourceEventHandler};
use super::{multi_cluster_filter, new_queue, process_queue, Reconciler};
use crate::cache::PolicyRoleCache;
use crate::concurrency::WorkQueue;
use crate::config::ControllerConfig;
use crate::error::{AppError, Result};
use crate::models::{
    format_timestamp, parse_timestamp, split_key, MultiClusterRoleBinding, Role,
    ANNOTATION_UPDATED_BY_POLICY_CONTROLLER, ANNOTATION_UPDATED_BY_ROLE_CONTROLLER,
    LABEL_ROLE_NAME, LABEL_ROLE_NAMESPACE,
};
use crate::provider::ProviderRegistry;
use crate::registry::{DeleteOptions, Registry};
use crate::repository::ListOptions;

struct RoleEventHandler {
    queue: Arc<WorkQueue>,
    cache: Arc<PolicyRoleCache>,
    providers: Arc<ProviderRegistry>,
    debounce: Duration,
}

impl RoleEventHandler {
    fn accepts(&self, role: &Role) -> bool {
        multi_cluster_filter(role.spec.scope, &role.metadata.annotations, &self.providers)
    }

    /// 删除中的 Role 总是入队，被过滤的也需要完成终结
    fn should_enqueue(&self, role: &Role) -> bool {
        self.accepts(role) || role.metadata.is_terminating()
    }

    async fn enqueue(&self, role: &Role) {
        self.queue.add_after(&role.metadata.key(), self.debounce).await;
    }
}

fn role_changed(old: &Role, new: &Role) -> bool {
    old.metadata.uid != new.metadata.uid
        || old.spec.policies != new.spec.policies
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.annotation(ANNOTATION_UPDATED_BY_POLICY_CONTROLLER)
            != new.metadata.annotation(ANNOTATION_UPDATED_BY_POLICY_CONTROLLER)
}

/// 缓存对所有 Role 事件生效，不受过滤条件影响
#[async_trait]
impl ResourceEventHandler<Role> for RoleEventHandler {
    async fn on_add(&self, role: &Role) {
        self.cache.put_by_role(role).await;
        if self.should_enqueue(role) {
            self.enqueue(role).await;
        }
    }

    async fn on_update(&self, old: &Role, new: &Role) {
        self.cache.update_by_role(old, new).await;
        if self.should_enqueue(new) && role_changed(old, new) {
            self.enqueue(new).await;
        }
    }

    async fn on_delete(&self, role: &Role) {
        self.cache.delete_role(role).await;
        if self.accepts(role) {
            self.enqueue(role).await;
        }
    }
}

pub struct RoleController {
    roles: Registry<Role>,
    bindings: Registry<MultiClusterRoleBinding>,
    binding_lister: Lister<MultiClusterRoleBinding>,
    queue: Arc<WorkQueue>,
    providers: Arc<ProviderRegistry>,
    informers: Mutex<Option<(Informer<Role>, Informer<MultiClusterRoleBinding>)>>,
    synced: Vec<watch::Receiver<bool>>,
    config: ControllerConfig,
}

impl RoleController {
    pub fn new(
        roles: Registry<Role>,
        bindings: Registry<MultiClusterRoleBinding>,
        cache: Arc<PolicyRoleCache>,
        providers: Arc<ProviderRegistry>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let queue = new_queue("role", &config);
        let handler = Arc::new(RoleEventHandler {
            queue: queue.clone(),
            cache,
            providers: providers.clone(),
            debounce: config.debounce(),
        });
        let role_informer = Informer::new(roles.store().clone()).with_handler(handler);
        let binding_informer = Informer::new(bindings.store().clone());
        let binding_lister = binding_informer.lister();
        let synced = vec![role_informer.synced(), binding_informer.synced()];

        Arc::new(Self {
            roles,
            bindings,
            binding_lister,
            queue,
            providers,
            informers: Mutex::new(Some((role_informer, binding_informer))),
            synced,
            config,
        })
    }

    pub fn synced(&self) -> Vec<watch::Receiver<bool>> {
        self.synced.clone()
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let (role_informer, binding_informer) = self
            .informers
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::internal_error("role controller already started"))?;
        tokio::spawn(role_informer.run(shutdown.clone()));
        tokio::spawn(binding_informer.run(shutdown.clone()));

        info!("Starting role controller");
        let config = self.config.clone();
        process_queue(self.clone(), self.queue.clone(), self.synced(), &config, shutdown).await
    }

    /// 清空终结器后按 UID 删除
    async fn finalize_and_remove(&self, key: &str, role: &Role) -> Result<()> {
        let uid = role.metadata.uid.as_str();
        match self.roles.finalize(key, Vec::new(), Some(uid)).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.roles.delete(key, DeleteOptions::with_uid(uid)).await {
            Ok(_) => {
                info!(role = %key, "Role deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 后台级联删除绑定；已在删除中或已不存在的绑定跳过
    async fn cascade_delete(&self, binding_key: &str) -> Result<()> {
        let live = match self.bindings.get(binding_key).await {
            Ok(binding) => binding,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if live.metadata.is_terminating() {
            return Ok(());
        }

        match self
            .bindings
            .delete(binding_key, DeleteOptions::background(&live.metadata.uid))
            .await
        {
            Ok(_) => {
                info!(binding = %binding_key, "Binding deleted with its role");
                Ok(())
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(binding = %binding_key, error = %e, "Binding already gone or changed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 在绑定上写入 role 控制器时间戳；已有时间戳不早于 Role 最近一次更新时不写
    async fn notify_binding(&self, role: &Role, binding: &MultiClusterRoleBinding) -> Result<()> {
        let since = role.metadata.update_timestamp;
        let key = binding.metadata.key();
        let result = self
            .bindings
            .patch_metadata(&key, Some(&binding.metadata.uid), |meta| {
                let stamped = meta
                    .annotation(ANNOTATION_UPDATED_BY_ROLE_CONTROLLER)
                    .and_then(parse_timestamp);
                let fresh = match (stamped, since) {
                    (Some(stamped), Some(since)) => stamped >= since,
                    _ => false,
                };
                if !fresh {
                    meta.annotations.insert(
                        ANNOTATION_UPDATED_BY_ROLE_CONTROLLER.to_string(),
                        format_timestamp(Utc::now()),
                    );
                }
            })
            .await;

        match result {
            Ok(updated) => {
                if updated.metadata.resource_version != binding.metadata.resource_version {
                    debug!(binding = %key, "Binding notified of role change");
                }
                Ok(())
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(binding = %key, error = %e, "Binding gone before notification");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler for RoleController {
    fn name(&self) -> &'static str {
        "role"
    }

    #[instrument(skip(self), fields(controller = "role"))]
    async fn reconcile(&self, key: &str) -> Result<()> {
        let role = match self.roles.get(key).await {
            Ok(role) => Some(role),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        // 不归本控制器管理的 Role 只需完成删除，不触碰绑定
        if let Some(role) = &role {
            if !multi_cluster_filter(role.spec.scope, &role.metadata.annotations, &self.providers) {
                if role.metadata.is_terminating() {
                    return self.finalize_and_remove(key, role).await;
                }
                return Ok(());
            }
        }
        let role_deleted = role
            .as_ref()
            .map(|r| r.metadata.is_terminating())
            .unwrap_or(true);

        let (namespace, name) = split_key(key);
        let selector = ListOptions::all()
            .with_label(LABEL_ROLE_NAMESPACE, namespace)
            .with_label(LABEL_ROLE_NAME, name);
        let bindings = self.binding_lister.list(&selector).await;

        for binding in bindings.iter().filter(|b| !b.metadata.is_terminating()) {
            match &role {
                Some(role) if !role_deleted => self.notify_binding(role, binding).await?,
                _ => self.cascade_delete(&binding.metadata.key()).await?,
            }
        }

        if let Some(role) = role.filter(|_| role_deleted) {
            debug!(bindings = bindings.len(), "Cascaded role deletion to bindings");
            self.finalize_and_remove(key, &role).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scope;
    use crate::provider::ProviderRegistryBuilder;
    use crate::repository::{MemoryStore, WatchEvent};

    fn controller_with(
        roles: &Registry<Role>,
        bindings: &Registry<MultiClusterRoleBinding>,
    ) -> Arc<RoleController> {
        RoleController::new(
            roles.clone(),
            bindings.clone(),
            Arc::new(PolicyRoleCache::new()),
            Arc::new(ProviderRegistryBuilder::new().build()),
            ControllerConfig::default(),
        )
    }

    #[test]
    fn test_role_changed_predicate() {
        let old = Role::new("tenant-a", "r1", Scope::MultiCluster, &["tenant-a/p1"]);
        let mut new = old.clone();
        new.spec.description = "doc only".to_string();
        assert!(!role_changed(&old, &new));

        new.metadata.annotations.insert(
            ANNOTATION_UPDATED_BY_POLICY_CONTROLLER.to_string(),
            "2026-01-01T00:00:00Z".to_string(),
        );
        assert!(role_changed(&old, &new));

        let mut renamed = old.clone();
        renamed.spec.policies.push("tenant-a/p2".to_string());
        assert!(role_changed(&old, &renamed));
    }

    #[tokio::test]
    async fn test_handler_drives_cache_for_filtered_roles() {
        let config = ControllerConfig::default();
        let cache = Arc::new(PolicyRoleCache::new());
        let handler = RoleEventHandler {
            queue: new_queue("role", &config),
            cache: cache.clone(),
            providers: Arc::new(ProviderRegistryBuilder::new().build()),
            debounce: Duration::ZERO,
        };

        // Platform 作用域不入队，但仍然进入缓存
        let role = Role::new("tenant-a", "r1", Scope::Platform, &["tenant-a/p1"]);
        handler.on_add(&role).await;
        assert!(cache.get_roles_by_policy("tenant-a/p1").await.contains("tenant-a/r1"));
        assert!(handler.queue.is_empty().await);

        handler.on_delete(&role).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_deleted_role_is_finalized_and_removed() {
        let roles: Registry<Role> = Registry::new(Arc::new(MemoryStore::new(64)));
        let bindings: Registry<MultiClusterRoleBinding> =
            Registry::new(Arc::new(MemoryStore::new(64)));
        let controller = RoleController::new(
            roles.clone(),
            bindings,
            Arc::new(PolicyRoleCache::new()),
            Arc::new(ProviderRegistryBuilder::new().build()),
            ControllerConfig::default(),
        );

        roles
            .create(Role::new("tenant-a", "r1", Scope::MultiCluster, &[]))
            .await
            .unwrap();
        roles
            .delete("tenant-a/r1", DeleteOptions::default())
            .await
            .unwrap();
        assert!(roles.get("tenant-a/r1").await.unwrap().metadata.is_terminating());

        controller.reconcile("tenant-a/r1").await.unwrap();
        assert!(roles.get("tenant-a/r1").await.unwrap_err().is_not_found());

        // 不存在的 Role 再次调谐是空操作
        controller.reconcile("tenant-a/r1").await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_enqueues_terminating_platform_role() {
        let config = ControllerConfig::default();
        let handler = RoleEventHandler {
            queue: new_queue("role", &config),
            cache: Arc::new(PolicyRoleCache::new()),
            providers: Arc::new(ProviderRegistryBuilder::new().build()),
            debounce: Duration::ZERO,
        };

        let role = Role::new("tenant-a", "r1", Scope::Platform, &[]);
        let mut terminating = role.clone();
        terminating.metadata.deletion_timestamp = Some(Utc::now());
        handler.on_update(&role, &terminating).await;
        assert!(!handler.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_platform_role_deletion_completes_without_touching_bindings() {
        let roles: Registry<Role> = Registry::new(Arc::new(MemoryStore::new(64)));
        let bindings: Registry<MultiClusterRoleBinding> =
            Registry::new(Arc::new(MemoryStore::new(64)));
        let controller = controller_with(&roles, &bindings);

        roles
            .create(Role::new("tenant-a", "r1", Scope::Platform, &[]))
            .await
            .unwrap();
        bindings
            .create(MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", &["a"]))
            .await
            .unwrap();
        roles
            .delete("tenant-a/r1", DeleteOptions::default())
            .await
            .unwrap();

        controller.reconcile("tenant-a/r1").await.unwrap();
        assert!(roles.get("tenant-a/r1").await.unwrap_err().is_not_found());
        assert!(!bindings
            .get("tenant-a/b1")
            .await
            .unwrap()
            .metadata
            .is_terminating());
    }

    #[tokio::test]
    async fn test_role_deletion_deletes_each_binding_once() {
        let roles: Registry<Role> = Registry::new(Arc::new(MemoryStore::new(64)));
        let bindings: Registry<MultiClusterRoleBinding> =
            Registry::new(Arc::new(MemoryStore::new(256)));
        let controller = controller_with(&roles, &bindings);

        roles
            .create(Role::new("tenant-a", "r1", Scope::MultiCluster, &[]))
            .await
            .unwrap();
        for name in ["b0", "b1", "b2"] {
            bindings
                .create(MultiClusterRoleBinding::new("tenant-a", name, "alice", "tenant-a/r1", &["a"]))
                .await
                .unwrap();
        }
        bindings
            .create(MultiClusterRoleBinding::new("tenant-a", "other", "bob", "tenant-a/r2", &["a"]))
            .await
            .unwrap();

        // 只启动绑定 informer，调谐由测试直接驱动
        let (_, binding_informer) = controller.informers.lock().await.take().unwrap();
        let mut synced = binding_informer.synced();
        let shutdown = CancellationToken::new();
        tokio::spawn(binding_informer.run(shutdown.clone()));
        synced.wait_for(|synced| *synced).await.unwrap();

        let mut events = bindings.store().watch();
        roles
            .delete("tenant-a/r1", DeleteOptions::default())
            .await
            .unwrap();
        controller.reconcile("tenant-a/r1").await.unwrap();
        controller.reconcile("tenant-a/r1").await.unwrap();
        shutdown.cancel();

        let mut deleted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WatchEvent::Modified(binding) = event {
                if binding.metadata.is_terminating() {
                    deleted.push(binding.metadata.name.clone());
                }
            }
        }
        deleted.sort();
        assert_eq!(deleted, vec!["b0", "b1", "b2"]);
        assert!(!bindings
            .get("tenant-a/other")
            .await
            .unwrap()
            .metadata
            .is_terminating());
        assert!(roles.get("tenant-a/r1").await.unwrap_err().is_not_found());
    }
}
