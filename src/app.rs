//! 控制面装配
//! 创建存储、注册表、Provider 和三个控制器，并对外暴露 HTTP 所需的状态

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::PolicyRoleCache;
use crate::config::AppConfig;
use crate::controllers::{MultiClusterRoleBindingController, PolicyController, RoleController};
use crate::error::Result;
use crate::middleware::AppState;
use crate::models::{Cluster, MultiClusterRoleBinding, Policy, Role};
use crate::provider::{
    InMemoryMemberClusters, PlatformProvider, Provider, ProviderRegistry, ProviderRegistryBuilder,
    StoreClusterDirectory,
};
use crate::registry::Registry;
use crate::repository::MemoryStore;

pub struct ControlPlane {
    config: AppConfig,
    policies: Registry<Policy>,
    roles: Registry<Role>,
    bindings: Registry<MultiClusterRoleBinding>,
    clusters: Registry<Cluster>,
    cache: Arc<PolicyRoleCache>,
    members: Arc<InMemoryMemberClusters>,
    providers: Arc<ProviderRegistry>,
    policy_controller: Arc<PolicyController>,
    role_controller: Arc<RoleController>,
    binding_controller: Arc<MultiClusterRoleBindingController>,
}

impl ControlPlane {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_providers(config, Vec::new())
    }

    /// 额外注册外部 Provider，名称与内置 Provider 冲突时报错
    pub fn with_providers(config: AppConfig, extra: Vec<Arc<dyn Provider>>) -> Result<Self> {
        let buffer = config.controller.watch_buffer;
        let policies = Registry::new(Arc::new(MemoryStore::new(buffer)));
        let roles = Registry::new(Arc::new(MemoryStore::new(buffer)));
        let bindings = Registry::new(Arc::new(MemoryStore::new(buffer)));
        let clusters: Registry<Cluster> = Registry::new(Arc::new(MemoryStore::new(buffer)));

        let members = Arc::new(InMemoryMemberClusters::new());
        let mut builder = ProviderRegistryBuilder::new();
        if config.provider.platform_enabled {
            builder.register(Arc::new(PlatformProvider::new(
                Arc::new(StoreClusterDirectory::new(clusters.store().clone())),
                members.clone(),
                config.provider.region.clone(),
            )))?;
        }
        for provider in extra {
            builder.register(provider)?;
        }
        let providers = Arc::new(builder.build());
        info!(providers = ?providers.names(), "Provider registry built");

        let cache = Arc::new(PolicyRoleCache::new());
        let policy_controller = PolicyController::new(
            policies.clone(),
            roles.clone(),
            cache.clone(),
            providers.clone(),
            config.controller.clone(),
        );
        let role_controller = RoleController::new(
            roles.clone(),
            bindings.clone(),
            cache.clone(),
            providers.clone(),
            config.controller.clone(),
        );
        let binding_controller = MultiClusterRoleBindingController::new(
            bindings.clone(),
            roles.clone(),
            policies.clone(),
            clusters.clone(),
            providers.clone(),
            config.controller.clone(),
        );

        Ok(Self {
            config,
            policies,
            roles,
            bindings,
            clusters,
            cache,
            members,
            providers,
            policy_controller,
            role_controller,
            binding_controller,
        })
    }

    /// 启动三个控制器，取消 token 后各自退出
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<Result<()>>> {
        vec![
            tokio::spawn(self.policy_controller.clone().run(shutdown.clone())),
            tokio::spawn(self.role_controller.clone().run(shutdown.clone())),
            tokio::spawn(self.binding_controller.clone().run(shutdown)),
        ]
    }

    pub fn app_state(&self) -> AppState {
        let mut readiness = vec![("policy-controller", self.policy_controller.synced())];
        readiness.extend(
            self.role_controller
                .synced()
                .into_iter()
                .map(|synced| ("role-controller", synced)),
        );
        readiness.extend(
            self.binding_controller
                .synced()
                .into_iter()
                .map(|synced| ("multiclusterrolebinding-controller", synced)),
        );

        AppState {
            config: self.config.clone(),
            policies: self.policies.clone(),
            roles: self.roles.clone(),
            bindings: self.bindings.clone(),
            clusters: self.clusters.clone(),
            readiness,
        }
    }

    pub fn policies(&self) -> &Registry<Policy> {
        &self.policies
    }

    pub fn roles(&self) -> &Registry<Role> {
        &self.roles
    }

    pub fn bindings(&self) -> &Registry<MultiClusterRoleBinding> {
        &self.bindings
    }

    pub fn clusters(&self) -> &Registry<Cluster> {
        &self.clusters
    }

    pub fn cache(&self) -> &Arc<PolicyRoleCache> {
        &self.cache
    }

    /// platform provider 写入的成员集群
    pub fn members(&self) -> &Arc<InMemoryMemberClusters> {
        &self.members
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }
}
