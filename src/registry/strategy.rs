//! 各资源的准入策略

use crate::error::Result;
use crate::models::{
    BindingPhase, BindingStatus, Cluster, MultiClusterRoleBinding, Policy, Resource, Role,
    BINDING_FINALIZER, CLUSTER_FINALIZER, ROLE_FINALIZER,
};

/// 创建与更新前对对象做的规范化和校验
pub trait Admission: Resource {
    fn validate(&self) -> Result<()>;

    /// 创建前：补默认终结器、重置状态
    fn prepare_for_create(&mut self) {
        self.meta_mut().deletion_timestamp = None;
    }

    /// 更新前：领域终结器与状态保持存储中的值
    fn prepare_for_update(&mut self, old: &Self) {
        self.set_finalizers(old.finalizers().to_vec());
        self.copy_status_from(old);
    }

    fn copy_status_from(&mut self, _other: &Self) {}
}

fn default_finalizers(current: &[String], finalizer: &str) -> Vec<String> {
    if current.is_empty() {
        vec![finalizer.to_string()]
    } else {
        current.to_vec()
    }
}

impl Admission for Policy {
    fn validate(&self) -> Result<()> {
        Policy::validate(self)
    }
}

impl Admission for Role {
    fn validate(&self) -> Result<()> {
        Role::validate(self)
    }

    fn prepare_for_create(&mut self) {
        self.metadata.deletion_timestamp = None;
        self.spec.finalizers = default_finalizers(&self.spec.finalizers, ROLE_FINALIZER);
    }
}

impl Admission for MultiClusterRoleBinding {
    fn validate(&self) -> Result<()> {
        MultiClusterRoleBinding::validate(self)
    }

    fn prepare_for_create(&mut self) {
        self.metadata.deletion_timestamp = None;
        self.spec.finalizers = default_finalizers(&self.spec.finalizers, BINDING_FINALIZER);
        self.status = BindingStatus {
            phase: BindingPhase::Active,
            conditions: Vec::new(),
        };
        self.apply_derived_labels();
    }

    fn prepare_for_update(&mut self, old: &Self) {
        self.spec.finalizers = old.spec.finalizers.clone();
        self.status = old.status.clone();
        self.apply_derived_labels();
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

impl Admission for Cluster {
    fn validate(&self) -> Result<()> {
        Cluster::validate(self)
    }

    /// 集群状态由平台侧写入，创建时保留调用方提供的 phase
    fn prepare_for_create(&mut self) {
        self.metadata.deletion_timestamp = None;
        self.spec.finalizers = default_finalizers(&self.spec.finalizers, CLUSTER_FINALIZER);
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}
