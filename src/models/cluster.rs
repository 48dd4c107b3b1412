//! Cluster（成员集群）模型，集群级资源

use serde::{Deserialize, Serialize};

use super::{is_dns1123_subdomain, ObjectMeta, Resource, GLOBAL_CLUSTER};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusterPhase {
    #[default]
    Initializing,
    Running,
    Failed,
    Terminating,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn new(name: &str, tenant_id: &str, phase: ClusterPhase) -> Self {
        Self {
            metadata: ObjectMeta::new("", name),
            spec: ClusterSpec {
                tenant_id: tenant_id.to_string(),
                display_name: name.to_string(),
                finalizers: Vec::new(),
            },
            status: ClusterStatus { phase },
        }
    }

    /// 是否可以作为下发目标
    pub fn is_dispatchable(&self) -> bool {
        self.metadata.name != GLOBAL_CLUSTER
            && !self.metadata.is_terminating()
            && !matches!(
                self.status.phase,
                ClusterPhase::Initializing | ClusterPhase::Terminating
            )
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.metadata.namespace.is_empty() {
            return Err(AppError::Validation(
                "cluster is cluster-scoped and must not carry a namespace".to_string(),
            ));
        }
        if !is_dns1123_subdomain(&self.metadata.name) {
            return Err(AppError::Validation(format!(
                "invalid cluster name \"{}\"",
                self.metadata.name
            )));
        }
        if self.spec.tenant_id.trim().is_empty() {
            return Err(AppError::Validation(
                "spec.tenantID must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Resource for Cluster {
    const KIND: &'static str = "Cluster";
    const NAMESPACED: bool = false;
    const GRACEFUL: bool = true;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn finalizers(&self) -> &[String] {
        &self.spec.finalizers
    }

    fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.spec.finalizers = finalizers;
    }

    fn mark_terminating(&mut self) {
        self.status.phase = ClusterPhase::Terminating;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatchable_phases() {
        assert!(Cluster::new("c1", "t", ClusterPhase::Running).is_dispatchable());
        assert!(Cluster::new("c1", "t", ClusterPhase::Failed).is_dispatchable());
        assert!(!Cluster::new("c1", "t", ClusterPhase::Initializing).is_dispatchable());
        assert!(!Cluster::new("c1", "t", ClusterPhase::Terminating).is_dispatchable());
        assert!(!Cluster::new(GLOBAL_CLUSTER, "t", ClusterPhase::Running).is_dispatchable());
    }
}
