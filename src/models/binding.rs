//! MultiClusterRoleBinding domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

use super::{
    is_dns1123_subdomain, parse_reference, ObjectMeta, Resource, ALL_CLUSTERS,
    LABEL_DISPATCH_ALL_CLUSTERS, LABEL_ROLE_NAME, LABEL_ROLE_NAMESPACE, LABEL_USERNAME,
};
use crate::error::AppError;

/// 绑定生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BindingPhase {
    #[default]
    Active,
    Terminating,
}

/// 状态条件，目前只有 Dispatched 一种
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True" / "False"
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

pub const CONDITION_DISPATCHED: &str = "Dispatched";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    #[serde(default)]
    pub phase: BindingPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<BindingCondition>,
}

impl BindingStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&BindingCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// 写入条件；内容未变化时返回 false，保持 lastTransitionTime
    pub fn set_condition(&mut self, mut condition: BindingCondition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return false;
                }
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    #[validate(length(min = 1, message = "spec.username must not be empty"))]
    pub username: String,
    /// Role 引用 "namespace/name"
    #[validate(custom(function = "validate_role_reference"))]
    pub role_name: String,
    #[validate(custom(function = "validate_clusters"))]
    pub clusters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

fn validate_role_reference(role_name: &str) -> Result<(), ValidationError> {
    parse_reference(role_name).map(|_| ()).map_err(|_| {
        let mut error = ValidationError::new("role_reference");
        error.message = Some("spec.roleName must be of the form namespace/name".into());
        error
    })
}

#[allow(clippy::ptr_arg)]
fn validate_clusters(clusters: &Vec<String>) -> Result<(), ValidationError> {
    if clusters.is_empty() {
        let mut error = ValidationError::new("clusters_empty");
        error.message = Some("spec.clusters must not be empty".into());
        return Err(error);
    }
    if clusters.iter().any(|c| c == ALL_CLUSTERS) && clusters.len() != 1 {
        let mut error = ValidationError::new("clusters_wildcard");
        error.message = Some("\"*\" must be the only entry of spec.clusters".into());
        return Err(error);
    }
    if clusters.iter().any(|c| c.trim().is_empty()) {
        let mut error = ValidationError::new("clusters_blank");
        error.message = Some("spec.clusters must not contain blank entries".into());
        return Err(error);
    }
    Ok(())
}

/// MultiClusterRoleBinding：把用户与 Role 绑定到一组集群
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiClusterRoleBinding {
    pub metadata: ObjectMeta,
    pub spec: BindingSpec,
    #[serde(default)]
    pub status: BindingStatus,
}

impl MultiClusterRoleBinding {
    pub fn new(namespace: &str, name: &str, username: &str, role: &str, clusters: &[&str]) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: BindingSpec {
                username: username.to_string(),
                role_name: role.to_string(),
                clusters: clusters.iter().map(|c| c.to_string()).collect(),
                finalizers: Vec::new(),
            },
            status: BindingStatus::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !is_dns1123_subdomain(&self.metadata.namespace) {
            return Err(AppError::Validation(
                "binding namespace must be a valid DNS-1123 name".to_string(),
            ));
        }
        if !is_dns1123_subdomain(&self.metadata.name) {
            return Err(AppError::Validation(format!(
                "invalid binding name \"{}\"",
                self.metadata.name
            )));
        }
        self.spec.validate()?;
        Ok(())
    }

    /// clusters == ["*"]
    pub fn dispatches_all_clusters(&self) -> bool {
        self.spec.clusters.len() == 1 && self.spec.clusters[0] == ALL_CLUSTERS
    }

    /// 由 spec 推导系统标签，覆盖调用方提供的同名标签
    pub fn apply_derived_labels(&mut self) {
        let labels = derived_labels(&self.spec);
        for key in [
            LABEL_ROLE_NAMESPACE,
            LABEL_ROLE_NAME,
            LABEL_USERNAME,
            LABEL_DISPATCH_ALL_CLUSTERS,
        ] {
            self.metadata.labels.remove(key);
        }
        self.metadata.labels.extend(labels);
    }
}

fn derived_labels(spec: &BindingSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some((namespace, name)) = spec.role_name.split_once('/') {
        labels.insert(LABEL_ROLE_NAMESPACE.to_string(), namespace.to_string());
        labels.insert(LABEL_ROLE_NAME.to_string(), name.to_string());
    }
    labels.insert(LABEL_USERNAME.to_string(), spec.username.clone());
    let all = spec.clusters.len() == 1 && spec.clusters[0] == ALL_CLUSTERS;
    labels.insert(LABEL_DISPATCH_ALL_CLUSTERS.to_string(), all.to_string());
    labels
}

impl Resource for MultiClusterRoleBinding {
    const KIND: &'static str = "MultiClusterRoleBinding";
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
        self.status.phase = BindingPhase::Terminating;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_labels() {
        let mut binding =
            MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", &["*"]);
        binding
            .metadata
            .labels
            .insert(LABEL_ROLE_NAME.to_string(), "forged".to_string());
        binding.apply_derived_labels();

        let labels = &binding.metadata.labels;
        assert_eq!(labels[LABEL_ROLE_NAMESPACE], "tenant-a");
        assert_eq!(labels[LABEL_ROLE_NAME], "r1");
        assert_eq!(labels[LABEL_USERNAME], "alice");
        assert_eq!(labels[LABEL_DISPATCH_ALL_CLUSTERS], "true");
        assert!(binding.dispatches_all_clusters());
    }

    #[test]
    fn test_set_condition_reports_change() {
        let mut status = BindingStatus::default();
        let failed = BindingCondition {
            condition_type: CONDITION_DISPATCHED.to_string(),
            status: "False".to_string(),
            reason: "DispatchFailed".to_string(),
            message: "cluster c1 unreachable".to_string(),
            last_transition_time: Some(Utc::now()),
        };
        assert!(status.set_condition(failed.clone()));
        assert!(!status.set_condition(failed));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.condition(CONDITION_DISPATCHED).map(|c| c.status.as_str()),
            Some("False")
        );
    }
}
