//! Policy domain model

use serde::{Deserialize, Serialize};

use super::{is_dns1123_subdomain, ObjectMeta, Resource};
use crate::error::AppError;

/// 资源作用域，只有 MultiCluster 参与跨集群调谐
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    Platform,
    MultiCluster,
    Business,
}

/// 单条权限规则
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub verbs: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
}

impl PolicyRule {
    pub fn new(verbs: &[&str], api_groups: &[&str], resources: &[&str]) -> Self {
        Self {
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
            api_groups: api_groups.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
            resource_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub tenant_id: String,
    /// 创建者
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Policy：命名的权限规则集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub metadata: ObjectMeta,
    pub spec: PolicySpec,
}

impl Policy {
    pub fn new(namespace: &str, name: &str, scope: Scope, rules: Vec<PolicyRule>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: PolicySpec {
                display_name: name.to_string(),
                tenant_id: namespace.to_string(),
                scope,
                rules,
                ..Default::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !is_dns1123_subdomain(&self.metadata.namespace) {
            return Err(AppError::Validation(
                "policy namespace must be a valid DNS-1123 name".to_string(),
            ));
        }
        if !is_dns1123_subdomain(&self.metadata.name) {
            return Err(AppError::Validation(format!(
                "invalid policy name \"{}\"",
                self.metadata.name
            )));
        }
        for (index, rule) in self.spec.rules.iter().enumerate() {
            if rule.verbs.is_empty() {
                return Err(AppError::Validation(format!(
                    "spec.rules[{}].verbs must not be empty",
                    index
                )));
            }
        }
        Ok(())
    }
}

impl Resource for Policy {
    const KIND: &'static str = "Policy";

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
}
