//! Role domain model

use serde::{Deserialize, Serialize};

use super::{is_dns1123_subdomain, parse_reference, ObjectMeta, Resource, Scope};
use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: Scope,
    /// Policy 引用（"namespace/name"），可能悬空，使用时再解析
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Role：一组 Policy 的命名集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub metadata: ObjectMeta,
    pub spec: RoleSpec,
}

impl Role {
    pub fn new(namespace: &str, name: &str, scope: Scope, policies: &[&str]) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: RoleSpec {
                display_name: name.to_string(),
                tenant_id: namespace.to_string(),
                scope,
                policies: policies.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    pub fn references(&self, policy_key: &str) -> bool {
        self.spec.policies.iter().any(|p| p == policy_key)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !is_dns1123_subdomain(&self.metadata.namespace) {
            return Err(AppError::Validation(
                "role namespace must be a valid DNS-1123 name".to_string(),
            ));
        }
        if !is_dns1123_subdomain(&self.metadata.name) {
            return Err(AppError::Validation(format!(
                "invalid role name \"{}\"",
                self.metadata.name
            )));
        }
        for policy in &self.spec.policies {
            parse_reference(policy)?;
        }
        Ok(())
    }
}

impl Resource for Role {
    const KIND: &'static str = "Role";
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
}
