//! 默认 Provider（空名称），所有操作为空操作

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{Provider, ProviderError, Subject};
use crate::models::{MultiClusterRoleBinding, PolicyRule};

pub const DEFAULT_PROVIDER_NAME: &str = "";

#[derive(Debug, Default, Clone, Copy)]
pub struct DelegateProvider;

#[async_trait]
impl Provider for DelegateProvider {
    fn name(&self) -> &str {
        DEFAULT_PROVIDER_NAME
    }

    fn on_filter(&self, _annotations: &BTreeMap<String, String>) -> bool {
        true
    }

    async fn get_tenant_clusters(&self, _tenant_id: &str) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    async fn get_subject(&self, username: &str, _cluster: &str) -> Result<Subject, ProviderError> {
        Ok(Subject::user(username))
    }

    async fn dispatch_multi_cluster_role_binding(
        &self,
        _binding: &MultiClusterRoleBinding,
        _rules: &[PolicyRule],
        _subjects: &BTreeMap<String, Subject>,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete_unbinding_resources(
        &self,
        _binding: &MultiClusterRoleBinding,
        _removed_clusters: &[String],
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete_multi_cluster_role_binding_resources(
        &self,
        _binding: &MultiClusterRoleBinding,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}
