//! MultiClusterRoleBinding 终结：拆除成员集群中的资源，然后清空终结器并完成删除

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::MultiClusterRoleBinding;
use crate::provider::Provider;
use crate::registry::{DeleteOptions, Registry};

pub struct MultiClusterRoleBindingDeleter {
    bindings: Registry<MultiClusterRoleBinding>,
}

impl MultiClusterRoleBindingDeleter {
    pub fn new(bindings: Registry<MultiClusterRoleBinding>) -> Self {
        Self { bindings }
    }

    /// provider 拆除失败时保留终结器，错误交由队列重试
    pub async fn delete(
        &self,
        binding: &MultiClusterRoleBinding,
        provider: Arc<dyn Provider>,
    ) -> Result<()> {
        provider
            .delete_multi_cluster_role_binding_resources(binding)
            .await?;
        debug!(
            binding = %binding.metadata.key(),
            provider = provider.name(),
            "Dispatched resources removed"
        );
        self.finalize_and_remove(binding).await
    }

    /// 清空终结器并按 UID 删除，不做拆除
    pub async fn finalize_and_remove(&self, binding: &MultiClusterRoleBinding) -> Result<()> {
        let key = binding.metadata.key();
        let uid = binding.metadata.uid.as_str();

        match self.bindings.finalize(&key, Vec::new(), Some(uid)).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.bindings.delete(&key, DeleteOptions::with_uid(uid)).await {
            Ok(_) => {
                info!(binding = %key, "Binding finalized and deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        member_object_name, InMemoryMemberClusters, PlatformProvider, StoreClusterDirectory,
        Subject,
    };
    use crate::repository::MemoryStore;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_teardown_failure_keeps_finalizer() {
        let bindings: Registry<MultiClusterRoleBinding> =
            Registry::new(Arc::new(MemoryStore::new(16)));
        let members = Arc::new(InMemoryMemberClusters::new());
        let provider: Arc<dyn Provider> = Arc::new(PlatformProvider::new(
            Arc::new(StoreClusterDirectory::new(Arc::new(MemoryStore::new(16)))),
            members.clone(),
            None,
        ));

        let binding = bindings
            .create(MultiClusterRoleBinding::new(
                "tenant-a",
                "b1",
                "alice",
                "tenant-a/r1",
                &["c1"],
            ))
            .await
            .unwrap();
        let subjects = BTreeMap::from([("c1".to_string(), Subject::user("alice"))]);
        provider
            .dispatch_multi_cluster_role_binding(&binding, &[], &subjects)
            .await
            .unwrap();
        let terminating = bindings
            .delete("tenant-a/b1", DeleteOptions::default())
            .await
            .unwrap()
            .into_object();

        let deleter = MultiClusterRoleBindingDeleter::new(bindings.clone());
        members.set_unreachable("c1", true);
        assert!(deleter.delete(&terminating, provider.clone()).await.is_err());
        assert!(!bindings
            .get("tenant-a/b1")
            .await
            .unwrap()
            .spec
            .finalizers
            .is_empty());

        members.set_unreachable("c1", false);
        deleter.delete(&terminating, provider).await.unwrap();
        assert!(bindings.get("tenant-a/b1").await.unwrap_err().is_not_found());
        assert!(members
            .clusters_with_binding(&member_object_name(&binding))
            .is_empty());
    }
}
