//! Policy → Role 反向索引
//!
//! 只由 Role 事件构建，启动时为空，不持久化。PolicyController 通过它找到
//! 引用某个 Policy 的所有 Role。

use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::trace;

use crate::models::Role;

#[derive(Default)]
pub struct PolicyRoleCache {
    index: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl PolicyRoleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回引用该 Policy 的 Role 键快照
    pub async fn get_roles_by_policy(&self, policy_key: &str) -> BTreeSet<String> {
        let index = self.index.read().await;
        index.get(policy_key).cloned().unwrap_or_default()
    }

    pub async fn put_by_role(&self, role: &Role) {
        let role_key = role.metadata.key();
        let mut index = self.index.write().await;
        for policy in &role.spec.policies {
            index
                .entry(policy.clone())
                .or_default()
                .insert(role_key.clone());
        }
        trace!(role = %role_key, policies = ?role.spec.policies, "Role indexed");
    }

    /// policies 未变化时不做任何修改
    pub async fn update_by_role(&self, old: &Role, new: &Role) {
        if old.spec.policies == new.spec.policies {
            return;
        }

        let old_key = old.metadata.key();
        let new_key = new.metadata.key();
        let mut index = self.index.write().await;
        for policy in &old.spec.policies {
            if !new.spec.policies.contains(policy) || old_key != new_key {
                remove_from_bucket(&mut index, policy, &old_key);
            }
        }
        for policy in &new.spec.policies {
            index
                .entry(policy.clone())
                .or_default()
                .insert(new_key.clone());
        }
        trace!(role = %new_key, policies = ?new.spec.policies, "Role reindexed");
    }

    pub async fn delete_role(&self, role: &Role) {
        let role_key = role.metadata.key();
        let mut index = self.index.write().await;
        // 遍历全部桶，覆盖 policies 在删除前被改过的情况
        index.retain(|_, roles| {
            roles.remove(&role_key);
            !roles.is_empty()
        });
    }

    pub async fn delete_policy(&self, policy_key: &str) {
        self.index.write().await.remove(policy_key);
    }

    /// 被索引的 Policy 数量
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }
}

fn remove_from_bucket(index: &mut HashMap<String, BTreeSet<String>>, policy: &str, role_key: &str) {
    if let Some(roles) = index.get_mut(policy) {
        roles.remove(role_key);
        if roles.is_empty() {
            index.remove(policy);
        }
    }
}
