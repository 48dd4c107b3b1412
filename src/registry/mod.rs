//! 资源注册表
//! 在存储之上施加准入（校验、系统标签、默认终结器）和删除状态机

pub mod deletion;
pub mod strategy;

pub use deletion::*;
pub use strategy::Admission;

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::ObjectMeta;
use crate::repository::{ListOptions, ListResult, MemoryStore};

pub struct Registry<T: Admission> {
    store: Arc<MemoryStore<T>>,
}

impl<T: Admission> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<T: Admission> Registry<T> {
    pub fn new(store: Arc<MemoryStore<T>>) -> Self {
        Self { store }
    }

    /// 底层存储，供 informer 订阅
    pub fn store(&self) -> &Arc<MemoryStore<T>> {
        &self.store
    }

    pub async fn create(&self, mut obj: T) -> Result<T> {
        if !T::NAMESPACED && !obj.meta().namespace.is_empty() {
            return Err(AppError::validation(&format!(
                "{} is cluster-scoped and must not carry a namespace",
                T::KIND
            )));
        }
        obj.prepare_for_create();
        obj.validate()?;
        let created = self.store.create(obj).await?;
        info!(kind = T::KIND, key = %created.key(), uid = %created.meta().uid, "Resource created");
        Ok(created)
    }

    pub async fn get(&self, key: &str) -> Result<T> {
        self.store.get(key).await
    }

    pub async fn list(&self, options: &ListOptions) -> ListResult<T> {
        self.store.list(options).await
    }

    /// 更新 spec 与元数据；领域终结器和状态只能通过子资源修改
    pub async fn update(&self, mut obj: T) -> Result<T> {
        let old = self.store.get(&obj.key()).await?;
        obj.prepare_for_update(&old);
        obj.validate()?;
        let updated = self.store.update(obj).await?;
        debug!(kind = T::KIND, key = %updated.key(), revision = updated.meta().resource_version, "Resource updated");
        Ok(updated)
    }

    /// status 子资源：只接受调用方的状态部分
    pub async fn update_status(&self, obj: T) -> Result<T> {
        let old = self.store.get(&obj.key()).await?;
        let mut merged = old;
        merged.copy_status_from(&obj);
        merged.meta_mut().resource_version = obj.meta().resource_version;
        self.store.update(merged).await
    }

    /// finalize 子资源：替换领域终结器列表
    pub async fn finalize(
        &self,
        key: &str,
        finalizers: Vec<String>,
        uid: Option<&str>,
    ) -> Result<T> {
        let finalized = self
            .store
            .guaranteed_update(key, uid, |mut obj| {
                obj.set_finalizers(finalizers);
                Ok(obj)
            })
            .await?;
        debug!(kind = T::KIND, key = %key, finalizers = ?finalized.finalizers(), "Resource finalized");
        Ok(finalized)
    }

    /// 原子地修改元数据（注解、标签），供控制器写入标记使用
    pub async fn patch_metadata<F>(&self, key: &str, uid: Option<&str>, patch: F) -> Result<T>
    where
        F: FnOnce(&mut ObjectMeta),
    {
        self.store
            .guaranteed_update(key, uid, |mut obj| {
                patch(obj.meta_mut());
                Ok(obj)
            })
            .await
    }
}
