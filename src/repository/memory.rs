//! In-memory versioned object store
//!
//! 每种资源一个实例。所有写操作在同一把写锁下分配修订号并广播 watch 事件，
//! 因此事件顺序与修订号顺序严格一致；消费者落后（broadcast lagged）时需要
//! 重新 list 做全量同步。数据不持久化。

use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{ListOptions, ListResult, WatchEvent};
use crate::error::{AppError, Result};
use crate::models::Resource;

struct StoreState<T> {
    objects: BTreeMap<String, T>,
    revision: u64,
}

pub struct MemoryStore<T: Resource> {
    state: RwLock<StoreState<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> MemoryStore<T> {
    pub fn new(watch_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(watch_buffer.max(1));
        Self {
            state: RwLock::new(StoreState {
                objects: BTreeMap::new(),
                revision: 0,
            }),
            events,
        }
    }

    /// 订阅变更事件；先订阅再 list 可以保证不丢事件
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }

    pub async fn revision(&self) -> u64 {
        self.state.read().await.revision
    }

    pub async fn get(&self, key: &str) -> Result<T> {
        let state = self.state.read().await;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::not_found(T::KIND, key))
    }

    pub async fn list(&self, options: &ListOptions) -> ListResult<T> {
        let state = self.state.read().await;
        let items = state
            .objects
            .values()
            .filter(|obj| {
                let meta = obj.meta();
                options.matches(&meta.namespace, &meta.labels)
            })
            .cloned()
            .collect();
        ListResult {
            items,
            revision: state.revision,
        }
    }

    /// 创建对象，分配 uid、版本号和时间戳
    pub async fn create(&self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let mut state = self.state.write().await;
        if state.objects.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "{} \"{}\" already exists",
                T::KIND,
                key
            )));
        }

        state.revision += 1;
        let now = Utc::now();
        let meta = obj.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = state.revision;
        meta.creation_timestamp = Some(now);
        meta.update_timestamp = Some(now);
        meta.deletion_timestamp = None;

        state.objects.insert(key.clone(), obj.clone());
        let _ = self.events.send(WatchEvent::Added(obj.clone()));
        debug!(kind = T::KIND, key = %key, revision = state.revision, "Object created");
        Ok(obj)
    }

    /// 全量更新
    ///
    /// resource_version 非 0 时必须与存储中的版本一致；uid 非空时必须一致。
    /// 删除时间戳由删除流程维护，这里保持原值。
    pub async fn update(&self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::not_found(T::KIND, &key))?;

        let expected = obj.meta().resource_version;
        if expected != 0 && expected != current.meta().resource_version {
            return Err(AppError::Conflict(format!(
                "the object {} \"{}\" has been modified; please apply your changes to the latest version and try again",
                T::KIND,
                key
            )));
        }
        if !obj.meta().uid.is_empty() && obj.meta().uid != current.meta().uid {
            return Err(AppError::Conflict(format!(
                "uid precondition failed for {} \"{}\"",
                T::KIND,
                key
            )));
        }
        obj.meta_mut().deletion_timestamp = current.meta().deletion_timestamp;

        Ok(self.commit(&mut state, key, current, obj))
    }

    /// 在写锁内读取-修改-写回，不会因并发写入失败
    pub async fn guaranteed_update<F>(
        &self,
        key: &str,
        uid_precondition: Option<&str>,
        mutate: F,
    ) -> Result<T>
    where
        F: FnOnce(T) -> Result<T>,
    {
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::not_found(T::KIND, key))?;
        check_uid::<T>(key, &current, uid_precondition)?;

        let updated = mutate(current.clone())?;
        Ok(self.commit(&mut state, key.to_string(), current, updated))
    }

    /// 物理删除对象
    pub async fn remove(&self, key: &str, uid_precondition: Option<&str>) -> Result<T> {
        self.remove_if(key, uid_precondition, |_| Ok(())).await
    }

    /// 条件删除：precondition 在写锁内对当前对象求值，失败则不删除
    pub async fn remove_if<F>(
        &self,
        key: &str,
        uid_precondition: Option<&str>,
        precondition: F,
    ) -> Result<T>
    where
        F: FnOnce(&T) -> Result<()>,
    {
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(key)
            .ok_or_else(|| AppError::not_found(T::KIND, key))?;
        check_uid::<T>(key, current, uid_precondition)?;
        precondition(current)?;

        let mut removed = match state.objects.remove(key) {
            Some(obj) => obj,
            None => return Err(AppError::not_found(T::KIND, key)),
        };
        state.revision += 1;
        removed.meta_mut().resource_version = state.revision;
        let _ = self.events.send(WatchEvent::Deleted(removed.clone()));
        debug!(kind = T::KIND, key = %key, revision = state.revision, "Object removed");
        Ok(removed)
    }

    /// 写回对象；内容没有变化时不分配新版本，也不广播事件
    fn commit(&self, state: &mut StoreState<T>, key: String, current: T, mut updated: T) -> T {
        {
            let old = current.meta();
            let meta = updated.meta_mut();
            meta.namespace = old.namespace.clone();
            meta.name = old.name.clone();
            meta.uid = old.uid.clone();
            meta.creation_timestamp = old.creation_timestamp;
            meta.resource_version = old.resource_version;
            meta.update_timestamp = old.update_timestamp;
        }
        if updated == current {
            return current;
        }

        state.revision += 1;
        let meta = updated.meta_mut();
        meta.resource_version = state.revision;
        meta.update_timestamp = Some(Utc::now());

        state.objects.insert(key.clone(), updated.clone());
        let _ = self.events.send(WatchEvent::Modified(updated.clone()));
        debug!(kind = T::KIND, key = %key, revision = state.revision, "Object updated");
        updated
    }
}

fn check_uid<T: Resource>(key: &str, current: &T, uid_precondition: Option<&str>) -> Result<()> {
    match uid_precondition {
        Some(uid) if !uid.is_empty() && uid != current.meta().uid => Err(AppError::Conflict(
            format!(
                "Precondition failed: UID in precondition: {}, UID in object meta: {} ({} \"{}\")",
                uid,
                current.meta().uid,
                T::KIND,
                key
            ),
        )),
        _ => Ok(()),
    }
}
