//! Informer：存储的本地只读镜像
//!
//! 先订阅 watch 再 list，list 的修订号之前的事件全部丢弃；之后按事件顺序更新
//! 镜像并回调处理器。watch 落后（lagged）时重新 list，与镜像做差量对比补发事件。

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::Resource;
use crate::repository::{ListOptions, MemoryStore, WatchEvent};

/// 事件处理器，回调按事件顺序串行执行
#[async_trait]
pub trait ResourceEventHandler<T: Resource>: Send + Sync {
    async fn on_add(&self, obj: &T);
    async fn on_update(&self, old: &T, new: &T);
    async fn on_delete(&self, obj: &T);
}

type Indexer<T> = Arc<RwLock<BTreeMap<String, T>>>;

/// 从本地镜像读取
pub struct Lister<T: Resource> {
    indexer: Indexer<T>,
}

impl<T: Resource> Clone for Lister<T> {
    fn clone(&self) -> Self {
        Self {
            indexer: self.indexer.clone(),
        }
    }
}

impl<T: Resource> Lister<T> {
    pub async fn get(&self, key: &str) -> Option<T> {
        self.indexer.read().await.get(key).cloned()
    }

    pub async fn list(&self, options: &ListOptions) -> Vec<T> {
        self.indexer
            .read()
            .await
            .values()
            .filter(|obj| options.matches(&obj.meta().namespace, &obj.meta().labels))
            .cloned()
            .collect()
    }
}

pub struct Informer<T: Resource> {
    store: Arc<MemoryStore<T>>,
    indexer: Indexer<T>,
    handlers: Vec<Arc<dyn ResourceEventHandler<T>>>,
    synced_tx: watch::Sender<bool>,
}

impl<T: Resource> Informer<T> {
    pub fn new(store: Arc<MemoryStore<T>>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            store,
            indexer: Arc::new(RwLock::new(BTreeMap::new())),
            handlers: Vec::new(),
            synced_tx,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ResourceEventHandler<T>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn lister(&self) -> Lister<T> {
        Lister {
            indexer: self.indexer.clone(),
        }
    }

    /// 初次 list 完成后变为 true
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut events = self.store.watch();
        let mut revision = self.resync().await;
        self.synced_tx.send_replace(true);
        info!(kind = T::KIND, revision, "Informer synced");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let event_revision = event.object().meta().resource_version;
                        if event_revision <= revision {
                            continue;
                        }
                        revision = event_revision;
                        self.apply(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kind = T::KIND, skipped, "Watch lagged, relisting");
                        revision = self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(kind = T::KIND, "Informer stopped");
    }

    async fn apply(&self, event: WatchEvent<T>) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let previous = self.indexer.write().await.insert(obj.key(), obj.clone());
                match previous {
                    Some(old) => self.notify_update(&old, &obj).await,
                    None => self.notify_add(&obj).await,
                }
            }
            WatchEvent::Deleted(obj) => {
                let previous = self.indexer.write().await.remove(&obj.key());
                // 镜像中没有说明已经通过 resync 处理过
                if let Some(old) = previous {
                    self.notify_delete(&old).await;
                }
            }
        }
    }

    /// 全量 list 并替换镜像，对差异补发回调
    async fn resync(&self) -> u64 {
        let listed = self.store.list(&ListOptions::all()).await;
        let fresh: BTreeMap<String, T> = listed
            .items
            .into_iter()
            .map(|obj| (obj.key(), obj))
            .collect();

        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        {
            let mut indexer = self.indexer.write().await;
            for (key, obj) in &fresh {
                match indexer.get(key) {
                    None => added.push(obj.clone()),
                    Some(old) if old.meta().resource_version != obj.meta().resource_version => {
                        updated.push((old.clone(), obj.clone()))
                    }
                    Some(_) => {}
                }
            }
            for (key, old) in indexer.iter() {
                if !fresh.contains_key(key) {
                    deleted.push(old.clone());
                }
            }
            *indexer = fresh;
        }

        for obj in &added {
            self.notify_add(obj).await;
        }
        for (old, new) in &updated {
            self.notify_update(old, new).await;
        }
        for obj in &deleted {
            self.notify_delete(obj).await;
        }
        listed.revision
    }

    async fn notify_add(&self, obj: &T) {
        for handler in &self.handlers {
            handler.on_add(obj).await;
        }
    }

    async fn notify_update(&self, old: &T, new: &T) {
        for handler in &self.handlers {
            handler.on_update(old, new).await;
        }
    }

    async fn notify_delete(&self, obj: &T) {
        for handler in &self.handlers {
            handler.on_delete(obj).await;
        }
    }
}

/// 等待所有 informer 完成初次同步
pub async fn wait_for_cache_sync(
    controller: &str,
    synced: Vec<watch::Receiver<bool>>,
    timeout: Duration,
) -> Result<()> {
    let all_synced = async {
        for mut receiver in synced {
            receiver
                .wait_for(|synced| *synced)
                .await
                .map_err(|_| AppError::internal_error("informer stopped before syncing"))?;
        }
        Ok::<(), AppError>(())
    };

    match tokio::time::timeout(timeout, all_synced).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Internal(format!(
            "{} controller: timed out waiting for caches to sync",
            controller
        ))),
    }
}
