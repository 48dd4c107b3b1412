//! 调谐控制器
//!
//! 每个控制器：informer 事件 → 工作队列 → 固定数量的 worker 调用 reconcile。
//! reconcile 出错按键指数退避重试，成功后重置退避；worker 内的 panic 被捕获，
//! 不会导致 worker 退出。

pub mod binding;
pub mod deleter;
pub mod informer;
pub mod policy;
pub mod role;

pub use binding::MultiClusterRoleBindingController;
pub use deleter::MultiClusterRoleBindingDeleter;
pub use informer::{wait_for_cache_sync, Informer, Lister, ResourceEventHandler};
pub use policy::PolicyController;
pub use role::RoleController;

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::concurrency::{ItemExponentialFailureRateLimiter, WorkQueue};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::models::Scope;
use crate::provider::ProviderRegistry;

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// 按控制器配置创建工作队列
pub fn new_queue(name: &'static str, config: &ControllerConfig) -> Arc<WorkQueue> {
    WorkQueue::new(
        name,
        ItemExponentialFailureRateLimiter::new(config.backoff_base(), config.backoff_max()),
    )
}

/// 只处理 MultiCluster 作用域且被 Provider 接受的对象
pub fn multi_cluster_filter(
    scope: Scope,
    annotations: &BTreeMap<String, String>,
    providers: &ProviderRegistry,
) -> bool {
    scope == Scope::MultiCluster && providers.accepts(annotations)
}

/// 等待 informer 同步后启动 worker，直到收到停止信号
///
/// 停止后不再出队，正在执行的 reconcile 会执行完。
pub async fn process_queue<R: Reconciler>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    synced: Vec<watch::Receiver<bool>>,
    config: &ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let name = reconciler.name();
    if let Err(e) = wait_for_cache_sync(name, synced, config.sync_timeout()).await {
        error!(controller = name, error = %e, "Failed to sync informer caches");
        queue.shut_down().await;
        return Err(e);
    }

    info!(controller = name, workers = config.workers, "Starting workers");
    let mut workers = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        workers.push(tokio::spawn(run_worker(
            reconciler.clone(),
            queue.clone(),
            worker_id,
        )));
    }

    shutdown.cancelled().await;
    info!(controller = name, "Shutting down workers");
    queue.shut_down().await;
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(controller = name, error = %e, "Worker task failed");
        }
    }
    info!(controller = name, "Controller stopped");
    Ok(())
}

async fn run_worker<R: Reconciler>(reconciler: Arc<R>, queue: Arc<WorkQueue>, worker_id: usize) {
    let name = reconciler.name();
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let result = AssertUnwindSafe(reconciler.reconcile(&key))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => {
                queue.forget(&key);
                "success"
            }
            Ok(Err(e)) if e.is_conflict() => {
                // 冲突说明对象已被并发修改，新的事件会再次触发调谐
                queue.forget(&key);
                debug!(controller = name, key = %key, error = %e, "Reconcile hit a conflict, not retrying");
                "conflict"
            }
            Ok(Err(e)) => {
                warn!(
                    controller = name,
                    key = %key,
                    requeues = queue.num_requeues(&key),
                    error = %e,
                    "Reconcile failed, requeueing"
                );
                queue.add_rate_limited(&key).await;
                "error"
            }
            Err(_) => {
                error!(controller = name, key = %key, worker_id, "Reconcile panicked, requeueing");
                queue.add_rate_limited(&key).await;
                "panic"
            }
        };

        metrics::counter!(
            "authz_reconcile_total",
            "controller" => name,
            "result" => outcome
        )
        .increment(1);
        debug!(
            controller = name,
            key = %key,
            result = outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reconcile finished"
        );
        queue.done(&key).await;
    }
    debug!(controller = name, worker_id, "Worker stopped");
}
