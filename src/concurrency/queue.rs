//! 控制器工作队列
//!
//! - 同一个键同时最多只有一个 worker 在处理
//! - 等待中的键去重；处理中被再次加入的键在 done 之后重新入队
//! - add_after 期间重复加入的键合并为一次

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use super::ItemExponentialFailureRateLimiter;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    waiting: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: ItemExponentialFailureRateLimiter,
}

impl WorkQueue {
    pub fn new(name: &'static str, limiter: ItemExponentialFailureRateLimiter) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// 延迟加入；等待期间重复加入的同一个键只生效一次
    pub async fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }
        {
            let mut state = self.state.lock().await;
            if state.shutting_down || !state.waiting.insert(key.to_string()) {
                return;
            }
        }

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.state.lock().await.waiting.remove(&key);
            queue.add(&key).await;
        });
    }

    /// 按失败次数指数退避后重新入队
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.limiter.when(key);
        metrics::counter!("authz_queue_requeue_total", "queue" => self.name).increment(1);
        trace!(queue = self.name, key = %key, delay_ms = delay.as_millis() as u64, "Requeue with backoff");
        self.add_after(key, delay).await;
    }

    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// 阻塞直到有键可处理；关闭后返回 None
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 先注册，避免错过 shut_down 的 notify_waiters
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                let next = state.queue.pop_front();
                if let Some(key) = next {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// 处理结束；处理期间被再次加入的键重新入队
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// 等待处理的键数量
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_pending_keys_are_deduplicated() {
        let queue = queue();
        queue.add("ns/a").await;
        queue.add("ns/a").await;
        queue.add("ns/b").await;
        assert_eq!(queue.len().await, 2);

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_key_readded_while_processing_waits_for_done() {
        let queue = queue();
        queue.add("ns/a").await;
        let key = queue.get().await.unwrap();

        queue.add("ns/a").await;
        // 处理中，不会被第二个 worker 取到
        assert!(queue.is_empty().await);

        queue.done(&key).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn test_add_after_coalesces() {
        let queue = queue();
        queue.add_after("ns/a", Duration::from_millis(20)).await;
        queue.add_after("ns/a", Duration::from_millis(20)).await;
        assert!(queue.is_empty().await);

        let key = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("ns/a"));
        queue.done("ns/a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = queue();
        queue.add_rate_limited("ns/a").await;
        queue.add_rate_limited("ns/a").await;
        assert_eq!(queue.num_requeues("ns/a"), 2);

        let key = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("ns/a"));
        queue.forget("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 0);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_blocked_workers() {
        let queue = queue();
        let mut workers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            workers.push(tokio::spawn(async move { queue.get().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down().await;

        for worker in workers {
            let got = tokio::time::timeout(Duration::from_secs(2), worker)
                .await
                .unwrap()
                .unwrap();
            assert!(got.is_none());
        }
        queue.add("ns/a").await;
        assert!(queue.is_empty().await);
    }
}
