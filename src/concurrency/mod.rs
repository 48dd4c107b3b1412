//! 控制器并发原语
//! 去重、防抖、限速重试的工作队列，以及按键指数退避的限速器

pub mod queue;

pub use queue::WorkQueue;

use dashmap::DashMap;
use std::time::Duration;

/// 按键指数退避：base * 2^失败次数，上限 max；成功后 forget 重置
pub struct ItemExponentialFailureRateLimiter {
    failures: DashMap<String, u32>,
    base: Duration,
    max: Duration,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base,
            max,
        }
    }

    /// 记录一次失败并返回应等待的时长
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        if exponent >= 32 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exponent)
            .map(|backoff| backoff.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }
}
