//! 两阶段优雅删除
//!
//! Active（无删除时间戳）→ Terminating（设置删除时间戳，领域终结器非空）
//! → Deleted（终结器清空后再次删除，物理移除）。
//!
//! 每次删除都带 UID 前置条件，调用方未提供时使用存储中的 UID。
//! 物理移除只看领域终结器；通用终结器（orphan / foregroundDeletion）
//! 只被记录，没有垃圾回收器去处理它们。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Admission, Registry};
use crate::error::{AppError, Result};
use crate::models::{ObjectMeta, FINALIZER_DELETE_DEPENDENTS, FINALIZER_ORPHAN_DEPENDENTS};

/// 级联删除策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// DELETE 请求体
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Preconditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation_policy: Option<PropagationPolicy>,
}

impl DeleteOptions {
    /// 控制器级联删除使用的选项
    pub fn background(uid: &str) -> Self {
        Self {
            preconditions: Some(Preconditions {
                uid: Some(uid.to_string()),
            }),
            propagation_policy: Some(PropagationPolicy::Background),
        }
    }

    pub fn with_uid(uid: &str) -> Self {
        Self {
            preconditions: Some(Preconditions {
                uid: Some(uid.to_string()),
            }),
            propagation_policy: None,
        }
    }

    fn uid(&self) -> Option<&str> {
        self.preconditions
            .as_ref()
            .and_then(|p| p.uid.as_deref())
            .filter(|uid| !uid.is_empty())
    }
}

/// 删除结果
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome<T> {
    /// 已进入 Terminating，等待终结器清空
    Terminating(T),
    /// 已物理删除
    Deleted(T),
}

impl<T> DeleteOutcome<T> {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted(_))
    }

    pub fn object(&self) -> &T {
        match self {
            DeleteOutcome::Terminating(obj) | DeleteOutcome::Deleted(obj) => obj,
        }
    }

    pub fn into_object(self) -> T {
        match self {
            DeleteOutcome::Terminating(obj) | DeleteOutcome::Deleted(obj) => obj,
        }
    }
}

/// 根据传播策略调整通用终结器，只应用差量
///
/// 指定了策略时，orphan 当且仅当 Orphan，foregroundDeletion 当且仅当
/// Foreground；未指定时保持现状。
pub fn apply_propagation_finalizers(meta: &mut ObjectMeta, policy: Option<PropagationPolicy>) {
    let want_orphan = policy
        .map(|p| p == PropagationPolicy::Orphan)
        .unwrap_or_else(|| meta.has_finalizer(FINALIZER_ORPHAN_DEPENDENTS));
    let want_foreground = policy
        .map(|p| p == PropagationPolicy::Foreground)
        .unwrap_or_else(|| meta.has_finalizer(FINALIZER_DELETE_DEPENDENTS));

    for (finalizer, wanted) in [
        (FINALIZER_ORPHAN_DEPENDENTS, want_orphan),
        (FINALIZER_DELETE_DEPENDENTS, want_foreground),
    ] {
        let present = meta.has_finalizer(finalizer);
        if wanted && !present {
            meta.finalizers.push(finalizer.to_string());
        } else if !wanted && present {
            meta.finalizers.retain(|f| f != finalizer);
        }
    }
}

impl<T: Admission> Registry<T> {
    /// 删除对象，按资源类型走优雅删除或直接删除
    pub async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteOutcome<T>> {
        let current = self.store().get(key).await?;
        let live_uid = current.meta().uid.clone();
        let uid = match options.uid() {
            Some(uid) if uid != live_uid => {
                return Err(AppError::Conflict(format!(
                    "Precondition failed: UID in precondition: {}, UID in object meta: {}",
                    uid, live_uid
                )));
            }
            Some(uid) => uid.to_string(),
            None => live_uid,
        };

        if T::GRACEFUL {
            self.delete_gracefully(key, &uid, current, options.propagation_policy)
                .await
        } else {
            self.delete_immediately(key, &uid, current).await
        }
    }

    async fn delete_gracefully(
        &self,
        key: &str,
        uid: &str,
        current: T,
        propagation: Option<PropagationPolicy>,
    ) -> Result<DeleteOutcome<T>> {
        if current.meta().deletion_timestamp.is_none() {
            let updated = self
                .store()
                .guaranteed_update(key, Some(uid), |mut obj| {
                    if obj.meta().deletion_timestamp.is_none() {
                        obj.meta_mut().deletion_timestamp = Some(Utc::now());
                    }
                    obj.mark_terminating();
                    apply_propagation_finalizers(obj.meta_mut(), propagation);
                    Ok(obj)
                })
                .await?;
            info!(
                kind = T::KIND,
                key = %key,
                finalizers = ?updated.finalizers(),
                "Resource is terminating"
            );
            return Ok(DeleteOutcome::Terminating(updated));
        }

        let removed = self
            .store()
            .remove_if(key, Some(uid), |obj| {
                if obj.finalizers().is_empty() {
                    Ok(())
                } else {
                    Err(AppError::Conflict(format!(
                        "The system is ensuring all content is removed from this {kind}. Upon completion, this {kind} will automatically be purged by the system.",
                        kind = T::KIND
                    )))
                }
            })
            .await?;
        info!(kind = T::KIND, key = %key, "Resource deleted");
        Ok(DeleteOutcome::Deleted(removed))
    }

    async fn delete_immediately(&self, key: &str, uid: &str, current: T) -> Result<DeleteOutcome<T>> {
        // 已在删除中且领域终结器已清空：与优雅删除一致，不再等待通用终结器
        let finalized = current.meta().deletion_timestamp.is_some() && current.finalizers().is_empty();
        let pending = !current.finalizers().is_empty() || !current.meta().finalizers.is_empty();
        if pending && !finalized {
            // 还有终结器：只打删除时间戳
            let updated = self
                .store()
                .guaranteed_update(key, Some(uid), |mut obj| {
                    if obj.meta().deletion_timestamp.is_none() {
                        obj.meta_mut().deletion_timestamp = Some(Utc::now());
                    }
                    Ok(obj)
                })
                .await?;
            debug!(kind = T::KIND, key = %key, "Resource marked for deletion, finalizers pending");
            return Ok(DeleteOutcome::Terminating(updated));
        }

        let removed = self.store().remove(key, Some(uid)).await?;
        info!(kind = T::KIND, key = %key, "Resource deleted");
        Ok(DeleteOutcome::Deleted(removed))
    }
}
