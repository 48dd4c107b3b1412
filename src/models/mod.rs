//! 资源领域模型
//! Policy / Role / MultiClusterRoleBinding / Cluster 以及公共元数据

pub mod binding;
pub mod cluster;
pub mod meta;
pub mod policy;
pub mod role;

pub use binding::*;
pub use cluster::*;
pub use meta::*;
pub use policy::*;
pub use role::*;

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

use crate::error::AppError;

/// API 组
pub const GROUP_NAME: &str = "authz.tkestack.io";
pub const API_VERSION: &str = "v1";

// ==================== 系统标签 ====================

pub const LABEL_ROLE_NAMESPACE: &str = "authz.tkestack.io/role-namespace";
pub const LABEL_ROLE_NAME: &str = "authz.tkestack.io/role-name";
pub const LABEL_USERNAME: &str = "authz.tkestack.io/username";
pub const LABEL_DISPATCH_ALL_CLUSTERS: &str = "authz.tkestack.io/dispatch-all-clusters";

// ==================== 系统注解 ====================

pub const ANNOTATION_LAST_DISPATCHED_CLUSTERS: &str = "authz.tkestack.io/last-dispatched-clusters";
pub const ANNOTATION_UPDATED_BY_POLICY_CONTROLLER: &str =
    "authz.tkestack.io/updated-by-policy-controller";
pub const ANNOTATION_UPDATED_BY_ROLE_CONTROLLER: &str = "authz.tkestack.io/update-by-role-controller";
pub const ANNOTATION_PROVIDER_NAME: &str = "authz.tkestack.io/provider-name";
pub const ANNOTATION_REGION: &str = "authz.tkestack.io/region";

// ==================== 终结器 ====================

/// 通用终结器：删除时孤立依赖对象
pub const FINALIZER_ORPHAN_DEPENDENTS: &str = "orphan";
/// 通用终结器：前台级联删除依赖对象
pub const FINALIZER_DELETE_DEPENDENTS: &str = "foregroundDeletion";

pub const ROLE_FINALIZER: &str = "role";
pub const BINDING_FINALIZER: &str = "multiclusterrolebinding";
pub const CLUSTER_FINALIZER: &str = "cluster";

/// 代表 "所有租户集群" 的通配符
pub const ALL_CLUSTERS: &str = "*";
/// 保留的全局伪集群，永远不是下发目标
pub const GLOBAL_CLUSTER: &str = "global";

/// 控制面管理的资源
///
/// 每种资源都携带 [`ObjectMeta`] 和一组领域终结器。`GRACEFUL` 为 true 的资源
/// 走两阶段删除（Active → Terminating → Deleted）。
pub trait Resource:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;
    const NAMESPACED: bool = true;
    const GRACEFUL: bool = false;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// 领域终结器（由 finalize 子资源维护）
    fn finalizers(&self) -> &[String];
    fn set_finalizers(&mut self, finalizers: Vec<String>);

    /// 进入 Terminating 时调用，带有 phase 的资源在此切换状态
    fn mark_terminating(&mut self) {}

    fn key(&self) -> String {
        self.meta().key()
    }
}

/// 由命名空间和名称生成对象键
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// 拆分对象键为 (namespace, name)
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("", key),
    }
}

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid DNS-1123 pattern")
});

/// 校验名称是否符合 DNS-1123 子域名规范
pub fn is_dns1123_subdomain(value: &str) -> bool {
    !value.is_empty() && value.len() <= 253 && DNS1123_SUBDOMAIN.is_match(value)
}

/// 解析 "namespace/name" 形式的引用
pub fn parse_reference(reference: &str) -> Result<(String, String), AppError> {
    let parts: Vec<&str> = reference.split('/').collect();
    match parts.as_slice() {
        [namespace, name] if is_dns1123_subdomain(namespace) && is_dns1123_subdomain(name) => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(AppError::Validation(format!(
            "invalid reference \"{}\": must be of the form namespace/name",
            reference
        ))),
    }
}

/// 控制器写入注解使用的时间戳格式
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("tenant-a/p1"), ("tenant-a", "p1"));
        assert_eq!(split_key("cls-1"), ("", "cls-1"));
        assert_eq!(object_key("", "cls-1"), "cls-1");
        assert_eq!(object_key("tenant-a", "p1"), "tenant-a/p1");
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            parse_reference("tenant-a/r1").unwrap(),
            ("tenant-a".to_string(), "r1".to_string())
        );
        assert!(parse_reference("r1").is_err());
        assert!(parse_reference("a/b/c").is_err());
        assert!(parse_reference("/r1").is_err());
        assert!(parse_reference("Tenant/r1").is_err());
    }

    #[test]
    fn test_timestamp_round_trip_keeps_ordering() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::nanoseconds(1);
        let parsed_earlier = parse_timestamp(&format_timestamp(earlier)).unwrap();
        let parsed_later = parse_timestamp(&format_timestamp(later)).unwrap();
        assert_eq!(parsed_earlier, earlier);
        assert!(parsed_later > parsed_earlier);
        assert!(parse_timestamp("yesterday").is_none());
    }
}
