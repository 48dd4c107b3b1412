//! 资源存储层
//! 带版本号的对象存储：CRUD、标签过滤、watch 事件流和乐观并发控制

pub mod memory;

pub use memory::*;

use std::collections::BTreeMap;

/// watch 事件；事件中对象的 resource_version 即该事件的修订号
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn into_object(self) -> T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// 列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// None 表示所有命名空间
    pub namespace: Option<String>,
    /// 等值匹配的标签选择器
    pub label_selector: BTreeMap<String, String>,
}

impl ListOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.label_selector
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        if let Some(ns) = &self.namespace {
            if ns != namespace {
                return false;
            }
        }
        self.label_selector
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

/// 列表结果，revision 为列出时存储的最新修订号
#[derive(Debug, Clone)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    pub revision: u64,
}
