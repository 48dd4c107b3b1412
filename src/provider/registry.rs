//! Provider 注册表
//!
//! 启动时通过 builder 注册，build 之后只读。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

use super::default::{DelegateProvider, DEFAULT_PROVIDER_NAME};
use super::{Provider, ProviderError};
use crate::models::ANNOTATION_PROVIDER_NAME;

pub struct ProviderRegistryBuilder {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Default for ProviderRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistryBuilder {
    /// 默认 Provider 预先注册
    pub fn new() -> Self {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(DEFAULT_PROVIDER_NAME.to_string(), Arc::new(DelegateProvider));
        Self { providers }
    }

    /// 注册 Provider，名称重复返回错误
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<&mut Self, ProviderError> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(ProviderError::AlreadyRegistered(name));
        }
        info!(provider = %name, "Provider registered");
        self.providers.insert(name, provider);
        Ok(self)
    }

    pub fn build(self) -> ProviderRegistry {
        let default = self
            .providers
            .get(DEFAULT_PROVIDER_NAME)
            .cloned()
            .unwrap_or_else(|| Arc::new(DelegateProvider));
        ProviderRegistry {
            providers: self.providers,
            default,
        }
    }
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default: Arc<dyn Provider>,
}

impl ProviderRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn default_provider(&self) -> Arc<dyn Provider> {
        self.default.clone()
    }

    /// 按注解选择 Provider：无注解或空名称使用默认，未知名称返回 None
    pub fn for_annotations(&self, annotations: &BTreeMap<String, String>) -> Option<Arc<dyn Provider>> {
        match annotations.get(ANNOTATION_PROVIDER_NAME) {
            None => Some(self.default_provider()),
            Some(name) if name.is_empty() => Some(self.default_provider()),
            Some(name) => self.get(name),
        }
    }

    /// 对象是否应被控制器处理
    pub fn accepts(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.for_annotations(annotations)
            .map(|provider| provider.on_filter(annotations))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
