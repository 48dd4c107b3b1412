//! 配置系统
//! 从环境变量加载所有配置（前缀 AUTHZ_）

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:9443"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

/// 控制器运行参数
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// 每个控制器的 worker 数量
    pub workers: usize,
    /// 入队后对 worker 可见前的去抖延迟（毫秒）
    pub debounce_ms: u64,
    /// 等待 informer 完成初始同步的超时（秒）
    pub sync_timeout_secs: u64,
    /// 失败重试退避基数（毫秒）
    pub backoff_base_ms: u64,
    /// 失败重试退避上限（秒）
    pub backoff_max_secs: u64,
    /// watch 事件缓冲区大小
    pub watch_buffer: usize,
}

impl ControllerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            debounce_ms: 5000,
            sync_timeout_secs: 30,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            watch_buffer: 1024,
        }
    }
}

/// Provider 配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// 是否注册内置的 platform provider
    pub platform_enabled: bool,
    /// platform provider 所服务的地域（可选）
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub controller: ControllerConfig,
    pub provider: ProviderConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        settings = settings
            .set_default("server.addr", "0.0.0.0:9443")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("controller.workers", 4)?
            .set_default("controller.debounce_ms", 5000)?
            .set_default("controller.sync_timeout_secs", 30)?
            .set_default("controller.backoff_base_ms", 5)?
            .set_default("controller.backoff_max_secs", 1000)?
            .set_default("controller.watch_buffer", 1024)?
            .set_default("provider.platform_enabled", true)?;

        // 从环境变量加载配置（前缀为 AUTHZ_）
        settings = settings.add_source(
            Environment::with_prefix("AUTHZ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Message(format!(
                "Invalid server address: {}",
                self.server.addr
            )));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        if self.controller.workers == 0 || self.controller.workers > 64 {
            return Err(ConfigError::Message(
                "controller.workers must be between 1 and 64".to_string(),
            ));
        }

        if self.controller.backoff_base_ms == 0 {
            return Err(ConfigError::Message(
                "controller.backoff_base_ms must be greater than 0".to_string(),
            ));
        }

        if self.controller.backoff_base() > self.controller.backoff_max() {
            return Err(ConfigError::Message(
                "controller.backoff_base_ms must not exceed controller.backoff_max_secs"
                    .to_string(),
            ));
        }

        if self.controller.watch_buffer < 16 {
            return Err(ConfigError::Message(
                "controller.watch_buffer must be at least 16".to_string(),
            ));
        }

        if let Some(region) = &self.provider.region {
            if region.trim().is_empty() {
                return Err(ConfigError::Message(
                    "provider.region must not be blank when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}
