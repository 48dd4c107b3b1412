//! 测试公共模块
//! 提供测试配置、运行中的控制面和轮询断言工具

#![allow(dead_code)]

use authz_controller::{
    app::ControlPlane,
    config::{AppConfig, ControllerConfig, LoggingConfig, ProviderConfig, ServerConfig},
    models::{
        Cluster, ClusterPhase, MultiClusterRoleBinding, ANNOTATION_PROVIDER_NAME,
    },
    provider::PLATFORM_PROVIDER_NAME,
};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TENANT: &str = "tenant-a";

/// 创建测试配置：无去抖、快速退避
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(), // 使用随机端口
            graceful_shutdown_timeout_secs: 5,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        controller: ControllerConfig {
            workers: 2,
            debounce_ms: 0,
            sync_timeout_secs: 5,
            backoff_base_ms: 5,
            backoff_max_secs: 1,
            watch_buffer: 256,
        },
        provider: ProviderConfig {
            platform_enabled: true,
            region: None,
        },
    }
}

/// 运行中的控制面，drop 时停止控制器
pub struct TestControlPlane {
    pub plane: ControlPlane,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<authz_controller::error::Result<()>>>,
}

impl TestControlPlane {
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let result = handle.await.expect("controller task panicked");
            assert!(result.is_ok(), "controller exited with error: {:?}", result);
        }
    }
}

impl Drop for TestControlPlane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::ops::Deref for TestControlPlane {
    type Target = ControlPlane;

    fn deref(&self) -> &ControlPlane {
        &self.plane
    }
}

/// 启动控制面（三个控制器都在运行）
pub fn start_control_plane() -> TestControlPlane {
    let plane = ControlPlane::new(create_test_config()).expect("Failed to build control plane");
    let shutdown = CancellationToken::new();
    let handles = plane.spawn(shutdown.clone());
    TestControlPlane {
        plane,
        shutdown,
        handles,
    }
}

/// 轮询直到条件成立，超时返回 false
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 交给 platform provider 处理的绑定
pub fn platform_binding(name: &str, role: &str, clusters: &[&str]) -> MultiClusterRoleBinding {
    let mut binding = MultiClusterRoleBinding::new(TENANT, name, "alice", role, clusters);
    binding.metadata.annotations.insert(
        ANNOTATION_PROVIDER_NAME.to_string(),
        PLATFORM_PROVIDER_NAME.to_string(),
    );
    binding
}

pub async fn create_running_clusters(plane: &ControlPlane, names: &[&str]) {
    for name in names {
        plane
            .clusters()
            .create(Cluster::new(name, TENANT, ClusterPhase::Running))
            .await
            .expect("Failed to create cluster");
    }
}
