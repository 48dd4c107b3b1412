//! 授权控制面主入口

use authz_controller::{app::ControlPlane, config::AppConfig, handlers::health, routes, telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("authz-controller {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    if let Ok(path) = std::env::var("AUTHZ_ENV") {
        dotenv::from_filename(format!(".env.{}", path)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::from_filename(".env.development").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Authz controller starting...");

    // 3. 装配控制面，Provider 名称重复直接退出
    let control_plane = ControlPlane::new(config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to build control plane: {}", e))?;

    // 4. 启动控制器
    let shutdown = CancellationToken::new();
    let controllers = control_plane.spawn(shutdown.clone());

    // 5. 构建路由
    let app = routes::create_router(Arc::new(control_plane.app_state()));

    // 6. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    // 7. 优雅关闭：停止接收请求后再等待控制器退出
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    shutdown.cancel();

    let timeout = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    match tokio::time::timeout(timeout, futures::future::join_all(controllers)).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Controller exited with error"),
                    Err(e) => tracing::error!(error = %e, "Controller task failed"),
                }
            }
        }
        Err(_) => tracing::warn!("Graceful shutdown timeout reached, forcing exit"),
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理，控制器内部的取消同样会触发关闭
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested, starting graceful shutdown");
        },
    }

    shutdown.cancel();
}

/// 打印帮助信息
fn print_help() {
    println!("authz-controller {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: authz-controller [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 AUTHZ_ 前缀的环境变量完成，层级以 __ 分隔");
    println!("  例如 AUTHZ_SERVER__ADDR=0.0.0.0:9443");
}
