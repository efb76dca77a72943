//! 权益服务主入口

use entitlement_core::{
    config::AppConfig,
    db,
    handlers::health,
    middleware::AppState,
    providers::{MockIdentityProvider, MockPaymentProvider, MockSeatProvisioner},
    repository::{MemoryStore, Stores},
    routes,
    services::Providers,
    telemetry,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();
    let mut in_memory = false;

    if let Some(arg) = args.get(1) {
        match arg.as_str() {
            "--version" => {
                println!("entitlement-core {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            "--in-memory" => in_memory = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    if let Ok(name) = std::env::var("APP_ENV_FILE") {
        dotenv::from_filename(name).ok();
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

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Entitlement core starting");

    // 3. 存储：PostgreSQL 或进程内存
    let (stores, pool) = if in_memory {
        tracing::warn!("Running with in-memory storage, state is lost on restart");
        (Stores::memory(Arc::new(MemoryStore::new())), None)
    } else {
        let pool = db::create_pool(&config.database).await?;
        db::prepare_schema(&pool, &config.database).await?;
        tracing::info!("Database initialized");
        (Stores::postgres(pool.clone()), Some(pool))
    };

    // 4. 外部协作方
    if config.payment.secret_key.is_none() {
        tracing::warn!("No payment provider key configured, checkout sessions are simulated");
    }
    let providers = Providers {
        payment: Arc::new(MockPaymentProvider::new()),
        identity: Arc::new(MockIdentityProvider::permissive()),
        provisioner: Arc::new(MockSeatProvisioner::new()),
    };

    // 5. 构建应用状态
    let app_state = Arc::new(AppState::build(config.clone(), stores, providers, pool).await?);

    // 群组成员加入时自动分配批量授权席位
    let auto_assign = app_state
        .batch_service
        .clone()
        .spawn_auto_assign(app_state.event_bus.subscribe());

    // 6. 构建路由
    let app = routes::create_router(app_state.clone());

    // 7. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
        .await?;

    auto_assign.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 收到信号后开始关闭；超过时限仍未结束则强制退出。
async fn shutdown_signal(timeout_secs: u64) {
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
    }

    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("entitlement-core {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: entitlement-core [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!("  --in-memory   使用进程内存存储（开发调试）");
    println!();
    println!("环境变量:");
    println!("  所有配置通过环境变量完成（APP_ 前缀，嵌套用 __ 分隔）");
    println!("  DATABASE_URL、FRONTEND_URL、STRIPE_SECRET_KEY 等无前缀变量同样生效");
}
