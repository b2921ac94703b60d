//! clawrouter 主入口

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use clawrouter::channels::memory::{MemoryHub, MemoryHubConfig};
use clawrouter::core::dedup::report;
use clawrouter::core::message::sender::UnifiedMessageSender;
use clawrouter::infra::config::{Config, ConfigLoader};
use clawrouter::infra::db::Database;
use clawrouter::infra::error::Result;
use clawrouter::infra::logging::{self, LogLevel, LoggingConfig};
use clawrouter::service::RouterService;

// 命令行参数解析结构体
#[derive(Parser, Debug)]
#[command(name = "clawrouter")]
#[command(author = "Yang Hao <apprank@outlook.com>")]
#[command(version = "0.1.0")]
#[command(about = "带链路去重（恰好一次转发）的消息路由器", long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "clawrouter.toml")]
    config: String,

    /// 是否启用 verbose 模式（显示 DEBUG 日志）
    #[arg(short, long)]
    verbose: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

// 子命令枚举
#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动路由器服务
    Start,
    /// 检查配置文件是否有效
    Check,
    /// 显示所有链路的去重状态
    Status {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 显示版本信息
    Version,
}

// 主函数
#[tokio::main]
async fn main() {
    // 加载 .env 文件
    dotenv::dotenv().ok();

    let args = Args::parse();

    let result = match args.command {
        Some(Commands::Start) | None => run_service(&args.config, args.verbose).await,
        Some(Commands::Check) => check_config(&args.config).await,
        Some(Commands::Status { json }) => show_status(&args.config, json).await,
        Some(Commands::Version) => {
            println!("clawrouter v0.1.0");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!(error = %e, "命令执行失败");
        eprintln!("错误: {}", e);
        std::process::exit(1);
    }
}

async fn load_config(path: &str) -> Result<Config> {
    let config = ConfigLoader::new().load(path).await?;
    config.validate()?;
    Ok(config)
}

// 启动路由器服务
async fn run_service(config_path: &str, verbose: bool) -> Result<()> {
    let config = load_config(config_path).await?;

    let mut logging_config = LoggingConfig::from_section(&config.logging);
    if verbose {
        logging_config.level = LogLevel::Debug;
    }
    logging::init(&logging_config)?;

    info!(version = "0.1.0", path = config_path, router = %config.router.name, "clawrouter 启动");

    // 进程内传输：本节点一个端点，其他目标各一个只记录日志的端点
    let hub = MemoryHub::new(MemoryHubConfig::default());
    let local = hub.register(&config.router.name);

    let mut peers: Vec<String> = config
        .deduplication
        .outbound
        .iter()
        .chain(config.routes.iter().flat_map(|r| r.destinations.iter()))
        .filter(|d| **d != config.router.name)
        .cloned()
        .collect();
    peers.sort();
    peers.dedup();

    let sender = UnifiedMessageSender::new();
    sender.register(&config.router.name, hub.clone()).await;
    for peer in &peers {
        sender.register(peer, hub.clone()).await;
    }

    let service = Arc::new(RouterService::new(config, Arc::new(sender)).await?);

    for peer in peers {
        let mut endpoint = hub.register(&peer);
        tokio::spawn(async move {
            while let Some(message) = endpoint.recv().await {
                info!(endpoint = %endpoint.name(), message_id = %message.id, headers = ?message.headers, "端点收到消息");
            }
        });
    }

    let receiver = local.serve(service.clone(), service.subscribe_shutdown());
    service.start().await?;

    info!("服务运行中，按 Ctrl+C 停止");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "监听 Ctrl+C 信号失败");
    }

    service.stop().await;
    let _ = receiver.await;
    info!("服务退出");
    Ok(())
}

// 检查配置文件是否有效
async fn check_config(config_path: &str) -> Result<()> {
    println!("验证配置文件: {}", config_path);

    let config = load_config(config_path).await?;
    println!("配置验证成功!");
    println!("- 节点名称: {}", config.router.name);
    println!("- 数据库: {}", config.router.db_path);
    println!("- 窗口宽度: {}", config.deduplication.epoch_size);
    println!("- 出站去重目标: {:?}", config.deduplication.outbound);
    println!("- 入站去重接口: {:?}", config.deduplication.inbound_interfaces);
    println!("- 静态路由: {}", config.routes.len());
    Ok(())
}

// 显示链路状态
async fn show_status(config_path: &str, json: bool) -> Result<()> {
    let config = load_config(config_path).await?;
    let db = Database::new_with_pool(&config.router.db_path, config.router.max_connections).await?;
    let reports = report::link_report(&db).await?;
    db.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("没有链路");
        return Ok(());
    }
    println!(
        "{:<8} {:<16} {:<16} {:>6} {:>9} {:>16} {:>16} {:>6}",
        "side", "source", "destination", "epoch", "announced", "head", "tail", "holes"
    );
    for r in reports {
        println!(
            "{:<8} {:<16} {:<16} {:>6} {:>9} {:>16} {:>16} {:>6}",
            r.side,
            r.source,
            r.destination,
            r.epoch,
            r.announced,
            format!("[{}, {})", r.head.0, r.head.1),
            format!("[{}, {})", r.tail.0, r.tail.1),
            r.tail_holes
        );
    }
    Ok(())
}
