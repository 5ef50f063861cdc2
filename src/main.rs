use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

use notifier_hub::broadcast::{BroadcastTransport, LocalBus, SqliteBus};
use notifier_hub::clock::{to_datetime, Clock, SystemClock};
use notifier_hub::config::{Config, StorageBackend};
use notifier_hub::election;
use notifier_hub::storage::{MemoryStorage, SharedStorage, SqliteStorage};
use notifier_hub::tab::Tab;

#[derive(Parser)]
#[command(
    name = "notifier-hub",
    about = "Discord / Telegram / Twitch 通知聚合（多 Tab 选主 + 跨 Tab 广播）",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动若干共享同一 profile 的 tab
    Run {
        /// tab 数量
        #[arg(short, long, default_value_t = 1)]
        tabs: usize,

        /// 使用进程内存 profile（忽略配置中的 storage.backend）
        #[arg(long)]
        memory: bool,

        /// leader 连接后端转发 socket（relay.socket_path）
        #[arg(long)]
        relay: bool,
    },
    /// 显示当前 leader 记录
    Status,
    /// 初始化配置文件
    Init,
    /// 显示当前配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            tabs,
            memory,
            relay,
        } => run_hub(tabs, memory, relay).await?,
        Commands::Status => run_status().await?,
        Commands::Init => run_init()?,
        Commands::Config => run_config()?,
    }

    Ok(())
}

/// 每个 tab 一个存储句柄：内存句柄共享同一 profile，SQLite 句柄各自打开 profile 文件的连接
async fn open_storage(config: &Config, memory: bool, count: usize) -> Result<Vec<Arc<dyn SharedStorage>>> {
    if memory || config.storage.backend == StorageBackend::Memory {
        let profile = MemoryStorage::new();
        return Ok((0..count)
            .map(|_| Arc::new(profile.handle()) as Arc<dyn SharedStorage>)
            .collect());
    }

    let path = config.profile_dir()?.join("shared.db");
    let watch = Duration::from_millis(config.storage.watch_interval_ms);
    let mut handles: Vec<Arc<dyn SharedStorage>> = Vec::with_capacity(count);
    for _ in 0..count {
        let storage = SqliteStorage::open(&path, watch)
            .await
            .wrap_err_with(|| format!("打开 profile 失败: {}", path.display()))?;
        handles.push(Arc::new(storage));
    }
    Ok(handles)
}

/// 内存 profile 用进程内总线；SQLite profile 用数据库中的信封表，
/// 同一 profile 上的其他进程也能收到
async fn open_bus(config: &Config, memory: bool) -> Result<Arc<dyn BroadcastTransport>> {
    if memory || config.storage.backend == StorageBackend::Memory {
        return Ok(Arc::new(LocalBus::new(
            &config.broadcast.channel,
            config.broadcast.capacity,
        )));
    }

    let path = config.profile_dir()?.join("shared.db");
    let bus = SqliteBus::open(
        &path,
        &config.broadcast.channel,
        config.broadcast.capacity,
        config.broadcast.retain,
        Duration::from_millis(config.storage.watch_interval_ms),
    )
    .await
    .wrap_err_with(|| format!("打开广播频道失败: {}", path.display()))?;
    Ok(Arc::new(bus))
}

async fn run_hub(count: usize, memory: bool, relay: bool) -> Result<()> {
    if count == 0 {
        bail!("--tabs must be at least 1");
    }
    let config = Config::load_or_init()?;

    let relay_socket = if relay {
        Some(
            config
                .relay
                .socket_path
                .clone()
                .ok_or_else(|| eyre!("relay.socket_path 未配置"))?,
        )
    } else {
        None
    };

    let bus = open_bus(&config, memory).await?;
    let storages = open_storage(&config, memory, count).await?;

    let mut tabs = Vec::with_capacity(count);
    for storage in storages {
        let mut builder = Tab::builder(config.clone())
            .storage(storage)
            .bus(bus.clone());
        if let Some(path) = &relay_socket {
            builder = builder.relay(path.clone());
        }
        tabs.push(Arc::new(builder.build()?));
    }

    for tab in &tabs {
        tab.start();
        let mut leadership = tab.leadership();
        let id = tab.id().to_string();
        tokio::spawn(async move {
            while leadership.changed().await.is_ok() {
                let is_leader = *leadership.borrow_and_update();
                if is_leader {
                    println!("[{}] 成为 leader", id);
                } else {
                    println!("[{}] 不再是 leader", id);
                }
            }
        });
    }

    println!("已启动 {} 个 tab，Ctrl-C 退出。", tabs.len());
    tokio::signal::ctrl_c()
        .await
        .wrap_err("等待 Ctrl-C 失败")?;

    println!("\n正在退出...");
    for tab in &tabs {
        let counts = tab.store().unread_counts();
        println!(
            "[{}] 消息 {} 条，未读 {}（discord {} / telegram {} / twitch {}）",
            tab.id(),
            tab.store().len(),
            counts.total,
            counts.discord,
            counts.telegram,
            counts.twitch
        );
        tab.shutdown().await;
    }
    Ok(())
}

async fn run_status() -> Result<()> {
    let config = Config::load_or_init()?;
    if config.storage.backend == StorageBackend::Memory {
        println!("storage.backend = memory：leader 记录只存在于运行中的进程内。");
        return Ok(());
    }

    let path = config.profile_dir()?.join("shared.db");
    if !path.exists() {
        println!("profile 不存在: {}", path.display());
        return Ok(());
    }
    let storage = SqliteStorage::open(&path, Duration::from_secs(60))
        .await
        .wrap_err_with(|| format!("打开 profile 失败: {}", path.display()))?;

    match election::read_leader(&storage, &config.election.key).await? {
        None => println!("当前没有 leader。"),
        Some(record) => {
            let now = SystemClock.now_ms();
            let age = record.age_ms(now);
            let state = if record.is_expired(now, config.election.timeout_ms) {
                "已过期"
            } else {
                "有效"
            };
            println!("leader:       {}", record.owner_id);
            println!("elected at:   {}", to_datetime(record.elected_at));
            println!("heartbeat:    {} ms 前（{}）", age, state);
        }
    }
    Ok(())
}

fn run_init() -> Result<()> {
    let config_path = Config::config_path()?;

    if config_path.exists() {
        println!("配置文件已存在: {}", config_path.display());
        println!("如需重新初始化，请先删除该文件。");
    } else {
        let _ = Config::load_or_init()?;
        println!("已创建配置文件: {}", config_path.display());
    }

    Ok(())
}

fn run_config() -> Result<()> {
    let config_path = Config::config_path()?;

    if !config_path.exists() {
        println!("配置文件不存在。运行 `notifier-hub init` 创建。");
        return Ok(());
    }

    let config = Config::load_from_path(&config_path)?;
    let rendered = toml::to_string_pretty(&config).wrap_err("序列化配置失败")?;
    println!("配置文件: {}\n", config_path.display());
    println!("# 生效配置（含默认值与环境变量覆盖）\n{}", rendered);

    Ok(())
}

/// 初始化 tracing: stderr 只输出 warn+，日志文件输出 debug+
fn init_tracing() -> Result<()> {
    let log_dir = Config::log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .wrap_err_with(|| format!("创建日志目录失败: {}", log_dir.display()))?;

    // 文件日志: 按天滚动
    let file_appender = tracing_appender::rolling::daily(&log_dir, "hub.log");
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("notifier_hub=debug")),
        );

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}
