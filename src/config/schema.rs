use std::collections::HashMap;
use std::path::PathBuf;

use color_eyre::eyre::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// 全局配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// 选主配置
///
/// timeout 默认是心跳间隔的 5 倍；follower 每 check_interval 检查一次。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// 共享存储中的 leader 记录键名
    #[serde(default = "default_leader_key")]
    pub key: String,
    /// leader 续约间隔（毫秒）
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// follower 检查间隔（毫秒）
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// 心跳超过该时长未更新视为 leader 已死（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 心跳超过 timeout 的该倍数时直接清除记录
    #[serde(default = "default_stale_factor")]
    pub stale_factor: u32,
    /// 启动时随机延迟上限（毫秒），避免同时打开的 Tab 撞车
    #[serde(default = "default_start_jitter_ms")]
    pub start_jitter_ms: u64,
    /// 存储支持 CAS 时使用原子抢占；false 则总是写入后回读确认
    #[serde(default = "default_true")]
    pub atomic_takeover: bool,
}

fn default_leader_key() -> String {
    "notifier-leader".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_check_interval_ms() -> u64 {
    2_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_stale_factor() -> u32 {
    10
}

fn default_start_jitter_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            key: default_leader_key(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            check_interval_ms: default_check_interval_ms(),
            timeout_ms: default_timeout_ms(),
            stale_factor: default_stale_factor(),
            start_jitter_ms: default_start_jitter_ms(),
            atomic_takeover: true,
        }
    }
}

impl ElectionConfig {
    /// 超过该年龄的记录直接清除
    pub fn stale_after_ms(&self) -> u64 {
        self.timeout_ms.saturating_mul(self.stale_factor as u64)
    }
}

/// 跨 Tab 广播配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// 广播频道名称
    #[serde(default = "default_channel_name")]
    pub channel: String,
    /// 每个订阅者可缓冲的消息数，慢订阅者超出后丢消息
    #[serde(default = "default_broadcast_capacity")]
    pub capacity: usize,
    /// SQLite profile 中每个频道保留的信封行数（跨进程广播）
    #[serde(default = "default_broadcast_retain")]
    pub retain: usize,
}

fn default_channel_name() -> String {
    "notifier-hub".to_string()
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_broadcast_retain() -> usize {
    1_000
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel: default_channel_name(),
            capacity: default_broadcast_capacity(),
            retain: default_broadcast_retain(),
        }
    }
}

/// 转发去重配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// 跨平台相同内容在该时间窗内视为转发回声（毫秒）
    #[serde(default = "default_dedup_window_ms")]
    pub window_ms: u64,
    /// 只与最近 N 条消息比较
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// 是否启用内置前缀表
    #[serde(default = "default_true")]
    pub builtin_prefixes: bool,
    /// 追加的前缀正则（锚定在内容开头）
    #[serde(default)]
    pub extra_prefixes: Vec<String>,
}

fn default_dedup_window_ms() -> u64 {
    5_000
}

fn default_history_window() -> usize {
    50
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_dedup_window_ms(),
            history_window: default_history_window(),
            builtin_prefixes: true,
            extra_prefixes: vec![],
        }
    }
}

/// 消息存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 环形缓冲容量，超出后淘汰最旧消息
    #[serde(default = "default_store_capacity")]
    pub capacity: usize,
}

fn default_store_capacity() -> usize {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_store_capacity(),
        }
    }
}

/// 平台轮询 / 重连配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// 第 n 次重连等待 n * initial_backoff_ms，上限 max_backoff_ms
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 连续失败超过该次数后放弃，停在 error 状态
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 两次 poll 之间的间隔（长轮询适配器可设为 0）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// 后端 relay 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Unix socket 路径；None 表示不连接后端
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// 订阅的平台（空 = 全部）
    #[serde(default)]
    pub platforms: Vec<Platform>,
    /// 断线后重连间隔（毫秒）
    #[serde(default = "default_relay_reconnect_ms")]
    pub reconnect_ms: u64,
}

fn default_relay_reconnect_ms() -> u64 {
    3_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            platforms: vec![],
            reconnect_ms: default_relay_reconnect_ms(),
        }
    }
}

/// 共享存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// profile 目录，默认 `~/.notifier-hub/profile`
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
    /// 检测其他进程写入的轮询间隔（毫秒）
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

fn default_watch_interval_ms() -> u64 {
    250
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            profile_dir: None,
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

/// 频道 ID → 名称映射
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: HashMap<String, String>,
    /// Telegram topic ID → 名称；键 "null" 表示无 topic 的主群
    #[serde(default)]
    pub telegram: HashMap<String, String>,
}

/// 默认配置 TOML 模板
pub(crate) const DEFAULT_CONFIG_TOML: &str = r#"[election]
key = "notifier-leader"
heartbeat_interval_ms = 1000
check_interval_ms = 2000
timeout_ms = 5000
stale_factor = 10
start_jitter_ms = 200
atomic_takeover = true   # false: 写入后回读确认（存在短暂双 leader 窗口）

[broadcast]
channel = "notifier-hub"
retain = 1000   # storage.backend = "sqlite" 时跨进程广播保留的信封行数

[dedup]
window_ms = 5000
history_window = 50
# extra_prefixes = ['^\[Matrix\]\s*']

[store]
capacity = 500

[poll]
initial_backoff_ms = 2000
max_backoff_ms = 10000
max_retries = 5

[storage]
backend = "sqlite"

# 后端 relay（可选）
# [relay]
# socket_path = "/tmp/notifier-relay.sock"
# platforms = ["discord", "telegram", "twitch"]

# 频道名称映射（可选）
# [channels.discord]
# "1397623339660607530" = "general"
# [channels.telegram]
# "774" = "dev"
# "null" = "general"
"#;

impl Config {
    /// `~/.notifier-hub/`
    pub fn home_dir() -> Result<PathBuf> {
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| color_eyre::eyre::eyre!("无法获取 home 目录"))?;
        Ok(base_dirs.home_dir().join(".notifier-hub"))
    }

    /// 返回配置文件路径: `~/.notifier-hub/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    /// 日志目录: `~/.notifier-hub/logs`
    pub fn log_dir() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("logs"))
    }

    /// profile 目录（配置优先，否则 `~/.notifier-hub/profile`）
    pub fn profile_dir(&self) -> Result<PathBuf> {
        match &self.storage.profile_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::home_dir()?.join("profile")),
        }
    }

    /// 加载配置，如果配置文件不存在则创建默认配置
    pub fn load_or_init() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::write_default(&config_path)?;
        }

        Self::load_from_path(&config_path)
    }

    /// 写入默认配置模板
    pub fn write_default(path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).wrap_err("创建配置目录失败")?;
        }
        std::fs::write(path, DEFAULT_CONFIG_TOML).wrap_err("写入默认配置失败")?;
        Ok(())
    }

    /// 从指定路径加载配置（figment 多层合并：默认值 → TOML → 环境变量）
    ///
    /// 环境变量以 `NOTIFIER_HUB_` 为前缀，`__` 分隔层级，
    /// 例如 `NOTIFIER_HUB_ELECTION__TIMEOUT_MS=8000`。
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("NOTIFIER_HUB_").split("__"))
            .extract()
            .wrap_err("解析配置文件失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 校验跨字段约束
    pub fn validate(&self) -> Result<()> {
        let e = &self.election;
        if e.heartbeat_interval_ms == 0 || e.check_interval_ms == 0 {
            bail!("election intervals must be positive");
        }
        if e.heartbeat_interval_ms >= e.timeout_ms {
            bail!(
                "election.heartbeat_interval_ms ({}) must be shorter than timeout_ms ({})",
                e.heartbeat_interval_ms,
                e.timeout_ms
            );
        }
        if e.check_interval_ms >= e.timeout_ms {
            bail!(
                "election.check_interval_ms ({}) must be shorter than timeout_ms ({})",
                e.check_interval_ms,
                e.timeout_ms
            );
        }
        if e.stale_factor < 2 {
            bail!("election.stale_factor must be at least 2");
        }
        if self.store.capacity == 0 {
            bail!("store.capacity must be positive");
        }
        if self.broadcast.capacity == 0 || self.broadcast.retain == 0 {
            bail!("broadcast.capacity and broadcast.retain must be positive");
        }
        if self.poll.initial_backoff_ms > self.poll.max_backoff_ms {
            bail!("poll.initial_backoff_ms must not exceed max_backoff_ms");
        }
        crate::dedup::RelayFilter::from_config(&self.dedup).wrap_err("dedup 前缀正则无效")?;
        Ok(())
    }
}
