//! 集成测试公共辅助函数
//!
//! 供 election_integration.rs、tab_integration.rs 和 relay_integration.rs 共用。
//! 所有 tab 共享同一个内存 profile、同一条 LocalBus 和同一个 TokioClock，
//! 测试用 `start_paused` 驱动模拟时间。

// 每个集成测试文件只使用 common 的一部分，未用到的辅助函数属于预期 dead_code
#![allow(dead_code)]

pub mod mock_adapter;
pub use mock_adapter::MockAdapter;

use std::sync::Arc;
use std::time::Duration;

use notifier_hub::broadcast::LocalBus;
use notifier_hub::clock::{to_datetime, TokioClock};
use notifier_hub::config::{Config, ElectionConfig};
use notifier_hub::platform::{IncomingMessage, Platform};
use notifier_hub::storage::MemoryStorage;
use notifier_hub::tab::{Tab, TabBuilder};

pub const EPOCH: i64 = 1_700_000_000_000;

/// 默认间隔（心跳 1s / 检查 2s / 超时 5s），关闭启动抖动以便断言时序
pub fn test_config() -> Config {
    Config {
        election: ElectionConfig {
            start_jitter_ms: 0,
            ..ElectionConfig::default()
        },
        ..Config::default()
    }
}

/// 一个 profile：共享存储 + 广播总线 + 时钟
pub struct Profile {
    pub storage: MemoryStorage,
    pub bus: LocalBus,
    pub clock: TokioClock,
    pub config: Config,
}

impl Profile {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            storage: MemoryStorage::new(),
            bus: LocalBus::new("notifier-hub", 256),
            clock: TokioClock::new(EPOCH),
            config,
        }
    }

    pub fn builder(&self, id: &str) -> TabBuilder {
        Tab::builder(self.config.clone())
            .tab_id(id)
            .storage(Arc::new(self.storage.handle()))
            .bus(Arc::new(self.bus.clone()))
            .clock(Arc::new(self.clock))
    }

    pub fn tab(&self, id: &str) -> Tab {
        self.builder(id).build().unwrap()
    }

    /// 时钟偏移 `skew_ms` 的 tab
    pub fn skewed_tab(&self, id: &str, skew_ms: i64) -> Tab {
        self.builder(id)
            .clock(Arc::new(self.clock.skewed(skew_ms)))
            .build()
            .unwrap()
    }

    pub fn tab_with_adapter(&self, id: &str, adapter: Arc<MockAdapter>) -> Tab {
        self.builder(id).adapter(adapter).build().unwrap()
    }

    pub fn message(&self, platform: Platform, content: &str, offset_ms: i64) -> IncomingMessage {
        IncomingMessage::text(platform, "alice", content, to_datetime(EPOCH + offset_ms))
    }
}

/// 让出执行权，等待已就绪的任务跑完
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub async fn advance_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn leader_count(tabs: &[Tab]) -> usize {
    tabs.iter().filter(|t| t.is_leader()).count()
}
