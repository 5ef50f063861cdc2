//! profile 中的一个参与者（tab）
//!
//! 每个 tab 持有自己的消息存储和连接状态表。当选的 leader 驱动轮询循环
//! （配置了后端 relay 时也负责 relay 连接），把收到的内容写入自己的存储并广播；
//! follower 只镜像广播。无论来源如何，每次插入都经过转发回声检查。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use color_eyre::eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{
    BroadcastService, BroadcastTransport, TOPIC_CONNECTION_STATE, TOPIC_MESSAGE,
    TOPIC_MESSAGE_DELETED, TOPIC_MESSAGE_UPDATED,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::election::{generate_tab_id, LeaderElection};
use crate::platform::{ChannelDirectory, IncomingMessage, Message, Platform};
use crate::poller::{AdapterEvent, PlatformAdapter, PollLoop, PollSink};
use crate::relay::{self, status_update, RelayEvent, RelaySink};
use crate::storage::SharedStorage;
use crate::store::{AppendOutcome, ConnectionRegistry, ConnectionState, ConnectionUpdate, MessageStore};

// ─── 广播负载 ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub platform: Platform,
    pub platform_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdated {
    pub platform: Platform,
    pub platform_message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateChanged {
    pub platform: Platform,
    pub state: ConnectionState,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct TabBuilder {
    config: Config,
    tab_id: Option<String>,
    storage: Option<Arc<dyn SharedStorage>>,
    bus: Option<Arc<dyn BroadcastTransport>>,
    clock: Option<Arc<dyn Clock>>,
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    relay_socket: Option<PathBuf>,
}

impl TabBuilder {
    pub fn tab_id(mut self, id: impl Into<String>) -> Self {
        self.tab_id = Some(id.into());
        self
    }

    pub fn storage(mut self, storage: Arc<dyn SharedStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 没有总线时 tab 单独运行，广播全部为空操作
    pub fn bus(mut self, bus: Arc<dyn BroadcastTransport>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// 作为 leader 时消费 `path` 上的后端 relay
    pub fn relay(mut self, path: impl Into<PathBuf>) -> Self {
        self.relay_socket = Some(path.into());
        self
    }

    /// 必须在 tokio runtime 内调用
    pub fn build(self) -> Result<Tab> {
        let storage = self
            .storage
            .ok_or_else(|| eyre!("a shared storage backend is required"))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let id = self
            .tab_id
            .unwrap_or_else(|| generate_tab_id(clock.as_ref()));

        let store = MessageStore::from_config(&self.config.store, &self.config.dedup)
            .wrap_err("invalid relay prefix pattern")?;
        let inner = Arc::new(TabInner {
            id: id.clone(),
            store,
            connections: ConnectionRegistry::new(clock.clone()),
            directory: ChannelDirectory::new(&self.config.channels),
            broadcast: BroadcastService::new(id.clone(), self.bus),
            leading: AtomicBool::new(false),
        });
        let sink: Arc<dyn PollSink> = inner.clone();
        let loops: Vec<PollLoop> = self
            .adapters
            .into_iter()
            .map(|a| PollLoop::new(a, sink.clone(), self.config.poll.clone()))
            .collect();
        let election = LeaderElection::with_tab_id(
            id,
            self.config.election.clone(),
            storage,
            clock,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Tab {
            inner,
            election,
            loops: Arc::new(loops),
            config: self.config,
            relay_socket: self.relay_socket,
            shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

// ─── Tab ─────────────────────────────────────────────────────────────────────

pub struct Tab {
    inner: Arc<TabInner>,
    election: LeaderElection,
    loops: Arc<Vec<PollLoop>>,
    config: Config,
    relay_socket: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct TabInner {
    id: String,
    store: MessageStore,
    connections: ConnectionRegistry,
    directory: ChannelDirectory,
    broadcast: BroadcastService,
    /// 本 tab 的轮询循环正在运行；只有此时才广播连接状态
    leading: AtomicBool,
}

impl Tab {
    pub fn builder(config: Config) -> TabBuilder {
        TabBuilder {
            config,
            tab_id: None,
            storage: None,
            bus: None,
            clock: None,
            adapters: Vec::new(),
            relay_socket: None,
        }
    }

    /// 注册镜像处理并加入选举，只有第一次调用生效
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(tab = %self.inner.id, "tab already started");
            return;
        }
        register_mirrors(&self.inner);

        let (tx, rx) = mpsc::unbounded_channel();
        self.election.start(move |is_leader| {
            let _ = tx.send(is_leader);
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(follow_election(
            self.inner.clone(),
            self.loops.clone(),
            rx,
            self.shutdown.subscribe(),
        )));

        if let Some(path) = &self.relay_socket {
            let sink: Arc<dyn RelaySink> = self.inner.clone();
            tasks.push(tokio::spawn(relay::follow_leadership(
                path.clone(),
                self.config.relay.clone(),
                sink,
                self.election.subscribe(),
                self.shutdown.subscribe(),
            )));
        }
        info!(tab = %self.inner.id, adapters = self.loops.len(), "tab started");
    }

    /// 停止轮询、退出选举（作为 leader 时删除记录）并关闭广播，可重复调用
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.leading.store(false, Ordering::SeqCst);
        for poll in self.loops.iter() {
            poll.disconnect().await;
        }
        self.election.stop().await;
        self.inner.broadcast.close();
        info!(tab = %self.inner.id, "tab shut down");
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.election.subscribe()
    }

    pub fn election(&self) -> &LeaderElection {
        &self.election
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    pub fn is_polling(&self) -> bool {
        self.loops.iter().any(|l| l.is_running())
    }

    /// leader 处理一条新消息：去重检查、写入存储、广播
    pub fn ingest(&self, incoming: IncomingMessage) -> AppendOutcome {
        self.inner.ingest(incoming)
    }

    pub fn delete_message(&self, platform: Platform, platform_message_id: &str) -> Option<Message> {
        self.inner.delete(platform, platform_message_id)
    }

    pub fn update_message(&self, platform: Platform, platform_message_id: &str, content: &str) -> bool {
        self.inner.update(platform, platform_message_id, content)
    }

    pub fn apply_relay_event(&self, event: RelayEvent) {
        self.inner.on_relay_event(event);
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn follow_election(
    inner: Arc<TabInner>,
    loops: Arc<Vec<PollLoop>>,
    mut changes: mpsc::UnboundedReceiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let is_leader = tokio::select! {
            change = changes.recv() => match change {
                Some(is_leader) => is_leader,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        if is_leader {
            inner.leading.store(true, Ordering::SeqCst);
            info!(tab = %inner.id, "starting poll loops");
            for poll in loops.iter() {
                poll.start();
            }
        } else {
            inner.leading.store(false, Ordering::SeqCst);
            info!(tab = %inner.id, "stopping poll loops");
            for poll in loops.iter() {
                poll.disconnect().await;
            }
        }
    }
}

fn register_mirrors(inner: &Arc<TabInner>) {
    let weak = Arc::downgrade(inner);
    on_mirror(&inner.broadcast, TOPIC_MESSAGE, &weak, |tab, message: Message| {
        if let AppendOutcome::Inserted(m) = tab.store.insert(message) {
            debug!(tab = %tab.id, id = %m.id, "mirrored message");
        }
    });
    on_mirror(&inner.broadcast, TOPIC_MESSAGE_DELETED, &weak, |tab, d: MessageDeleted| {
        tab.store.delete(d.platform, &d.platform_message_id);
    });
    on_mirror(&inner.broadcast, TOPIC_MESSAGE_UPDATED, &weak, |tab, u: MessageUpdated| {
        tab.store.update(u.platform, &u.platform_message_id, &u.content);
    });
    on_mirror(
        &inner.broadcast,
        TOPIC_CONNECTION_STATE,
        &weak,
        |tab, c: ConnectionStateChanged| tab.connections.apply(c.platform, c.state),
    );
}

fn on_mirror<T, F>(broadcast: &BroadcastService, topic: &str, tab: &Weak<TabInner>, apply: F)
where
    T: serde::de::DeserializeOwned + 'static,
    F: Fn(&TabInner, T) + Send + Sync + 'static,
{
    let tab = tab.clone();
    broadcast.on_typed(topic, move |payload: T| {
        if let Some(tab) = tab.upgrade() {
            apply(&tab, payload);
        }
    });
}

impl TabInner {
    fn ingest(&self, mut incoming: IncomingMessage) -> AppendOutcome {
        if incoming.channel_name.is_none() {
            incoming.channel_name = Some(
                self.directory
                    .resolve(incoming.platform, &incoming.channel_id),
            );
        }
        let outcome = self.store.append(incoming);
        if let AppendOutcome::Inserted(message) = &outcome {
            self.broadcast.send(TOPIC_MESSAGE, message);
        }
        outcome
    }

    fn delete(&self, platform: Platform, platform_message_id: &str) -> Option<Message> {
        let removed = self.store.delete(platform, platform_message_id);
        self.broadcast.send(
            TOPIC_MESSAGE_DELETED,
            &MessageDeleted {
                platform,
                platform_message_id: platform_message_id.to_string(),
            },
        );
        removed
    }

    fn update(&self, platform: Platform, platform_message_id: &str, content: &str) -> bool {
        let changed = self.store.update(platform, platform_message_id, content);
        self.broadcast.send(
            TOPIC_MESSAGE_UPDATED,
            &MessageUpdated {
                platform,
                platform_message_id: platform_message_id.to_string(),
                content: content.to_string(),
            },
        );
        changed
    }
}

impl PollSink for TabInner {
    fn on_status(&self, platform: Platform, update: ConnectionUpdate) {
        let state = self.connections.apply_update(platform, &update);
        if self.leading.load(Ordering::SeqCst) {
            self.broadcast.send(
                TOPIC_CONNECTION_STATE,
                &ConnectionStateChanged { platform, state },
            );
        }
    }

    fn on_event(&self, platform: Platform, event: AdapterEvent) {
        match event {
            AdapterEvent::NewMessage(message) => {
                self.ingest(message);
            }
            AdapterEvent::MessageDeleted {
                platform_message_id,
            } => {
                self.delete(platform, &platform_message_id);
            }
            AdapterEvent::MessageUpdated {
                platform_message_id,
                content,
            } => {
                self.update(platform, &platform_message_id, &content);
            }
        }
    }
}

impl RelaySink for TabInner {
    fn on_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::NewMessage { platform, message } => {
                if platform != message.platform {
                    warn!(
                        tab = %self.id,
                        envelope = %platform,
                        payload = %message.platform,
                        "dropping relay message with mismatched platform"
                    );
                    return;
                }
                self.ingest(message);
            }
            RelayEvent::MessageDeleted {
                platform,
                platform_message_id,
            } => {
                self.delete(platform, &platform_message_id);
            }
            RelayEvent::MessageUpdated {
                platform,
                platform_message_id,
                content,
            } => {
                self.update(platform, &platform_message_id, &content);
            }
            RelayEvent::ServiceStatus {
                platform,
                status,
                error,
            } => self.on_status(platform, status_update(status, error)),
            RelayEvent::ServiceError { platform, error } => {
                self.on_status(platform, ConnectionUpdate::Error(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBus;
    use crate::clock::{to_datetime, TokioClock};
    use crate::config::ElectionConfig;
    use crate::storage::MemoryStorage;
    use crate::store::ConnectionStatus;
    use std::time::Duration;

    const EPOCH: i64 = 1_700_000_000_000;

    fn config() -> Config {
        Config {
            election: ElectionConfig {
                start_jitter_ms: 0,
                ..ElectionConfig::default()
            },
            ..Config::default()
        }
    }

    fn tab(profile: &MemoryStorage, bus: &LocalBus, clock: TokioClock, id: &str) -> Tab {
        Tab::builder(config())
            .tab_id(id)
            .storage(Arc::new(profile.handle()))
            .bus(Arc::new(bus.clone()))
            .clock(Arc::new(clock))
            .build()
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn build_requires_storage() {
        assert!(Tab::builder(Config::default()).build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_fills_channel_name_and_mirrors() {
        let profile = MemoryStorage::new();
        let bus = LocalBus::new("hub", 64);
        let clock = TokioClock::new(EPOCH);
        let a = tab(&profile, &bus, clock, "tab-a");
        let b = tab(&profile, &bus, clock, "tab-b");
        a.start();
        settle().await;
        b.start();
        settle().await;

        let outcome = a.ingest(
            IncomingMessage::text(Platform::Discord, "alice", "hi", to_datetime(EPOCH))
                .with_channel("777"),
        );
        let stored = outcome.inserted().unwrap().clone();
        assert_eq!(stored.channel_name, "channel-777");
        settle().await;

        assert_eq!(b.store().get(&stored.id), Some(stored));
        assert_eq!(b.store().unread_counts().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_events_flow_through_gates() {
        let profile = MemoryStorage::new();
        let bus = LocalBus::new("hub", 64);
        let clock = TokioClock::new(EPOCH);
        let a = tab(&profile, &bus, clock, "tab-a");
        let b = tab(&profile, &bus, clock, "tab-b");
        a.start();
        settle().await;
        b.start();
        settle().await;
        assert!(a.is_leader());

        let message = IncomingMessage::text(Platform::Telegram, "bob", "yo", to_datetime(EPOCH))
            .with_platform_message_id("5");
        a.apply_relay_event(RelayEvent::NewMessage {
            platform: Platform::Telegram,
            message,
        });
        a.apply_relay_event(RelayEvent::MessageUpdated {
            platform: Platform::Telegram,
            platform_message_id: "5".into(),
            content: "yo!".into(),
        });
        a.apply_relay_event(RelayEvent::ServiceError {
            platform: Platform::Twitch,
            error: "irc down".into(),
        });
        settle().await;

        assert_eq!(a.store().messages()[0].content, "yo!");
        assert_eq!(b.store().messages()[0].content, "yo!");
        let twitch = b.connections().get(Platform::Twitch);
        assert_eq!(twitch.status, ConnectionStatus::Error);
        assert_eq!(twitch.error.as_deref(), Some("irc down"));

        a.apply_relay_event(RelayEvent::MessageDeleted {
            platform: Platform::Telegram,
            platform_message_id: "5".into(),
        });
        settle().await;
        assert!(b.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_message_with_mismatched_platform_is_dropped() {
        let profile = MemoryStorage::new();
        let bus = LocalBus::new("hub", 64);
        let clock = TokioClock::new(EPOCH);
        let a = tab(&profile, &bus, clock, "tab-a");
        let b = tab(&profile, &bus, clock, "tab-b");
        a.start();
        settle().await;
        b.start();
        settle().await;

        a.apply_relay_event(RelayEvent::NewMessage {
            platform: Platform::Discord,
            message: IncomingMessage::text(Platform::Telegram, "bob", "yo", to_datetime(EPOCH)),
        });
        settle().await;

        assert!(a.store().is_empty());
        assert!(b.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_releases_leadership() {
        let profile = MemoryStorage::new();
        let bus = LocalBus::new("hub", 64);
        let a = tab(&profile, &bus, TokioClock::new(EPOCH), "tab-a");
        a.start();
        settle().await;
        assert!(a.is_leader());

        a.shutdown().await;
        a.shutdown().await;
        assert!(!a.is_leader());
        assert!(a.election().read_leader().await.unwrap().is_none());
    }
}
