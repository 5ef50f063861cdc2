//! 共享同一 profile 的 tab 之间的选主
//!
//! [`SharedStorage`] 中的一个槽位保存 [`LeaderRecord`]。持有者每隔
//! `heartbeat_interval_ms` 续约心跳；其他 tab 每隔 `check_interval_ms` 以及槽位被
//! 其他 tab 写入时重新检查。心跳超过 `timeout_ms` 的记录可以被接管。
//!
//! # 接管竞争
//! 开启 `atomic_takeover` 且后端支持 compare-and-swap 时，接管和续约都以读到的值为
//! 前提，两个 tab 不可能同时胜出。否则 tab 写入记录后回读确认：两个 tab 在写入与回读
//! 之间交错时都可能认为自己是 leader，直到下一次心跳发现对方，这个窗口不超过
//! `heartbeat_interval_ms`。
//!
//! # 状态机
//! `Follower → Attempting → Leader → Follower`。不调用 [`stop`](LeaderElection::stop)
//! 直接 drop [`LeaderElection`] 会终止定时器但保留记录，与 tab 崩溃完全相同。

pub mod record;

pub use record::{LeaderRecord, Slot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ElectionConfig;
use crate::storage::{CasOutcome, SharedStorage, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Attempting,
    Leader,
}

pub type LeadershipCallback = Arc<dyn Fn(bool) + Send + Sync>;

pub struct LeaderElection {
    inner: Arc<Inner>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    tab_id: String,
    config: ElectionConfig,
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    state: Mutex<ElectionState>,
    leader_tx: watch::Sender<bool>,
    on_change: Mutex<Option<LeadershipCallback>>,
}

/// 不透明的 tab id：创建时间加随机后缀
pub fn generate_tab_id(clock: &dyn Clock) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", clock.now_ms(), &suffix[..7])
}

/// 不参与选举，只读取当前记录（状态查看用）
pub async fn read_leader(
    storage: &dyn SharedStorage,
    key: &str,
) -> StorageResult<Option<LeaderRecord>> {
    let slot = Slot::parse(storage.get(key).await?);
    Ok(slot.record().cloned())
}

impl LeaderElection {
    pub fn new(
        config: ElectionConfig,
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tab_id = generate_tab_id(clock.as_ref());
        Self::with_tab_id(tab_id, config, storage, clock)
    }

    pub fn with_tab_id(
        tab_id: impl Into<String>,
        config: ElectionConfig,
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (leader_tx, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tab_id: tab_id.into(),
                config,
                storage,
                clock,
                state: Mutex::new(ElectionState::Follower),
                leader_tx,
                on_change: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// 开始参与选举，每个实例只有第一次调用生效
    pub fn start<F>(&self, on_change: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(tab = %self.inner.tab_id, "leader election already started, ignoring");
            return;
        }
        *self.inner.on_change.lock().unwrap() = Some(Arc::new(on_change));

        let inner = self.inner.clone();
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(drive(inner, shutdown));
        *self.task.lock().unwrap() = Some(task);
    }

    /// 放弃 leader 身份（如持有）并取消所有定时器，可重复调用
    pub async fn stop(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.release().await;
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    pub fn state(&self) -> ElectionState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.leader_tx.subscribe()
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.inner.config
    }

    pub async fn read_leader(&self) -> StorageResult<Option<LeaderRecord>> {
        read_leader(self.inner.storage.as_ref(), &self.inner.config.key).await
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        if let Ok(task) = self.task.get_mut() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn drive(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let jitter = inner.start_jitter();
    if !jitter.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown.changed() => return,
        }
    }

    let mut events = inner.storage.subscribe();
    let mut events_open = true;
    let mut check = ticker(Duration::from_millis(inner.config.check_interval_ms));
    let mut heartbeat = ticker(Duration::from_millis(inner.config.heartbeat_interval_ms));

    inner.check().await;
    if inner.is_leader() {
        heartbeat.reset();
    }

    loop {
        let was_leader = inner.is_leader();
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = check.tick() => {
                inner.check().await;
            }
            _ = heartbeat.tick(), if was_leader => {
                inner.renew().await;
            }
            event = events.recv(), if events_open => match event {
                Ok(event) if event.key == inner.config.key => {
                    inner.check().await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    inner.check().await;
                }
                Err(RecvError::Closed) => events_open = false,
            },
        }
        if !was_leader && inner.is_leader() {
            heartbeat.reset();
        }
    }
    debug!(tab = %inner.tab_id, "election driver stopped");
}

impl Inner {
    fn state(&self) -> ElectionState {
        *self.state.lock().unwrap()
    }

    fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    fn set_state(&self, state: ElectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn start_jitter(&self) -> Duration {
        let max = self.config.start_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        let roll = uuid::Uuid::new_v4().as_u128() % max as u128;
        Duration::from_millis(roll as u64)
    }

    async fn read_slot(&self) -> StorageResult<Slot> {
        Ok(Slot::parse(self.storage.get(&self.config.key).await?))
    }

    /// 一轮选举：读取槽位并根据内容行动
    async fn check(&self) -> ElectionState {
        let slot = match self.read_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                warn!(tab = %self.tab_id, "leader slot read failed: {}", e);
                return self.state();
            }
        };
        let now = self.clock.now_ms();

        match slot {
            Slot::Empty => self.try_take_over(None).await,
            Slot::Corrupt(raw) => {
                warn!(tab = %self.tab_id, len = raw.len(), "corrupt leader record, clearing");
                if !self.clear(&raw).await {
                    return self.state();
                }
                self.try_take_over(None).await
            }
            Slot::Held(record, raw) if record.owner_id == self.tab_id => {
                self.renew_from(&record, &raw).await
            }
            Slot::Held(record, raw) => {
                let age = record.age_ms(now);
                if age > self.config.stale_after_ms() as i64 {
                    info!(
                        tab = %self.tab_id,
                        owner = %record.owner_id,
                        age_ms = age,
                        "clearing stale leader record"
                    );
                    if !self.clear(&raw).await {
                        return self.state();
                    }
                    self.try_take_over(None).await
                } else if record.is_expired(now, self.config.timeout_ms) {
                    debug!(
                        tab = %self.tab_id,
                        owner = %record.owner_id,
                        age_ms = age,
                        "leader heartbeat expired"
                    );
                    self.try_take_over(Some(raw)).await
                } else {
                    if self.is_leader() {
                        self.step_down(&format!("superseded by {}", record.owner_id));
                    } else {
                        self.set_state(ElectionState::Follower);
                    }
                    ElectionState::Follower
                }
            }
        }
    }

    /// 作为 leader 时的心跳
    async fn renew(&self) {
        match self.read_slot().await {
            Ok(Slot::Held(record, raw)) if record.owner_id == self.tab_id => {
                self.renew_from(&record, &raw).await;
            }
            Ok(Slot::Held(record, _)) => {
                self.step_down(&format!("superseded by {}", record.owner_id));
            }
            Ok(Slot::Empty) | Ok(Slot::Corrupt(_)) => {
                // 记录被别人清掉了，走一次完整检查重新抢占
                self.check().await;
            }
            Err(e) => warn!(tab = %self.tab_id, "heartbeat read failed: {}", e),
        }
    }

    async fn renew_from(&self, record: &LeaderRecord, raw: &str) -> ElectionState {
        let renewed = record.renewed(self.clock.now_ms());
        let json = match renewed.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(tab = %self.tab_id, "encode leader record: {}", e);
                return self.state();
            }
        };

        if self.config.atomic_takeover {
            match self
                .storage
                .compare_and_swap(&self.config.key, Some(raw), Some(&json))
                .await
            {
                Ok(CasOutcome::Swapped) => return self.become_leader(),
                Ok(CasOutcome::Conflict { .. }) => {
                    debug!(tab = %self.tab_id, "leader slot changed during renewal");
                    return self.state();
                }
                Ok(CasOutcome::Unsupported) => {}
                Err(e) => {
                    warn!(tab = %self.tab_id, "heartbeat write failed: {}", e);
                    return self.state();
                }
            }
        }

        match self.storage.set(&self.config.key, &json).await {
            Ok(()) => self.become_leader(),
            Err(e) => {
                warn!(tab = %self.tab_id, "heartbeat write failed: {}", e);
                self.state()
            }
        }
    }

    async fn try_take_over(&self, expected: Option<String>) -> ElectionState {
        self.set_state_keeping_leader(ElectionState::Attempting);
        let record = LeaderRecord::new(self.tab_id.clone(), self.clock.now_ms());
        let json = match record.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(tab = %self.tab_id, "encode leader record: {}", e);
                return self.lose();
            }
        };

        if self.config.atomic_takeover {
            match self
                .storage
                .compare_and_swap(&self.config.key, expected.as_deref(), Some(&json))
                .await
            {
                Ok(CasOutcome::Swapped) => return self.become_leader(),
                Ok(CasOutcome::Conflict { .. }) => {
                    debug!(tab = %self.tab_id, "lost takeover race");
                    return self.lose();
                }
                Ok(CasOutcome::Unsupported) => {}
                Err(e) => {
                    warn!(tab = %self.tab_id, "leader takeover write failed: {}", e);
                    return self.lose();
                }
            }
        }

        if let Err(e) = self.storage.set(&self.config.key, &json).await {
            warn!(tab = %self.tab_id, "leader takeover write failed: {}", e);
            return self.lose();
        }
        match self.read_slot().await {
            Ok(Slot::Held(confirmed, _)) if confirmed.owner_id == self.tab_id => {
                self.become_leader()
            }
            Ok(_) => {
                debug!(tab = %self.tab_id, "takeover not confirmed, another tab won");
                self.lose()
            }
            Err(e) => {
                warn!(tab = %self.tab_id, "takeover confirm read failed: {}", e);
                self.lose()
            }
        }
    }

    /// 从槽位中删除 `raw`，除非期间已被他人替换
    async fn clear(&self, raw: &str) -> bool {
        if self.config.atomic_takeover {
            match self
                .storage
                .compare_and_swap(&self.config.key, Some(raw), None)
                .await
            {
                Ok(CasOutcome::Swapped) => return true,
                Ok(CasOutcome::Conflict { .. }) => return false,
                Ok(CasOutcome::Unsupported) => {}
                Err(e) => {
                    warn!(tab = %self.tab_id, "clear leader slot failed: {}", e);
                    return false;
                }
            }
        }
        match self.storage.remove(&self.config.key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tab = %self.tab_id, "clear leader slot failed: {}", e);
                false
            }
        }
    }

    /// 主动退出：删除自己的记录，follower 无需等待超时
    async fn release(&self) {
        match self.read_slot().await {
            Ok(Slot::Held(record, raw)) if record.owner_id == self.tab_id => {
                if self.clear(&raw).await {
                    info!(tab = %self.tab_id, "released leadership");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(tab = %self.tab_id, "leader slot read failed on stop: {}", e),
        }
        self.step_down("stopped");
    }

    /// `Attempting` 只对 follower 可见；leader 重新占用被清空的槽位时，
    /// 在尝试结束前仍报告 `Leader`
    fn set_state_keeping_leader(&self, state: ElectionState) {
        let mut current = self.state.lock().unwrap();
        if *current != ElectionState::Leader {
            *current = state;
        }
    }

    fn become_leader(&self) -> ElectionState {
        let was_leader = {
            let mut state = self.state.lock().unwrap();
            let was = *state == ElectionState::Leader;
            *state = ElectionState::Leader;
            was
        };
        if !was_leader {
            info!(tab = %self.tab_id, "this tab is now the leader");
            self.notify(true);
        }
        ElectionState::Leader
    }

    fn lose(&self) -> ElectionState {
        if self.is_leader() {
            self.step_down("takeover lost");
        } else {
            self.set_state(ElectionState::Follower);
        }
        ElectionState::Follower
    }

    fn step_down(&self, reason: &str) {
        let was_leader = {
            let mut state = self.state.lock().unwrap();
            let was = *state == ElectionState::Leader;
            *state = ElectionState::Follower;
            was
        };
        if was_leader {
            info!(tab = %self.tab_id, reason, "this tab lost leadership");
            self.notify(false);
        }
    }

    fn notify(&self, is_leader: bool) {
        self.leader_tx.send_replace(is_leader);
        let callback = self.on_change.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(is_leader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::AtomicUsize;

    const EPOCH: i64 = 1_700_000_000_000;

    fn config() -> ElectionConfig {
        ElectionConfig {
            start_jitter_ms: 0,
            ..ElectionConfig::default()
        }
    }

    fn election(profile: &MemoryStorage, clock: TokioClock, id: &str) -> LeaderElection {
        election_with(profile, clock, id, config())
    }

    fn election_with(
        profile: &MemoryStorage,
        clock: TokioClock,
        id: &str,
        config: ElectionConfig,
    ) -> LeaderElection {
        LeaderElection::with_tab_id(id, config, Arc::new(profile.handle()), Arc::new(clock))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn stored(profile: &MemoryStorage) -> Option<LeaderRecord> {
        read_leader(profile, "notifier-leader").await.unwrap()
    }

    async fn put_record(profile: &MemoryStorage, owner: &str, heartbeat: i64) {
        let record = LeaderRecord {
            owner_id: owner.to_string(),
            last_heartbeat: heartbeat,
            elected_at: heartbeat,
        };
        profile
            .set("notifier-leader", &record.to_json().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lone_tab_becomes_leader() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        let tab = election(&profile, clock, "tab-a");
        let changes = Arc::new(Mutex::new(vec![]));
        let seen = changes.clone();

        tab.start(move |leader| seen.lock().unwrap().push(leader));
        settle().await;

        assert!(tab.is_leader());
        assert_eq!(tab.state(), ElectionState::Leader);
        assert_eq!(*changes.lock().unwrap(), vec![true]);
        assert!(*tab.subscribe().borrow());
        assert_eq!(stored(&profile).await.unwrap().owner_id, "tab-a");
    }

    #[tokio::test(start_paused = true)]
    async fn leader_renews_heartbeat() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        let tab = election(&profile, clock, "tab-a");
        tab.start(|_| {});
        settle().await;
        let first = stored(&profile).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let later = stored(&profile).await.unwrap();
        assert_eq!(later.elected_at, first.elected_at);
        assert!(later.last_heartbeat >= first.last_heartbeat + 3_000);
        assert!(!later.is_expired(clock.now_ms(), 5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn live_record_keeps_tab_follower() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        put_record(&profile, "other", clock.now_ms() - 1_000).await;

        let tab = election(&profile, clock, "tab-a");
        tab.start(|_| {});
        settle().await;
        assert!(!tab.is_leader());

        // heartbeat age reaches 4.5s: not expired yet
        tokio::time::sleep(Duration::from_millis(3_490)).await;
        assert!(!tab.is_leader());

        // the 6s check sees a 7s old heartbeat
        tokio::time::sleep(Duration::from_millis(2_600)).await;
        assert!(tab.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_record_is_cleared_immediately() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        put_record(&profile, "dead-tab", clock.now_ms() - 120_000).await;

        let tab = election(&profile, clock, "tab-a");
        tab.start(|_| {});
        settle().await;

        assert!(tab.is_leader());
        assert_eq!(stored(&profile).await.unwrap().owner_id, "tab-a");
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_record_is_treated_as_absent() {
        let profile = MemoryStorage::new();
        profile.set("notifier-leader", "{garbage").await.unwrap();
        let tab = election(&profile, TokioClock::new(EPOCH), "tab-a");
        tab.start(|_| {});
        settle().await;

        assert!(tab.is_leader());
        assert_eq!(stored(&profile).await.unwrap().owner_id, "tab-a");
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_retried_next_cycle() {
        let profile = MemoryStorage::new();
        profile.set_unavailable(true);
        let tab = election(&profile, TokioClock::new(EPOCH), "tab-a");
        tab.start(|_| {});
        settle().await;
        assert!(!tab.is_leader());
        assert_eq!(tab.state(), ElectionState::Follower);

        profile.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(tab.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_record_and_reports_loss() {
        let profile = MemoryStorage::new();
        let tab = election(&profile, TokioClock::new(EPOCH), "tab-a");
        let calls = Arc::new(Mutex::new(vec![]));
        let seen = calls.clone();
        tab.start(move |leader| seen.lock().unwrap().push(leader));
        settle().await;

        tab.stop().await;
        assert!(!tab.is_leader());
        assert!(stored(&profile).await.is_none());
        assert_eq!(*calls.lock().unwrap(), vec![true, false]);

        // 再次 stop 无副作用
        tab.stop().await;
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_rival_record_alone() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        put_record(&profile, "other", clock.now_ms()).await;
        let tab = election(&profile, clock, "tab-a");
        tab.start(|_| {});
        settle().await;

        tab.stop().await;
        assert_eq!(stored(&profile).await.unwrap().owner_id, "other");
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_ignored() {
        let profile = MemoryStorage::new();
        let tab = election(&profile, TokioClock::new(EPOCH), "tab-a");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (f, s) = (first.clone(), second.clone());

        tab.start(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tab.start(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_steps_down_when_superseded() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        let tab = election(&profile, clock, "tab-a");
        tab.start(|_| {});
        settle().await;
        assert!(tab.is_leader());

        // a rival forcibly writes its own fresh record
        put_record(&profile, "rival", clock.now_ms()).await;
        settle().await;

        assert!(!tab.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_mode_elects_leader() {
        let profile = MemoryStorage::new();
        let clock = TokioClock::new(EPOCH);
        let cfg = ElectionConfig {
            atomic_takeover: false,
            ..config()
        };
        let a = election_with(&profile, clock, "tab-a", cfg.clone());
        let b = election_with(&profile, clock, "tab-b", cfg);
        a.start(|_| {});
        settle().await;
        b.start(|_| {});
        settle().await;

        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_leader_leaves_record_behind() {
        let profile = MemoryStorage::new();
        let tab = election(&profile, TokioClock::new(EPOCH), "tab-a");
        tab.start(|_| {});
        settle().await;
        drop(tab);
        assert_eq!(stored(&profile).await.unwrap().owner_id, "tab-a");
    }

    #[test]
    fn generated_ids_are_unique() {
        let clock = crate::clock::SystemClock;
        assert_ne!(generate_tab_id(&clock), generate_tab_id(&clock));
    }
}
