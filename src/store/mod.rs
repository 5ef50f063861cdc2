//! 每个 tab 的消息日志和连接状态表
//!
//! 日志是内存环形缓冲：超过 `capacity` 后淘汰最旧的消息，重启后不保留。
//! 无论来自本地轮询、广播镜像还是后端 relay，每次插入都先经过转发回声检查。

pub mod connections;

pub use connections::{ConnectionRegistry, ConnectionState, ConnectionStatus, ConnectionUpdate};

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::config::{DedupConfig, StoreConfig};
use crate::dedup::{Candidate, RelayFilter, Verdict};
use crate::platform::{IncomingMessage, Message, Platform};

/// 视图过滤条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    #[default]
    All,
    #[serde(untagged)]
    Platform(Platform),
}

impl Filter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Filter::All => true,
            Filter::Platform(p) => message.platform == *p,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(Message),
    /// 已存储消息 `matched_id` 的转发回声
    Suppressed { matched_id: String },
    /// 相同 `id` 或 `(platform, platform_message_id)` 已存在
    AlreadyPresent,
}

impl AppendOutcome {
    pub fn inserted(&self) -> Option<&Message> {
        match self {
            AppendOutcome::Inserted(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub total: usize,
    pub discord: usize,
    pub telegram: usize,
    pub twitch: usize,
}

impl UnreadCounts {
    pub fn get(&self, platform: Platform) -> usize {
        match platform {
            Platform::Discord => self.discord,
            Platform::Telegram => self.telegram,
            Platform::Twitch => self.twitch,
        }
    }
}

#[derive(Default)]
struct State {
    messages: VecDeque<Message>,
    filter: Filter,
}

impl State {
    fn contains(&self, message: &Message) -> bool {
        self.messages.iter().any(|m| {
            m.id == message.id
                || message
                    .platform_message_id
                    .as_deref()
                    .is_some_and(|pmid| m.is_platform_message(message.platform, pmid))
        })
    }

    fn contains_platform_message(&self, platform: Platform, pmid: Option<&str>) -> bool {
        pmid.is_some_and(|pmid| {
            self.messages
                .iter()
                .any(|m| m.is_platform_message(platform, pmid))
        })
    }

    fn find_platform_message(&self, platform: Platform, pmid: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.is_platform_message(platform, pmid))
    }
}

pub struct MessageStore {
    state: Mutex<State>,
    capacity: usize,
    history_window: usize,
    relay_filter: RelayFilter,
    revision: watch::Sender<u64>,
}

impl MessageStore {
    pub fn new(capacity: usize, history_window: usize, relay_filter: RelayFilter) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            capacity: capacity.max(1),
            history_window,
            relay_filter,
            revision,
        }
    }

    pub fn from_config(store: &StoreConfig, dedup: &DedupConfig) -> Result<Self, regex::Error> {
        Ok(Self::new(
            store.capacity,
            dedup.history_window,
            RelayFilter::from_config(dedup)?,
        ))
    }

    // ─── 写入 ──────────────────────────────────────────────────────────────────

    /// 本地接收：先去重检查，再作为新的未读消息存储
    pub fn append(&self, incoming: IncomingMessage) -> AppendOutcome {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            if state.contains_platform_message(
                incoming.platform,
                incoming.platform_message_id.as_deref(),
            ) {
                AppendOutcome::AlreadyPresent
            } else {
                match self.gate(&state, Candidate::from(&incoming)) {
                    Verdict::Drop { matched_id } => AppendOutcome::Suppressed { matched_id },
                    Verdict::Accept => {
                        let message = Message::from_incoming(incoming);
                        self.push(&mut state, message.clone());
                        AppendOutcome::Inserted(message)
                    }
                }
            }
        };
        self.after_write(&outcome);
        outcome
    }

    /// 镜像路径：存储其他 tab 创建的消息，保留其 id
    pub fn insert(&self, message: Message) -> AppendOutcome {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            if state.contains(&message) {
                AppendOutcome::AlreadyPresent
            } else {
                match self.gate(&state, Candidate::from(&message)) {
                    Verdict::Drop { matched_id } => AppendOutcome::Suppressed { matched_id },
                    Verdict::Accept => {
                        self.push(&mut state, message.clone());
                        AppendOutcome::Inserted(message)
                    }
                }
            }
        };
        self.after_write(&outcome);
        outcome
    }

    fn gate(&self, state: &State, candidate: Candidate<'_>) -> Verdict {
        let skip = state.messages.len().saturating_sub(self.history_window);
        self.relay_filter
            .check(&candidate, state.messages.iter().skip(skip))
    }

    fn push(&self, state: &mut State, message: Message) {
        state.messages.push_back(message);
        while state.messages.len() > self.capacity {
            if let Some(evicted) = state.messages.pop_front() {
                debug!(id = %evicted.id, "message evicted");
            }
        }
    }

    fn after_write(&self, outcome: &AppendOutcome) {
        match outcome {
            AppendOutcome::Inserted(m) => {
                debug!(id = %m.id, platform = %m.platform, "message stored");
                self.bump();
            }
            AppendOutcome::Suppressed { matched_id } => {
                debug!(echo_of = %matched_id, "message suppressed as relay echo");
            }
            AppendOutcome::AlreadyPresent => {}
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub fn mark_read(&self, id: &str) -> bool {
        let changed = {
            let mut state = self.state.lock().unwrap();
            match state.messages.iter_mut().find(|m| m.id == id) {
                Some(m) if !m.is_read => {
                    m.is_read = true;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// 将所有消息（或某个平台的所有消息）标为已读，返回变更条数
    pub fn mark_all_read(&self, platform: Option<Platform>) -> usize {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let mut changed = 0;
            for m in state.messages.iter_mut() {
                if !m.is_read && platform.map_or(true, |p| m.platform == p) {
                    m.is_read = true;
                    changed += 1;
                }
            }
            changed
        };
        if changed > 0 {
            self.bump();
        }
        changed
    }

    /// 删除 `platform` 的 `platform_message_id` 消息；找不到时只记录日志
    pub fn delete(&self, platform: Platform, platform_message_id: &str) -> Option<Message> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state
                .find_platform_message(platform, platform_message_id)
                .and_then(|i| state.messages.remove(i))
        };
        match &removed {
            Some(m) => {
                debug!(id = %m.id, %platform, platform_message_id, "message deleted");
                self.bump();
            }
            None => debug!(%platform, platform_message_id, "delete: no matching message"),
        }
        removed
    }

    /// 替换被编辑消息的内容；找不到时只记录日志
    pub fn update(&self, platform: Platform, platform_message_id: &str, content: &str) -> bool {
        let changed = {
            let mut state = self.state.lock().unwrap();
            match state.find_platform_message(platform, platform_message_id) {
                Some(i) if state.messages[i].content != content => {
                    state.messages[i].content = content.to_string();
                    true
                }
                Some(_) => false,
                None => {
                    debug!(%platform, platform_message_id, "update: no matching message");
                    false
                }
            }
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// 清空全部消息，或某个平台的全部消息
    pub fn clear(&self, platform: Option<Platform>) -> usize {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let before = state.messages.len();
            match platform {
                Some(p) => state.messages.retain(|m| m.platform != p),
                None => state.messages.clear(),
            }
            before - state.messages.len()
        };
        if removed > 0 {
            self.bump();
        }
        removed
    }

    pub fn set_filter(&self, filter: Filter) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut state.filter, filter) != filter
        };
        if changed {
            self.bump();
        }
    }

    // ─── 视图 ──────────────────────────────────────────────────────────────────

    pub fn filter(&self) -> Filter {
        self.state.lock().unwrap().filter
    }

    /// 符合当前过滤条件的消息，最旧的在前
    pub fn filtered(&self) -> Vec<Message> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .filter(|m| state.filter.matches(m))
            .cloned()
            .collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn unread_counts(&self) -> UnreadCounts {
        let state = self.state.lock().unwrap();
        let mut counts = UnreadCounts::default();
        for m in state.messages.iter().filter(|m| !m.is_read) {
            counts.total += 1;
            match m.platform {
                Platform::Discord => counts.discord += 1,
                Platform::Telegram => counts.telegram += 1,
                Platform::Twitch => counts.twitch += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 修订计数，每次可见变化时递增
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::to_datetime;

    const T0: i64 = 1_700_000_000_000;

    fn store(capacity: usize) -> MessageStore {
        MessageStore::new(capacity, 50, RelayFilter::default())
    }

    fn msg(platform: Platform, content: &str, at: i64) -> IncomingMessage {
        IncomingMessage::text(platform, "alice", content, to_datetime(at))
    }

    #[test]
    fn append_assigns_id_and_unread() {
        let s = store(10);
        let outcome = s.append(msg(Platform::Discord, "hi", T0));
        let stored = outcome.inserted().unwrap();
        assert!(stored.id.starts_with("discord-"));
        assert!(!stored.is_read);
        assert_eq!(s.len(), 1);
        assert_eq!(s.unread_counts().discord, 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let s = store(500);
        for i in 0..501 {
            // 每条间隔超过去重窗口，内容也不同
            s.append(msg(Platform::Twitch, &format!("m{}", i), T0 + i * 10_000));
        }
        assert_eq!(s.len(), 500);
        let all = s.messages();
        assert_eq!(all[0].content, "m1");
        assert_eq!(all[499].content, "m500");
    }

    #[test]
    fn relay_echo_is_suppressed_both_directions() {
        let s = store(10);
        let original = s.append(msg(Platform::Telegram, "hello", T0));
        let original_id = original.inserted().unwrap().id.clone();

        let echo = s.append(msg(Platform::Discord, "[Telegram] alice: hello", T0 + 1_000));
        assert_eq!(echo, AppendOutcome::Suppressed { matched_id: original_id });

        let s = store(10);
        s.append(msg(Platform::Discord, "[Telegram] alice: hello", T0));
        let echo = s.append(msg(Platform::Telegram, "hello", T0 + 1_000));
        assert!(matches!(echo, AppendOutcome::Suppressed { .. }));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn only_recent_history_is_consulted() {
        let s = MessageStore::new(10, 2, RelayFilter::default());
        s.append(msg(Platform::Telegram, "hello", T0));
        s.append(msg(Platform::Twitch, "a", T0 + 1));
        s.append(msg(Platform::Twitch, "b", T0 + 2));
        let late = s.append(msg(Platform::Discord, "hello", T0 + 3));
        assert!(late.inserted().is_some());
    }

    #[test]
    fn insert_is_idempotent() {
        let s = store(10);
        let m = Message::from_incoming(
            msg(Platform::Discord, "hi", T0).with_platform_message_id("d-1"),
        );
        assert!(s.insert(m.clone()).inserted().is_some());
        assert_eq!(s.insert(m.clone()), AppendOutcome::AlreadyPresent);

        let mut same_platform_id = Message::from_incoming(
            msg(Platform::Discord, "hi again", T0).with_platform_message_id("d-1"),
        );
        same_platform_id.id = "other".to_string();
        assert_eq!(s.insert(same_platform_id), AppendOutcome::AlreadyPresent);
        assert_eq!(
            s.append(msg(Platform::Discord, "dup", T0).with_platform_message_id("d-1")),
            AppendOutcome::AlreadyPresent
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn delete_is_scoped_by_platform() {
        let s = store(10);
        s.append(msg(Platform::Discord, "a", T0).with_platform_message_id("42"));
        s.append(msg(Platform::Telegram, "b", T0 + 10_000).with_platform_message_id("42"));

        let removed = s.delete(Platform::Telegram, "42").unwrap();
        assert_eq!(removed.platform, Platform::Telegram);
        assert_eq!(s.len(), 1);
        assert_eq!(s.messages()[0].platform, Platform::Discord);

        assert!(s.delete(Platform::Telegram, "42").is_none());
        assert!(s.delete(Platform::Twitch, "nope").is_none());
    }

    #[test]
    fn update_replaces_content() {
        let s = store(10);
        s.append(msg(Platform::Discord, "typo", T0).with_platform_message_id("7"));
        assert!(s.update(Platform::Discord, "7", "fixed"));
        assert_eq!(s.messages()[0].content, "fixed");
        assert!(!s.update(Platform::Telegram, "7", "nope"));
    }

    #[test]
    fn mark_read_and_counts() {
        let s = store(10);
        let a = s.append(msg(Platform::Discord, "a", T0));
        s.append(msg(Platform::Telegram, "b", T0 + 10_000));
        s.append(msg(Platform::Twitch, "c", T0 + 20_000));

        assert!(s.mark_read(&a.inserted().unwrap().id));
        assert!(!s.mark_read("missing"));
        let counts = s.unread_counts();
        assert_eq!((counts.total, counts.discord, counts.get(Platform::Twitch)), (2, 0, 1));

        assert_eq!(s.mark_all_read(Some(Platform::Telegram)), 1);
        assert_eq!(s.mark_all_read(None), 1);
        assert_eq!(s.unread_counts().total, 0);
    }

    #[test]
    fn filter_and_clear() {
        let s = store(10);
        s.append(msg(Platform::Discord, "a", T0));
        s.append(msg(Platform::Twitch, "b", T0 + 10_000));

        s.set_filter(Filter::Platform(Platform::Twitch));
        assert_eq!(s.filter(), Filter::Platform(Platform::Twitch));
        let view = s.filtered();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].content, "b");

        assert_eq!(s.clear(Some(Platform::Discord)), 1);
        assert_eq!(s.clear(None), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn revision_moves_on_change_only() {
        let s = store(10);
        let rx = s.subscribe();
        s.append(msg(Platform::Discord, "a", T0).with_platform_message_id("1"));
        s.delete(Platform::Discord, "missing");
        s.append(msg(Platform::Discord, "a", T0).with_platform_message_id("1"));
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn filter_serde() {
        assert_eq!(serde_json::to_string(&Filter::All).unwrap(), r#""all""#);
        let f: Filter = serde_json::from_str(r#""telegram""#).unwrap();
        assert_eq!(f, Filter::Platform(Platform::Telegram));
    }
}
