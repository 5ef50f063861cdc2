use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::Clock;
use crate::platform::Platform;

/// 平台连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Lifecycle report from a poll loop or the backend relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connecting,
    Connected,
    Error(String),
    Disconnected,
}

pub type ConnectionSnapshot = BTreeMap<Platform, ConnectionState>;

fn all_disconnected() -> ConnectionSnapshot {
    Platform::ALL
        .iter()
        .map(|p| (*p, ConnectionState::default()))
        .collect()
}

/// Per-platform connection state of one tab.
pub struct ConnectionRegistry {
    states: watch::Sender<ConnectionSnapshot>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (states, _) = watch::channel(all_disconnected());
        Self { states, clock }
    }

    pub fn set_connecting(&self, platform: Platform) -> ConnectionState {
        self.modify(platform, |s| {
            s.status = ConnectionStatus::Connecting;
            s.error = None;
        })
    }

    pub fn set_connected(&self, platform: Platform) -> ConnectionState {
        let now = self.clock.now();
        self.modify(platform, |s| {
            s.status = ConnectionStatus::Connected;
            s.error = None;
            s.last_connected_at = Some(now);
        })
    }

    pub fn set_error(&self, platform: Platform, reason: impl Into<String>) -> ConnectionState {
        let reason = reason.into();
        self.modify(platform, |s| {
            s.status = ConnectionStatus::Error;
            s.error = Some(reason);
        })
    }

    pub fn disconnect(&self, platform: Platform) -> ConnectionState {
        self.modify(platform, |s| {
            s.status = ConnectionStatus::Disconnected;
            s.error = None;
        })
    }

    pub fn disconnect_all(&self) {
        self.states.send_if_modified(|states| {
            let reset = all_disconnected();
            if *states == reset {
                return false;
            }
            *states = reset;
            true
        });
    }

    pub fn apply_update(&self, platform: Platform, update: &ConnectionUpdate) -> ConnectionState {
        match update {
            ConnectionUpdate::Connecting => self.set_connecting(platform),
            ConnectionUpdate::Connected => self.set_connected(platform),
            ConnectionUpdate::Error(reason) => self.set_error(platform, reason.clone()),
            ConnectionUpdate::Disconnected => self.disconnect(platform),
        }
    }

    /// Mirror a state reported by another tab verbatim.
    pub fn apply(&self, platform: Platform, state: ConnectionState) {
        self.states.send_if_modified(|states| {
            if states.get(&platform) == Some(&state) {
                return false;
            }
            states.insert(platform, state);
            true
        });
    }

    pub fn get(&self, platform: Platform) -> ConnectionState {
        self.states
            .borrow()
            .get(&platform)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.states.borrow().clone()
    }

    pub fn is_any_connected(&self) -> bool {
        self.states
            .borrow()
            .values()
            .any(|s| s.status == ConnectionStatus::Connected)
    }

    pub fn connected_platforms(&self) -> Vec<Platform> {
        self.states
            .borrow()
            .iter()
            .filter(|(_, s)| s.status == ConnectionStatus::Connected)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.states.subscribe()
    }

    fn modify(&self, platform: Platform, f: impl FnOnce(&mut ConnectionState)) -> ConnectionState {
        let mut result = ConnectionState::default();
        self.states.send_if_modified(|states| {
            let state = states.entry(platform).or_default();
            let before = state.clone();
            f(state);
            result = state.clone();
            before != *state
        });
        debug!(%platform, status = ?result.status, "connection state");
        result
    }
}
