use serde::{Deserialize, Serialize};

/// Contents of the shared leader slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    pub owner_id: String,
    /// Wall-clock ms of the owner's last renewal.
    pub last_heartbeat: i64,
    pub elected_at: i64,
}

impl LeaderRecord {
    pub fn new(owner_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            owner_id: owner_id.into(),
            last_heartbeat: now_ms,
            elected_at: now_ms,
        }
    }

    pub fn renewed(&self, now_ms: i64) -> Self {
        Self {
            last_heartbeat: now_ms,
            ..self.clone()
        }
    }

    /// Negative when the writer's clock runs ahead of ours.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_heartbeat
    }

    pub fn is_expired(&self, now_ms: i64, timeout_ms: u64) -> bool {
        self.age_ms(now_ms) > timeout_ms as i64
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// What a read of the leader slot found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Empty,
    /// Present but unparseable; treated as absent.
    Corrupt(String),
    /// Parsed record plus the raw value, kept for compare-and-swap.
    Held(LeaderRecord, String),
}

impl Slot {
    pub fn parse(raw: Option<String>) -> Self {
        match raw {
            None => Slot::Empty,
            Some(raw) => match serde_json::from_str::<LeaderRecord>(&raw) {
                Ok(record) if !record.owner_id.is_empty() => Slot::Held(record, raw),
                _ => Slot::Corrupt(raw),
            },
        }
    }

    pub fn record(&self) -> Option<&LeaderRecord> {
        match self {
            Slot::Held(record, _) => Some(record),
            _ => None,
        }
    }
}
