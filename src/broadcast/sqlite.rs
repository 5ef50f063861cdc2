//! 基于 SQLite profile 的跨进程广播
//!
//! 每个进程用自己的连接向 `envelopes` 表追加信封。后台任务轮询
//! `PRAGMA data_version`（只有*其他*连接提交时才会变化），把别的进程写入的新行
//! 转发给本进程的订阅者。本进程内的订阅者在 `post` 时直接收到，不经过数据库。
//! 表只保留每个频道最近 `retain` 行，落后太多的进程会丢信封（至多一次投递）。

use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::{BroadcastTransport, Envelope};
use crate::storage::{StorageError, StorageResult};

struct Shared {
    db: Mutex<Connection>,
    /// 本连接写入的行带此标记，轮询时跳过
    writer: String,
    sender: broadcast::Sender<Envelope>,
    retain: i64,
}

/// 同一 profile 数据库上的命名广播频道
pub struct SqliteBus {
    name: Arc<str>,
    shared: Arc<Shared>,
    watcher: JoinHandle<()>,
}

impl SqliteBus {
    /// 打开（或创建）`path` 上名为 `name` 的频道并启动轮询任务。
    /// 打开之前已存在的信封不会重放。
    pub async fn open(
        path: &Path,
        name: &str,
        capacity: usize,
        retain: usize,
        poll_interval: Duration,
    ) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS envelopes (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                channel     TEXT NOT NULL,
                writer      TEXT NOT NULL,
                topic       TEXT NOT NULL,
                origin      TEXT NOT NULL,
                payload     TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_envelopes_channel_seq ON envelopes(channel, seq);
            "#,
        )?;
        let last_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM envelopes WHERE channel = ?1",
            params![name],
            |row| row.get(0),
        )?;

        let (sender, _) = broadcast::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            db: Mutex::new(conn),
            writer: uuid::Uuid::new_v4().simple().to_string(),
            sender,
            retain: retain.max(1) as i64,
        });
        let name: Arc<str> = Arc::from(name);
        let watcher = tokio::spawn(watch(
            Arc::downgrade(&shared),
            name.clone(),
            poll_interval,
            last_seq,
        ));

        Ok(Self {
            name,
            shared,
            watcher,
        })
    }
}

impl Drop for SqliteBus {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl BroadcastTransport for SqliteBus {
    fn name(&self) -> &str {
        &self.name
    }

    /// 写入数据库供其他进程读取，同时直接投递给本进程订阅者
    fn post(&self, envelope: Envelope) -> bool {
        let persisted = match self.shared.append(&self.name, &envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.name, topic = %envelope.topic, "persist broadcast envelope failed: {}", e);
                false
            }
        };
        let local = self.shared.sender.send(envelope).is_ok();
        persisted || local
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.shared.sender.subscribe()
    }
}

impl Shared {
    fn append(&self, channel: &str, envelope: &Envelope) -> StorageResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO envelopes (channel, writer, topic, origin, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                channel,
                self.writer,
                envelope.topic,
                envelope.origin,
                envelope.payload.to_string(),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        let seq = db.last_insert_rowid();
        db.execute(
            "DELETE FROM envelopes WHERE channel = ?1 AND seq <= ?2",
            params![channel, seq - self.retain],
        )?;
        Ok(())
    }

    /// 其他连接写入的、序号大于 `last_seq` 的信封
    fn fetch_new(
        &self,
        channel: &str,
        last_version: &mut Option<i64>,
        last_seq: &mut i64,
    ) -> StorageResult<Vec<Envelope>> {
        let db = self.db.lock().unwrap();
        let version: i64 = db.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        if *last_version == Some(version) {
            return Ok(Vec::new());
        }
        *last_version = Some(version);

        let mut stmt = db.prepare(
            "SELECT seq, topic, origin, payload FROM envelopes
             WHERE channel = ?1 AND seq > ?2 AND writer != ?3
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![channel, *last_seq, self.writer], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut envelopes = Vec::new();
        for row in rows {
            let (seq, topic, origin, payload) = row?;
            *last_seq = seq;
            match serde_json::from_str::<Value>(&payload) {
                Ok(payload) => envelopes.push(Envelope {
                    topic,
                    payload,
                    origin,
                }),
                Err(e) => warn!(seq, topic = %topic, "skipping malformed broadcast row: {}", e),
            }
        }
        Ok(envelopes)
    }
}

async fn watch(shared: Weak<Shared>, channel: Arc<str>, interval: Duration, mut last_seq: i64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_version: Option<i64> = None;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match shared.fetch_new(&channel, &mut last_version, &mut last_seq) {
            Ok(envelopes) => {
                for envelope in envelopes {
                    debug!(channel = %channel, topic = %envelope.topic, "broadcast from another process");
                    let _ = shared.sender.send(envelope);
                }
            }
            Err(e) => warn!(channel = %channel, "broadcast watcher: {}", e),
        }
    }
}
