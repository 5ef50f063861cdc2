//! SQLite-backed profile (`<profile>/shared.db`).
//!
//! Every process opens its own connection. Changes made by other connections are
//! detected by polling `PRAGMA data_version`, which only moves when *another*
//! connection commits, then diffing slot values against the last snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{CasOutcome, SharedStorage, StorageError, StorageEvent, StorageResult};

const EVENT_CAPACITY: usize = 64;

struct Shared {
    db: Mutex<Connection>,
    snapshot: std::sync::Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

pub struct SqliteStorage {
    shared: Arc<Shared>,
    watcher: JoinHandle<()>,
}

impl SqliteStorage {
    /// Open (or create) the profile database and start the change watcher.
    pub async fn open(path: &Path, watch_interval: Duration) -> StorageResult<Self> {
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
            CREATE TABLE IF NOT EXISTS slots (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            "#,
        )?;
        let snapshot = load_slots(&conn)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            db: Mutex::new(conn),
            snapshot: std::sync::Mutex::new(snapshot),
            events,
        });
        let watcher = tokio::spawn(watch(Arc::downgrade(&shared), watch_interval));

        Ok(Self { shared, watcher })
    }

    fn remember(&self, key: &str, value: Option<&str>) {
        let mut snapshot = self.shared.snapshot.lock().unwrap();
        match value {
            Some(v) => {
                snapshot.insert(key.to_string(), v.to_string());
            }
            None => {
                snapshot.remove(key);
            }
        }
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn load_slots(conn: &Connection) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM slots")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let slots: rusqlite::Result<HashMap<String, String>> = rows.collect();
    slots
}

fn upsert(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO slots (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn read_slot(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM slots WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

async fn watch(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_version: Option<i64> = None;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(e) = shared.poll_changes(&mut last_version).await {
            warn!("shared storage watcher: {}", e);
        }
    }
}

impl Shared {
    async fn poll_changes(&self, last_version: &mut Option<i64>) -> StorageResult<()> {
        let current = {
            let db = self.db.lock().await;
            let version: i64 = db.query_row("PRAGMA data_version", [], |row| row.get(0))?;
            if *last_version == Some(version) {
                return Ok(());
            }
            *last_version = Some(version);
            load_slots(&db)?
        };

        let changed: Vec<String> = {
            let mut snapshot = self.snapshot.lock().unwrap();
            let mut changed: Vec<String> = current
                .iter()
                .filter(|(k, v)| snapshot.get(*k) != Some(*v))
                .map(|(k, _)| k.clone())
                .collect();
            changed.extend(
                snapshot
                    .keys()
                    .filter(|k| !current.contains_key(*k))
                    .cloned(),
            );
            *snapshot = current;
            changed
        };

        for key in changed {
            debug!(key = %key, "shared slot changed by another process");
            let _ = self.events.send(StorageEvent { key });
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStorage for SqliteStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let db = self.shared.db.lock().await;
        Ok(read_slot(&db, key)?)
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        {
            let db = self.shared.db.lock().await;
            upsert(&db, key, value)?;
        }
        self.remember(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        {
            let db = self.shared.db.lock().await;
            db.execute("DELETE FROM slots WHERE key = ?1", params![key])?;
        }
        self.remember(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> StorageResult<CasOutcome> {
        {
            let mut db = self.shared.db.lock().await;
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_slot(&tx, key)?;
            if current.as_deref() != expected {
                return Ok(CasOutcome::Conflict { current });
            }
            match new {
                Some(v) => upsert(&tx, key, v)?,
                None => {
                    tx.execute("DELETE FROM slots WHERE key = ?1", params![key])?;
                }
            }
            tx.commit()?;
        }
        self.remember(key, new);
        Ok(CasOutcome::Swapped)
    }
}
