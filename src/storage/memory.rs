use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::traits::{CasOutcome, SharedStorage, StorageError, StorageEvent, StorageResult};

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct Profile {
    slots: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<(u64, broadcast::Sender<StorageEvent>)>>,
    next_handle: AtomicU64,
    unavailable: AtomicBool,
}

/// In-process profile. Each [`handle`](Self::handle) is one tab's view of it.
pub struct MemoryStorage {
    profile: Arc<Profile>,
    handle_id: u64,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStorage {
    /// Create a fresh profile and return its first handle.
    pub fn new() -> Self {
        Self::attach(Arc::new(Profile::default()))
    }

    /// Another participant on the same profile.
    pub fn handle(&self) -> Self {
        Self::attach(self.profile.clone())
    }

    /// Make every write on this profile fail, as a full quota would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.profile.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn attach(profile: Arc<Profile>) -> Self {
        let handle_id = profile.next_handle.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        profile
            .listeners
            .lock()
            .unwrap()
            .push((handle_id, events.clone()));
        Self {
            profile,
            handle_id,
            events,
        }
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.profile.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".to_string()));
        }
        Ok(())
    }

    fn notify_others(&self, key: &str) {
        let listeners = self.profile.listeners.lock().unwrap();
        for (id, tx) in listeners.iter() {
            if *id != self.handle_id {
                let _ = tx.send(StorageEvent {
                    key: key.to_string(),
                });
            }
        }
    }

    fn write(&self, key: &str, value: Option<&str>) -> bool {
        let mut slots = self.profile.slots.lock().unwrap();
        match value {
            Some(v) => slots.insert(key.to_string(), v.to_string()).as_deref() != Some(v),
            None => slots.remove(key).is_some(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.profile.listeners.lock() {
            listeners.retain(|(id, _)| *id != self.handle_id);
        }
    }
}

#[async_trait]
impl SharedStorage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.profile.slots.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.ensure_writable()?;
        if self.write(key, Some(value)) {
            self.notify_others(key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.ensure_writable()?;
        if self.write(key, None) {
            self.notify_others(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> StorageResult<CasOutcome> {
        self.ensure_writable()?;
        {
            let mut slots = self.profile.slots.lock().unwrap();
            let current = slots.get(key).cloned();
            if current.as_deref() != expected {
                return Ok(CasOutcome::Conflict { current });
            }
            match new {
                Some(v) => {
                    slots.insert(key.to_string(), v.to_string());
                }
                None => {
                    slots.remove(key);
                }
            }
        }
        self.notify_others(key);
        Ok(CasOutcome::Swapped)
    }
}
