use async_trait::async_trait;
use tokio::sync::broadcast;

/// 共享存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Quota exhausted, profile locked, or the backend switched off.
    #[error("shared storage unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A slot was written or removed by another handle of the same profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
}

/// Result of [`SharedStorage::compare_and_swap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The slot no longer held the expected value.
    Conflict { current: Option<String> },
    /// Backend has no atomic primitive; callers fall back to write-then-reread.
    Unsupported,
}

/// Key/value slots visible to every tab of one profile.
///
/// Handles never observe their own writes through [`subscribe`](Self::subscribe),
/// matching how a browser's `storage` event skips the writing tab.
#[async_trait]
pub trait SharedStorage: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    async fn remove(&self, key: &str) -> StorageResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;

    /// Atomically replace the slot if it still holds `expected` (`None` = absent).
    /// `new = None` removes the slot.
    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: Option<&str>,
    ) -> StorageResult<CasOutcome> {
        Ok(CasOutcome::Unsupported)
    }
}
