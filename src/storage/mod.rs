//! profile 范围的共享存储
//!
//! tab 之间唯一共享的可变状态。两种后端：
//! - [`MemoryStorage`]：同一进程内的 tab
//! - [`SqliteStorage`]：不同进程中指向同一 profile 目录的 tab
//!
//! 跨进程广播见 [`SqliteBus`](crate::broadcast::SqliteBus)，与选主槽位共用同一个数据库文件。

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{CasOutcome, SharedStorage, StorageError, StorageEvent, StorageResult};
