pub mod schema;

pub use schema::{
    BroadcastConfig, ChannelsConfig, Config, DedupConfig, ElectionConfig, PollConfig,
    RelayConfig, StorageBackend, StorageConfig, StoreConfig,
};
