pub mod broadcast;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod election;
pub mod platform;
pub mod poller;
pub mod relay;
pub mod storage;
pub mod store;
pub mod tab;
