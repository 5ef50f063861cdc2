use async_trait::async_trait;
use thiserror::Error;

use crate::platform::{IncomingMessage, Platform};
use crate::store::ConnectionUpdate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// 网络抖动、超时、5xx：退避后重连
    #[error("transient: {0}")]
    Transient(String),
    /// 凭据失效、被封禁：停止轮询
    #[error("permanent: {0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn reason(&self) -> &str {
        match self {
            AdapterError::Transient(r) | AdapterError::Permanent(r) => r,
        }
    }
}

/// What an adapter observed on its platform.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    NewMessage(IncomingMessage),
    MessageDeleted {
        platform_message_id: String,
    },
    MessageUpdated {
        platform_message_id: String,
        content: String,
    },
}

/// One platform's wire client. Implementations keep their own cursors.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn connect(&self) -> Result<(), AdapterError>;

    /// One round of fetching; may return an empty batch.
    async fn poll(&self) -> Result<Vec<AdapterEvent>, AdapterError>;

    async fn disconnect(&self) {}
}

/// Receiver of a poll loop's lifecycle reports and events.
pub trait PollSink: Send + Sync {
    fn on_status(&self, platform: Platform, update: ConnectionUpdate);

    fn on_event(&self, platform: Platform, event: AdapterEvent);
}
