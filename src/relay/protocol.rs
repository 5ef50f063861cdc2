//! Backend relay protocol.
//!
//! JSON Lines over a Unix socket (one JSON object per line), tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::platform::{IncomingMessage, Platform};
use crate::store::{ConnectionStatus, ConnectionUpdate};

// ─── Backend → Tab ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayEvent {
    NewMessage {
        platform: Platform,
        message: IncomingMessage,
    },
    MessageDeleted {
        platform: Platform,
        platform_message_id: String,
    },
    MessageUpdated {
        platform: Platform,
        platform_message_id: String,
        content: String,
    },
    /// A platform service changed state on the backend.
    ServiceStatus {
        platform: Platform,
        status: ConnectionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ServiceError {
        platform: Platform,
        error: String,
    },
}

impl RelayEvent {
    pub fn platform(&self) -> Platform {
        match self {
            RelayEvent::NewMessage { platform, .. }
            | RelayEvent::MessageDeleted { platform, .. }
            | RelayEvent::MessageUpdated { platform, .. }
            | RelayEvent::ServiceStatus { platform, .. }
            | RelayEvent::ServiceError { platform, .. } => *platform,
        }
    }
}

/// Map a reported service status onto a connection transition.
pub fn status_update(status: ConnectionStatus, error: Option<String>) -> ConnectionUpdate {
    match status {
        ConnectionStatus::Disconnected => ConnectionUpdate::Disconnected,
        ConnectionStatus::Connecting => ConnectionUpdate::Connecting,
        ConnectionStatus::Connected => ConnectionUpdate::Connected,
        ConnectionStatus::Error => {
            ConnectionUpdate::Error(error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

// ─── Tab → Backend ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayCommand {
    /// Ask for events of these platforms; empty means all.
    Subscribe { platforms: Vec<Platform> },
    Ping,
}
