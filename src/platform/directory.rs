//! Channel id → display name lookup.

use std::collections::HashMap;

use super::Platform;
use crate::config::ChannelsConfig;

/// Resolves human-readable channel names for messages whose adapter only knows the id.
#[derive(Debug, Clone, Default)]
pub struct ChannelDirectory {
    discord: HashMap<String, String>,
    telegram: HashMap<String, String>,
}

impl ChannelDirectory {
    pub fn new(config: &ChannelsConfig) -> Self {
        Self {
            discord: config.discord.clone(),
            telegram: config.telegram.clone(),
        }
    }

    /// Telegram uses topic ids; the general chat has no topic and is stored as `null`.
    pub fn resolve(&self, platform: Platform, channel_id: &str) -> String {
        match platform {
            Platform::Discord => self
                .discord
                .get(channel_id)
                .cloned()
                .unwrap_or_else(|| format!("channel-{channel_id}")),
            Platform::Telegram => {
                if channel_id.is_empty() || channel_id == "null" {
                    return self
                        .telegram
                        .get("null")
                        .cloned()
                        .unwrap_or_else(|| "general".to_string());
                }
                self.telegram
                    .get(channel_id)
                    .cloned()
                    .unwrap_or_else(|| format!("topic-{channel_id}"))
            }
            Platform::Twitch => channel_id.to_string(),
        }
    }
}
