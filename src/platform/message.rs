use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Platform;

/// 消息类型（普通文本 / 加入 / 离开 / 系统通知）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    UserJoin,
    UserLeave,
    System,
}

/// 附件（图片、文件等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// 被回复消息的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub author: String,
    pub content: String,
}

/// Event shape every platform adapter (or the backend relay) hands to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub platform: Platform,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub channel_id: String,
    /// Filled from the channel directory when the adapter does not know it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, rename = "isDM")]
    pub is_dm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
}

impl IncomingMessage {
    /// 构造最小的文本消息，其余字段用默认值
    pub fn text(
        platform: Platform,
        author: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            platform,
            author: author.into(),
            content: content.into(),
            timestamp,
            channel_id: String::new(),
            channel_name: None,
            is_dm: false,
            platform_message_id: None,
            avatar_url: None,
            message_type: MessageType::Text,
            is_bot: false,
            attachments: vec![],
            reply_to: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn with_platform_message_id(mut self, id: impl Into<String>) -> Self {
        self.platform_message_id = Some(id.into());
        self
    }

    pub fn direct(mut self) -> Self {
        self.is_dm = true;
        self
    }
}

/// A message held by a tab's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub platform: Platform,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default, rename = "isDM")]
    pub is_dm: bool,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
}

impl Message {
    /// Materialize an incoming event as an unread message with a fresh id.
    pub fn from_incoming(incoming: IncomingMessage) -> Self {
        let id = format!("{}-{}", incoming.platform, uuid::Uuid::new_v4());
        Self {
            id,
            platform: incoming.platform,
            author: incoming.author,
            content: incoming.content,
            timestamp: incoming.timestamp,
            channel_name: incoming
                .channel_name
                .unwrap_or_else(|| incoming.channel_id.clone()),
            channel_id: incoming.channel_id,
            is_dm: incoming.is_dm,
            is_read: false,
            platform_message_id: incoming.platform_message_id,
            avatar_url: incoming.avatar_url,
            message_type: incoming.message_type,
            is_bot: incoming.is_bot,
            attachments: incoming.attachments,
            reply_to: incoming.reply_to,
        }
    }

    /// Whether this message is the store copy of `(platform, platform_message_id)`.
    pub fn is_platform_message(&self, platform: Platform, platform_message_id: &str) -> bool {
        self.platform == platform && self.platform_message_id.as_deref() == Some(platform_message_id)
    }
}
