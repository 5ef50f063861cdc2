//! 平台与统一消息模型
//!
//! Discord / Telegram / Twitch 三个来源的消息在进入 store 之前统一成同一种形状。

pub mod directory;
pub mod message;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use directory::ChannelDirectory;
pub use message::{Attachment, IncomingMessage, Message, MessageType, ReplyTo};

/// 消息来源平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Discord,
    Telegram,
    Twitch,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Discord, Platform::Telegram, Platform::Twitch];

    /// 获取平台标识字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Telegram => "telegram",
            Platform::Twitch => "twitch",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(Platform::Discord),
            "telegram" => Ok(Platform::Telegram),
            "twitch" => Ok(Platform::Twitch),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}
