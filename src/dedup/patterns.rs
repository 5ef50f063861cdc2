//! 转发前缀表
//!
//! Relay bots re-post a message from one platform onto another with a decoration
//! in front. Each entry matches one such decoration anchored at the start of the
//! content; normalization strips them repeatedly until none applies.

// ─── 内置前缀 ─────────────────────────────────────────────────────────────────

/// 通用转发格式 `[Tag] author: `
const GENERIC_TAGGED_AUTHOR: &str = r"^\[[^\]\n]{1,32}\]\s*[^:\n]{1,64}:\s*";

/// 全角括号变体 `［Tag］ author: `，冒号也可能是全角
const FULLWIDTH_TAGGED_AUTHOR: &str = r"^［[^］\n]{1,32}］\s*[^:：\n]{1,64}[:：]\s*";

/// 单独的平台标签 `[Telegram] `
const PLATFORM_TAG: &str = r"(?i)^\[(telegram|discord|twitch|tg|dc)\]\s*";

const FULLWIDTH_PLATFORM_TAG: &str = r"(?i)^［(telegram|discord|twitch|tg|dc)］\s*";

/// 回复标记字符
const REPLY_GLYPH: &str = r"^(↩️|↩|↪️|↪|⤴️|⤴)\s*";

/// `Replying to X: `
const REPLYING_TO: &str = r"(?i)^replying to [^:\n]{1,64}:\s*";

pub const BUILTIN_PREFIXES: &[&str] = &[
    GENERIC_TAGGED_AUTHOR,
    FULLWIDTH_TAGGED_AUTHOR,
    PLATFORM_TAG,
    FULLWIDTH_PLATFORM_TAG,
    REPLY_GLYPH,
    REPLYING_TO,
];
