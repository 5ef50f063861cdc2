//! Relay-echo suppression.
//!
//! A message is dropped when a message from a *different* platform with the same
//! normalized content arrived less than `window_ms` apart. Same-platform repeats are
//! always kept.

pub mod patterns;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::config::DedupConfig;
use crate::platform::{IncomingMessage, Message, Platform};

/// Upper bound on nested relay decorations stripped from one message.
const MAX_STRIP_PASSES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Echo of the stored message `matched_id`.
    Drop { matched_id: String },
}

/// The fields of a message the filter looks at.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub platform: Platform,
    pub content: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl<'a> From<&'a IncomingMessage> for Candidate<'a> {
    fn from(m: &'a IncomingMessage) -> Self {
        Self {
            platform: m.platform,
            content: &m.content,
            timestamp: m.timestamp,
        }
    }
}

impl<'a> From<&'a Message> for Candidate<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            platform: m.platform,
            content: &m.content,
            timestamp: m.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayFilter {
    prefixes: Vec<Regex>,
    window_ms: i64,
}

impl RelayFilter {
    pub fn new<I, S>(patterns: I, window_ms: u64) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            prefixes,
            window_ms: window_ms as i64,
        })
    }

    /// Built-in table (unless disabled) followed by `extra_prefixes`.
    pub fn from_config(config: &DedupConfig) -> Result<Self, regex::Error> {
        let builtin: &[&str] = if config.builtin_prefixes {
            patterns::BUILTIN_PREFIXES
        } else {
            &[]
        };
        let patterns = builtin
            .iter()
            .map(|p| p.to_string())
            .chain(config.extra_prefixes.iter().cloned());
        Self::new(patterns, config.window_ms)
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Strip relay decorations, collapse whitespace, lowercase.
    pub fn normalize(&self, content: &str) -> String {
        let mut rest = content.trim_start();
        for _ in 0..MAX_STRIP_PASSES {
            let hit = self
                .prefixes
                .iter()
                .find_map(|re| re.find(rest).filter(|m| m.start() == 0 && !m.is_empty()));
            match hit {
                Some(m) => rest = rest[m.end()..].trim_start(),
                None => break,
            }
        }
        rest.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn check<'m, I>(&self, candidate: &Candidate<'_>, history: I) -> Verdict
    where
        I: IntoIterator<Item = &'m Message>,
    {
        let normalized = self.normalize(candidate.content);
        if normalized.is_empty() {
            return Verdict::Accept;
        }
        let at = candidate.timestamp.timestamp_millis();

        for recent in history {
            if recent.platform == candidate.platform {
                continue;
            }
            let delta = (recent.timestamp.timestamp_millis() - at).abs();
            if delta >= self.window_ms {
                continue;
            }
            if self.normalize(&recent.content) == normalized {
                debug!(
                    platform = %candidate.platform,
                    echo_of = %recent.id,
                    delta_ms = delta,
                    "relay echo suppressed"
                );
                return Verdict::Drop {
                    matched_id: recent.id.clone(),
                };
            }
        }
        Verdict::Accept
    }

    pub fn is_relay_echo<'m, I>(&self, candidate: &Candidate<'_>, history: I) -> bool
    where
        I: IntoIterator<Item = &'m Message>,
    {
        matches!(self.check(candidate, history), Verdict::Drop { .. })
    }
}

impl Default for RelayFilter {
    fn default() -> Self {
        Self::new(patterns::BUILTIN_PREFIXES.iter().copied(), 5_000)
            .unwrap_or_else(|_| Self {
                prefixes: Vec::new(),
                window_ms: 5_000,
            })
    }
}
