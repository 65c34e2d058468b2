use std::fmt;

use serde::{Deserialize, Serialize};

/// Messaging-platform user id (opaque string).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(pub String);

impl SenderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rate-limit tier of a sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Normal,
    Vip,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Normal => "normal",
            Tier::Vip => "vip",
        }
    }
}

/// Which API key ultimately served a model call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Free,
    Paid,
}

impl KeySource {
    pub fn as_str(self) -> &'static str {
        match self {
            KeySource::Free => "free",
            KeySource::Paid => "paid",
        }
    }
}

/// Per-request moderation outcome. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationVerdict {
    Safe,
    Abuse,
    Spam,
    RateLimited,
}

impl ModerationVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ModerationVerdict::Safe => "safe",
            ModerationVerdict::Abuse => "abuse",
            ModerationVerdict::Spam => "spam",
            ModerationVerdict::RateLimited => "rate_limited",
        }
    }
}
