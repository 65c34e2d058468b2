//! Per-sender fixed window ("sliding by reset") rate limiting.
//!
//! A window opens on the first request after the previous one lapsed and keeps
//! the tier it was opened with until it lapses. A sender promoted to VIP
//! mid-window therefore keeps the old limit until the window rolls over.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{RateLimitConfig, TierLimit},
    domain::{SenderId, Tier},
    ports::WindowCache,
    Result,
};

/// Stored per-sender window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start_ms: i64,
    pub tier: Tier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_minutes: u64,
    pub tier: Tier,
    pub limit: u32,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    cache: Arc<dyn WindowCache>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig, cache: Arc<dyn WindowCache>) -> Self {
        Self {
            cfg: cfg.clone(),
            cache,
        }
    }

    pub fn fail_open(&self) -> bool {
        self.cfg.fail_open
    }

    pub fn resolve_tier(&self, sender: &SenderId) -> Tier {
        if self.cfg.vip_senders.iter().any(|v| v == sender.as_str()) {
            Tier::Vip
        } else {
            Tier::Normal
        }
    }

    fn tier_limit(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Normal => self.cfg.normal,
            Tier::Vip => self.cfg.vip,
        }
    }

    pub async fn check(&self, sender: &SenderId) -> Result<RateDecision> {
        self.check_at(sender, Utc::now()).await
    }

    /// Count one request against the sender's window.
    pub async fn check_at(&self, sender: &SenderId, now: DateTime<Utc>) -> Result<RateDecision> {
        let resolved = self.resolve_tier(sender);
        if !self.cfg.enabled {
            return Ok(self.unlimited(resolved));
        }

        let key = window_key(sender);
        let now_ms = now.timestamp_millis();

        let Some(mut window) = self.live_window(&key, now_ms).await? else {
            let limits = self.tier_limit(resolved);
            let window = RateWindow {
                count: 1,
                window_start_ms: now_ms,
                tier: resolved,
            };
            self.cache.put(&key, window, limits.window).await?;
            return Ok(RateDecision {
                allowed: true,
                remaining: limits.limit.saturating_sub(1),
                reset_in_minutes: minutes_ceil(limits.window),
                tier: resolved,
                limit: limits.limit,
            });
        };

        let limits = self.tier_limit(window.tier);
        let left = remaining_lifetime(&window, limits, now_ms);

        if window.count < limits.limit {
            window.count += 1;
            let decision = RateDecision {
                allowed: true,
                remaining: limits.limit - window.count,
                reset_in_minutes: minutes_ceil(left),
                tier: window.tier,
                limit: limits.limit,
            };
            self.cache.put(&key, window, left).await?;
            return Ok(decision);
        }

        debug!(sender = %sender, tier = window.tier.as_str(), "rate window exhausted");
        Ok(RateDecision {
            allowed: false,
            remaining: 0,
            reset_in_minutes: minutes_ceil(left),
            tier: window.tier,
            limit: limits.limit,
        })
    }

    pub async fn status(&self, sender: &SenderId) -> Result<RateDecision> {
        self.status_at(sender, Utc::now()).await
    }

    /// Same resolution as [`Self::check_at`] without counting a request.
    pub async fn status_at(&self, sender: &SenderId, now: DateTime<Utc>) -> Result<RateDecision> {
        let resolved = self.resolve_tier(sender);
        if !self.cfg.enabled {
            return Ok(self.unlimited(resolved));
        }

        let now_ms = now.timestamp_millis();
        match self.live_window(&window_key(sender), now_ms).await? {
            None => {
                let limits = self.tier_limit(resolved);
                Ok(RateDecision {
                    allowed: true,
                    remaining: limits.limit,
                    reset_in_minutes: minutes_ceil(limits.window),
                    tier: resolved,
                    limit: limits.limit,
                })
            }
            Some(window) => {
                let limits = self.tier_limit(window.tier);
                Ok(RateDecision {
                    allowed: window.count < limits.limit,
                    remaining: limits.limit.saturating_sub(window.count),
                    reset_in_minutes: minutes_ceil(remaining_lifetime(&window, limits, now_ms)),
                    tier: window.tier,
                    limit: limits.limit,
                })
            }
        }
    }

    /// The stored window, unless its length has already elapsed.
    async fn live_window(&self, key: &str, now_ms: i64) -> Result<Option<RateWindow>> {
        let stored = self.cache.get(key).await?;
        Ok(stored.filter(|w| {
            let window_ms = self.tier_limit(w.tier).window.as_millis() as i64;
            elapsed_ms(w, now_ms) < window_ms
        }))
    }

    fn unlimited(&self, tier: Tier) -> RateDecision {
        let limits = self.tier_limit(tier);
        RateDecision {
            allowed: true,
            remaining: limits.limit,
            reset_in_minutes: 0,
            tier,
            limit: limits.limit,
        }
    }
}

fn window_key(sender: &SenderId) -> String {
    format!("rate:{sender}")
}

fn elapsed_ms(window: &RateWindow, now_ms: i64) -> i64 {
    (now_ms - window.window_start_ms).max(0)
}

fn remaining_lifetime(window: &RateWindow, limits: TierLimit, now_ms: i64) -> Duration {
    let window_ms = limits.window.as_millis() as i64;
    let left = (window_ms - elapsed_ms(window, now_ms)).max(0);
    Duration::from_millis(left as u64)
}

fn minutes_ceil(d: Duration) -> u64 {
    (d.as_millis() as u64).div_ceil(60_000)
}
