//! Tier assignment policy
//!
//! Maps a registration order to pricing terms. Early accounts get the
//! free tier, the next block gets promotional pricing with a long trial,
//! everyone after that gets the standard plan.
//!
//! The thresholds and prices live in [`TierSchedule`] so the policy can
//! be exercised in tests without touching configuration loading.

use serde::{Deserialize, Serialize};

/// Pricing/feature category of a subscription, fixed at signup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Promotional,
    Standard,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Promotional => "promotional",
            Tier::Standard => "standard",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "promotional" => Some(Tier::Promotional),
            "standard" => Some(Tier::Standard),
            _ => None,
        }
    }

    /// Free-tier subscriptions never touch the payment processor and are
    /// not subject to the billing state machine.
    pub fn requires_billing(&self) -> bool {
        !matches!(self, Tier::Free)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terms assigned to a subscription at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierTerms {
    pub tier: Tier,
    pub monthly_price_cents: i64,
    pub trial_days: i64,
}

/// Registration-order thresholds and per-tier pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSchedule {
    /// Orders `1..=free_max` get the free tier.
    pub free_max: i64,
    /// Orders `free_max+1..=free_max+promotional_max` get promotional pricing.
    pub promotional_max: i64,
    pub promotional_price_cents: i64,
    pub standard_price_cents: i64,
    pub promotional_trial_days: i64,
    pub standard_trial_days: i64,
}

impl Default for TierSchedule {
    fn default() -> Self {
        Self {
            free_max: 100,
            promotional_max: 400,
            promotional_price_cents: 900,
            standard_price_cents: 1900,
            promotional_trial_days: 90,
            standard_trial_days: 30,
        }
    }
}

impl TierSchedule {
    /// Load the schedule from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn env_i64(key: &str, default: i64) -> i64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            free_max: env_i64("TIER_FREE_MAX", defaults.free_max),
            promotional_max: env_i64("TIER_PROMOTIONAL_MAX", defaults.promotional_max),
            promotional_price_cents: env_i64(
                "TIER_PROMOTIONAL_PRICE_CENTS",
                defaults.promotional_price_cents,
            ),
            standard_price_cents: env_i64(
                "TIER_STANDARD_PRICE_CENTS",
                defaults.standard_price_cents,
            ),
            promotional_trial_days: env_i64(
                "TIER_PROMOTIONAL_TRIAL_DAYS",
                defaults.promotional_trial_days,
            ),
            standard_trial_days: env_i64("TIER_STANDARD_TRIAL_DAYS", defaults.standard_trial_days),
        }
    }

    /// Pure lookup from registration order to pricing terms.
    pub fn terms_for(&self, order: i64) -> TierTerms {
        if order <= self.free_max {
            TierTerms {
                tier: Tier::Free,
                monthly_price_cents: 0,
                trial_days: 0,
            }
        } else if order <= self.free_max + self.promotional_max {
            TierTerms {
                tier: Tier::Promotional,
                monthly_price_cents: self.promotional_price_cents,
                trial_days: self.promotional_trial_days,
            }
        } else {
            TierTerms {
                tier: Tier::Standard,
                monthly_price_cents: self.standard_price_cents,
                trial_days: self.standard_trial_days,
            }
        }
    }

    /// Trial length for a tier already assigned. Used when an event
    /// starts a trial but carries no explicit trial end.
    pub fn trial_days_for(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Free => 0,
            Tier::Promotional => self.promotional_trial_days,
            Tier::Standard => self.standard_trial_days,
        }
    }
}
