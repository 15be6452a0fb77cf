use crate::db;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const PROMOTION_SETTINGS_KEY: &str = "setup.promotion";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionConfig {
    /// Delay between consecutive dispatches within a batch.
    pub stagger_ms: u64,
    /// Wait before reloading the roster after a successful batch.
    pub settle_ms: u64,
    pub request_timeout_ms: u64,
    /// How long the summary banner stays visible.
    pub banner_ms: u64,
    /// Treat a class-id mismatch in the server echo as a failure.
    pub strict_verification: bool,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 50,
            settle_ms: 2000,
            request_timeout_ms: 15_000,
            banner_ms: 5000,
            strict_verification: false,
        }
    }
}

impl PromotionConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn banner(&self) -> Duration {
        Duration::from_millis(self.banner_ms)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Applies a partial update; on error nothing is changed.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            match k.as_str() {
                "staggerMs" => next.stagger_ms = parse_u64_range(v, k, 0, 5000)?,
                "settleMs" => next.settle_ms = parse_u64_range(v, k, 0, 60_000)?,
                "requestTimeoutMs" => {
                    next.request_timeout_ms = parse_u64_range(v, k, 100, 120_000)?
                }
                "bannerMs" => next.banner_ms = parse_u64_range(v, k, 0, 60_000)?,
                "strictVerification" => {
                    next.strict_verification = v
                        .as_bool()
                        .ok_or_else(|| format!("{} must be boolean", k))?
                }
                _ => return Err(format!("unknown promotion field: {}", k)),
            }
        }
        *self = next;
        Ok(())
    }

    /// Defaults overlaid with whatever the workspace has saved.
    pub fn load(conn: &rusqlite::Connection) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(saved) = db::settings_get_json(conn, PROMOTION_SETTINGS_KEY)? {
            if let Some(obj) = saved.as_object() {
                // Malformed historical values fall back to defaults.
                if let Err(e) = cfg.merge_patch(obj) {
                    tracing::warn!(error = %e, "ignoring saved promotion settings");
                }
            }
        }
        Ok(cfg)
    }

    pub fn save(&self, conn: &rusqlite::Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, PROMOTION_SETTINGS_KEY, &self.to_json())
    }
}

fn parse_u64_range(v: &Value, key: &str, min: u64, max: u64) -> Result<u64, String> {
    let n = v
        .as_u64()
        .ok_or_else(|| format!("{} must be a non-negative integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}
