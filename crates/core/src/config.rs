//! Reconciler configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Knobs supplied at controller construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Archive but never write correlation annotations back onto the run.
    /// Used when an aggregating controller owns those annotations.
    pub disable_annotation_update: bool,
    /// Delay after completion before an unowned run is deleted.
    /// Zero disables cleanup; negative deletes as soon as the run completes.
    #[serde(rename = "completed_run_grace_period_ms", with = "signed_millis")]
    pub completed_run_grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self { disable_annotation_update: false, completed_run_grace_period: Duration::zero() }
    }
}

impl Config {
    /// Read `RUNVAULT_DISABLE_ANNOTATION_UPDATE` and
    /// `RUNVAULT_COMPLETED_RUN_GRACE_PERIOD`, keeping defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("RUNVAULT_DISABLE_ANNOTATION_UPDATE") {
            cfg.disable_annotation_update = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(d) = std::env::var("RUNVAULT_COMPLETED_RUN_GRACE_PERIOD").ok().and_then(|s| parse_duration(&s).ok()) {
            cfg.completed_run_grace_period = d;
        }
        cfg
    }

    pub fn cleanup_enabled(&self) -> bool {
        !self.completed_run_grace_period.is_zero()
    }
}

/// Parse a signed duration such as `-1s`, `90s`, `10m`, `2h`, `1d` or `250ms`.
/// A bare integer is taken as seconds. Values chrono cannot represent are
/// rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
    let (digits, unit) = body.split_at(split);
    let n: i64 = digits.parse().map_err(|_| format!("invalid duration: {:?}", s))?;
    let d = match unit {
        "" | "s" => Duration::try_seconds(n),
        "ms" => Duration::try_milliseconds(n),
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        other => return Err(format!("invalid duration unit {:?} in {:?} (use ms, s, m, h or d)", other, s)),
    };
    let d = d.ok_or_else(|| format!("duration out of range: {:?}", s))?;
    Ok(if neg { -d } else { d })
}

mod signed_millis {
    use chrono::Duration;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(d)?;
        Duration::try_milliseconds(ms).ok_or_else(|| D::Error::custom(format!("grace period out of range: {}ms", ms)))
    }
}
