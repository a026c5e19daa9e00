//! Duration literals
//!
//! The DSL writes durations either as ISO-8601 strings (`PT30S`) or as an
//! object of components (`{seconds: 30}`).

use serde::{Deserialize, Serialize};

/// Duration components given as an object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationParts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milliseconds: Option<u64>,
}

/// A DSL duration literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DslDuration {
    /// ISO-8601 duration string, e.g. `PT1H30M`
    Iso(String),

    /// Component object, e.g. `{minutes: 90}`
    Parts(DurationParts),
}

impl DslDuration {
    /// Total duration in milliseconds
    ///
    /// ISO years count as 365 days and months as 30 days, matching the
    /// parser crate's own conversion.
    pub fn to_millis(&self) -> Result<u64, DurationParseError> {
        match self {
            Self::Parts(p) => {
                let mut ms = p.milliseconds.unwrap_or(0);
                ms += p.seconds.unwrap_or(0) * 1_000;
                ms += p.minutes.unwrap_or(0) * 60_000;
                ms += p.hours.unwrap_or(0) * 3_600_000;
                ms += p.days.unwrap_or(0) * 86_400_000;
                Ok(ms)
            }
            Self::Iso(s) => {
                let parsed = iso8601::duration(s)
                    .map_err(|e| DurationParseError::Iso(s.clone(), e))?;
                Ok(match parsed {
                    iso8601::Duration::YMDHMS {
                        year,
                        month,
                        day,
                        hour,
                        minute,
                        second,
                        millisecond,
                    } => {
                        u64::from(millisecond)
                            + u64::from(second) * 1_000
                            + u64::from(minute) * 60_000
                            + u64::from(hour) * 3_600_000
                            + u64::from(day) * 86_400_000
                            + u64::from(month) * 30 * 86_400_000
                            + u64::from(year) * 365 * 86_400_000
                    }
                    iso8601::Duration::Weeks(w) => u64::from(w) * 7 * 86_400_000,
                })
            }
        }
    }

    /// The duration as a `chrono::Duration`
    pub fn to_chrono(&self) -> Result<chrono::Duration, DurationParseError> {
        let ms = self.to_millis()?;
        Ok(chrono::Duration::milliseconds(ms as i64))
    }
}

/// Duration parse failures
#[derive(Debug, thiserror::Error)]
pub enum DurationParseError {
    /// Invalid ISO-8601 duration string
    #[error("invalid ISO-8601 duration {0:?}: {1}")]
    Iso(String, String),
}
