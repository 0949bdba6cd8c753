// guardian-rs/src/window.rs
// Restricted operating window predicate, consulted only at PRE.

use chrono::{DateTime, NaiveTime, Utc};
use shared_types::config::OperatingWindowConfig;
use shared_types::ConfigError;

/// When active, a POST rejection escalates instead of retrying.
pub trait RestrictedWindow: Send + Sync {
    fn is_restricted(&self, at: DateTime<Utc>) -> bool;
}

/// Never restricted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl RestrictedWindow for Unrestricted {
    fn is_restricted(&self, _at: DateTime<Utc>) -> bool {
        false
    }
}

/// Daily UTC windows. A window whose end precedes its start spans midnight;
/// equal bounds describe an empty window.
#[derive(Debug, Clone, Default)]
pub struct ScheduleWindow {
    windows: Vec<(NaiveTime, NaiveTime)>,
}

impl ScheduleWindow {
    pub fn new(windows: Vec<(NaiveTime, NaiveTime)>) -> Self {
        Self { windows }
    }

    pub fn from_config(windows: &[OperatingWindowConfig]) -> Result<Self, ConfigError> {
        let windows = windows
            .iter()
            .map(OperatingWindowConfig::parse_bounds)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(windows))
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl RestrictedWindow for ScheduleWindow {
    fn is_restricted(&self, at: DateTime<Utc>) -> bool {
        let time = at.time();
        self.windows.iter().any(|&(start, end)| {
            if start <= end {
                start <= time && time < end
            } else {
                time >= start || time < end
            }
        })
    }
}
