//! Allowed-hours window passed to the agent at launch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HoursError {
    #[error("start hour {0} is out of range (0-23)")]
    StartOutOfRange(u8),
    #[error("end hour {0} is out of range (0-24)")]
    EndOutOfRange(u8),
}

/// Hours of the day during which the agent may start new iterations.
///
/// `start > end` describes a window that crosses midnight, e.g. `22-8`.
/// `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedHours {
    pub start: u8,
    pub end: u8,
}

impl AllowedHours {
    /// The whole day.
    pub const ALL_DAY: AllowedHours = AllowedHours { start: 0, end: 24 };

    pub fn new(start: u8, end: u8) -> Result<Self, HoursError> {
        if start > 23 {
            return Err(HoursError::StartOutOfRange(start));
        }
        if end > 24 {
            return Err(HoursError::EndOutOfRange(end));
        }
        Ok(Self { start, end })
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, hour: u8) -> bool {
        is_within_allowed_hours(*self, hour)
    }
}

impl Default for AllowedHours {
    fn default() -> Self {
        Self::ALL_DAY
    }
}

/// Whether `hour` (0-23) falls inside `window`.
pub fn is_within_allowed_hours(window: AllowedHours, hour: u8) -> bool {
    if window.crosses_midnight() {
        hour >= window.start || hour < window.end
    } else {
        hour >= window.start && hour < window.end
    }
}
