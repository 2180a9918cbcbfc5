use serde::{Deserialize, Serialize};

use super::states::JobState;

/// Most urgent priority: reserved before anything else.
pub const PRIORITY_HIGHEST: u32 = 0;
/// Middle of the range. Anything numerically below it counts as urgent.
pub const PRIORITY_MEDIUM: u32 = 1 << 31;
/// Least urgent priority.
pub const PRIORITY_LOWEST: u32 = u32::MAX;
pub const PRIORITY_DEFAULT: u32 = PRIORITY_MEDIUM;

pub const DEFAULT_TUBE: &str = "default";

/// One row of the jobs table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub tube: String,
    /// Serialised payload.
    pub body: String,
    /// Epoch seconds, set once by the store on insert.
    pub created_at: i64,
    /// Epoch seconds before which the job can't be reserved; 0 if none.
    pub delay: i64,
    /// Lower is more urgent.
    pub priority: u32,
    pub reserved: bool,
    pub buried: bool,
}

impl JobRecord {
    /// Derives the job's state at time `now`.
    ///
    /// The flags are checked in precedence order, so a buried job that is
    /// also marked reserved reports as buried, and an urgent job with a
    /// pending delay reports as urgent.
    pub fn state_at(&self, now: i64) -> JobState {
        if self.buried {
            JobState::Buried
        } else if self.reserved {
            JobState::Reserved
        } else if is_urgent(self.priority) {
            JobState::Urgent
        } else if self.is_delayed_at(now) {
            JobState::Delayed
        } else {
            JobState::Ready
        }
    }

    /// Whether the delay timestamp is still in the future at `now`.
    pub fn is_delayed_at(&self, now: i64) -> bool {
        self.delay > now
    }

    pub fn priority_text(&self) -> &'static str {
        priority_text(self.priority)
    }
}

/// A job about to be inserted: everything but the store-assigned columns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewJob {
    pub tube: String,
    pub body: String,
    pub delay: i64,
    pub priority: u32,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            tube: DEFAULT_TUBE.to_owned(),
            body: String::new(),
            delay: 0,
            priority: PRIORITY_DEFAULT,
        }
    }
}

pub fn is_urgent(priority: u32) -> bool {
    priority < PRIORITY_MEDIUM
}

/// Human-friendly name of a priority value.
pub fn priority_text(priority: u32) -> &'static str {
    match priority {
        PRIORITY_HIGHEST => "highest",
        PRIORITY_MEDIUM => "medium",
        PRIORITY_LOWEST => "lowest",
        p if p < PRIORITY_MEDIUM => "high",
        _ => "low",
    }
}
