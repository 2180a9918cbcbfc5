use std::fmt;

use serde::Serialize;

/// Lifecycle state of a job.
///
/// Only the first five are derived from a stored row. `Deleted` exists only on
/// a [`Job`](crate::Job) handle whose row has been removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
    Urgent,
    Deleted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed => "delayed",
            Reserved => "reserved",
            Buried => "buried",
            Urgent => "urgent",
            Deleted => "deleted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
