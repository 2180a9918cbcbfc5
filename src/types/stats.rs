use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use heck::ToLowerCamelCase;
use serde::Serialize;

use super::states::JobState;
use crate::error::QueueError;

/// A single value read out of a stats view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatValue<'a> {
    Int(i64),
    UInt(u64),
    Text(&'a str),
}

impl fmt::Display for StatValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Converts a field name to the camelCase form the views are keyed by, so
/// `delayed_until`, `delayed-until` and `delayedUntil` all name one field.
pub fn normalize_key(key: &str) -> Cow<'_, str> {
    if key.contains(['_', '-']) {
        Cow::Owned(key.to_lower_camel_case())
    } else {
        Cow::Borrowed(key)
    }
}

/// Read-only, key-addressable access to a stats snapshot.
///
/// Snapshots are immutable once built: every mutating operation fails with
/// [`QueueError::Unsupported`].
pub trait StatsView {
    /// Looks up a field by its already-normalised (camelCase) name.
    fn field(&self, key: &str) -> Option<StatValue<'_>>;

    /// Looks up a field by any accepted spelling of its name.
    fn get(&self, key: &str) -> Option<StatValue<'_>> {
        self.field(&normalize_key(key))
    }

    fn set(
        &mut self,
        _key: &str,
        _value: StatValue<'_>,
    ) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("stats are read-only"))
    }

    fn unset(&mut self, _key: &str) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("stats are read-only"))
    }

    fn append(&mut self, _value: StatValue<'_>) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("stats are read-only"))
    }

    fn replace(&mut self, _with: Self) -> Result<(), QueueError>
    where
        Self: Sized,
    {
        Err(QueueError::Unsupported("stats are read-only"))
    }
}

/// Snapshot of a single job, as returned by `Job::stats`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    /// job id
    pub(crate) id: u64,
    /// seconds since the job was created
    pub(crate) age: i64,
    pub(crate) state: JobState,
    /// tube the job was put on
    pub(crate) tube: String,
    /// seconds left until the job becomes ready
    pub(crate) delay: i64,
    /// epoch timestamp the job becomes ready at, or 0
    pub(crate) delayed_until: i64,
    pub(crate) priority: u32,
    pub(crate) priority_text: &'static str,
}

impl JobStats {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> i64 {
        self.age
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    pub fn delay(&self) -> i64 {
        self.delay
    }

    pub fn delayed_until(&self) -> i64 {
        self.delayed_until
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn priority_text(&self) -> &'static str {
        self.priority_text
    }
}

impl StatsView for JobStats {
    fn field(&self, key: &str) -> Option<StatValue<'_>> {
        use StatValue::*;

        Some(match key {
            "id" => UInt(self.id),
            "age" => Int(self.age),
            "state" => Text(self.state.as_str()),
            "tube" => Text(&self.tube),
            "delay" => Int(self.delay),
            "delayedUntil" => Int(self.delayed_until),
            "priority" => UInt(self.priority.into()),
            "priorityText" => Text(self.priority_text),
            _ => return None,
        })
    }
}

/// Number of jobs per state in one tube (or across all tubes).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TubeStats {
    /// tube name, or "all" for the aggregate
    pub name: String,
    pub buried: u64,
    pub delayed: u64,
    pub ready: u64,
    pub reserved: u64,
    pub urgent: u64,
    pub total: u64,
}

impl TubeStats {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Counts `count` more jobs in `state`.
    pub(crate) fn add(&mut self, state: JobState, count: u64) {
        let counter = match state {
            JobState::Buried => &mut self.buried,
            JobState::Delayed => &mut self.delayed,
            JobState::Reserved => &mut self.reserved,
            JobState::Urgent => &mut self.urgent,
            JobState::Ready | JobState::Deleted => &mut self.ready,
        };
        *counter += count;
        self.total += count;
    }
}

impl StatsView for TubeStats {
    fn field(&self, key: &str) -> Option<StatValue<'_>> {
        use StatValue::*;

        Some(match key {
            "name" => Text(&self.name),
            "buried" => UInt(self.buried),
            "delayed" => UInt(self.delayed),
            "ready" => UInt(self.ready),
            "reserved" => UInt(self.reserved),
            "urgent" => UInt(self.urgent),
            "total" => UInt(self.total),
            _ => return None,
        })
    }
}

/// Job counts per tube, as returned by `Queue::stats`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueStats {
    /// Totals across every tube. Only present for unfiltered stats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<TubeStats>,
    pub tubes: BTreeMap<String, TubeStats>,
}

impl QueueStats {
    pub fn tube(&self, name: &str) -> Option<&TubeStats> {
        self.tubes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobStats {
        JobStats {
            id: 7,
            age: 3,
            state: JobState::Delayed,
            tube: "mail".into(),
            delay: 5,
            delayed_until: 1_700_000_005,
            priority: 1 << 31,
            priority_text: "medium",
        }
    }

    #[test]
    fn key_spellings() {
        assert_eq!(normalize_key("delayed_until"), "delayedUntil");
        assert_eq!(normalize_key("priority-text"), "priorityText");
        assert_eq!(normalize_key("delayedUntil"), "delayedUntil");
        assert_eq!(normalize_key("tube"), "tube");

        let stats = sample();
        for key in ["delayed_until", "delayedUntil", "delayed-until"] {
            assert_eq!(stats.get(key), Some(StatValue::Int(1_700_000_005)));
        }
        assert_eq!(stats.get("priority_text"), Some(StatValue::Text("medium")));
        assert_eq!(stats.get("state"), Some(StatValue::Text("delayed")));
        assert_eq!(stats.get("nope"), None);
    }

    #[test]
    fn mutation_is_refused() {
        let mut stats = sample();

        assert!(matches!(
            stats.set("tube", StatValue::Text("other")),
            Err(QueueError::Unsupported(_))
        ));
        assert!(matches!(stats.unset("id"), Err(QueueError::Unsupported(_))));
        assert!(matches!(
            stats.append(StatValue::Int(1)),
            Err(QueueError::Unsupported(_))
        ));
        assert!(matches!(
            stats.replace(sample()),
            Err(QueueError::Unsupported(_))
        ));
        assert_eq!(stats, sample());
    }

    #[test]
    fn tube_counters() {
        let mut stats = TubeStats::empty("default");
        stats.add(JobState::Ready, 3);
        stats.add(JobState::Buried, 1);
        stats.add(JobState::Urgent, 2);

        assert_eq!(stats.get("ready"), Some(StatValue::UInt(3)));
        assert_eq!(stats.get("buried"), Some(StatValue::UInt(1)));
        assert_eq!(stats.get("urgent"), Some(StatValue::UInt(2)));
        assert_eq!(stats.get("total"), Some(StatValue::UInt(6)));
        assert_eq!(stats.get("name"), Some(StatValue::Text("default")));
    }
}
