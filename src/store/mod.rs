//! The storage boundary of the queue: anything that can hold rows of the
//! jobs table and answer the handful of queries the engine needs.
mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::record::{JobRecord, NewJob};
use crate::types::states::JobState;

/// Longest tube name accepted, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Row predicate. Every `Some` field must hold for a row to match.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobFilter {
    /// Restricts to rows in any of these tubes.
    pub tubes: Option<Vec<String>>,
    pub reserved: Option<bool>,
    pub buried: Option<bool>,
    pub delay: Option<DelayBound>,
}

/// Comparison of a row's `delay` against a point in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DelayBound {
    /// `delay <= t`: eligible for reservation at `t`.
    Due(i64),
    /// `delay > t`: still waiting at `t`.
    Pending(i64),
}

impl JobFilter {
    /// Whether a row satisfies the filter.
    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(tubes) = &self.tubes {
            if !tubes.iter().any(|t| *t == record.tube) {
                return false;
            }
        }
        if self.reserved.is_some_and(|r| r != record.reserved) {
            return false;
        }
        if self.buried.is_some_and(|b| b != record.buried) {
            return false;
        }
        match self.delay {
            Some(DelayBound::Due(t)) => record.delay <= t,
            Some(DelayBound::Pending(t)) => record.delay > t,
            None => true,
        }
    }
}

/// Ordering of query results.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Order {
    /// `priority ASC, id ASC`: most urgent first, oldest first among equals.
    PriorityThenAge,
    /// `id DESC`: most recently inserted first.
    Newest,
}

/// Columns to overwrite in an update. `None` leaves a column untouched.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobChanges {
    pub reserved: Option<bool>,
    pub buried: Option<bool>,
    pub delay: Option<i64>,
    pub priority: Option<u32>,
}

impl JobChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the changes to an in-memory copy of a row.
    pub fn apply(&self, record: &mut JobRecord) {
        if let Some(reserved) = self.reserved {
            record.reserved = reserved;
        }
        if let Some(buried) = self.buried {
            record.buried = buried;
        }
        if let Some(delay) = self.delay {
            record.delay = delay;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
    }
}

/// Count of jobs in one tube sharing the same combination of state flags.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateGroup {
    pub tube: String,
    pub buried: bool,
    pub reserved: bool,
    /// `priority < PRIORITY_MEDIUM`
    pub urgent: bool,
    /// `delay > now`
    pub delayed: bool,
    pub total: u64,
}

impl StateGroup {
    /// The state every job in the group is counted under, by the same
    /// precedence as [`JobRecord::state_at`].
    pub fn state(&self) -> JobState {
        if self.buried {
            JobState::Buried
        } else if self.reserved {
            JobState::Reserved
        } else if self.urgent {
            JobState::Urgent
        } else if self.delayed {
            JobState::Delayed
        } else {
            JobState::Ready
        }
    }
}

/// Durable row storage backing a queue.
///
/// Implementations must make [`conditional_update`](Self::conditional_update)
/// and [`update_many`](Self::update_many) atomic: the expectation is checked
/// and the change applied as one step, so concurrent consumers can't both
/// claim the same row.
pub trait JobStore: Send + Sync {
    /// Stores a new row, returning its assigned id. `created_at` is stamped
    /// here.
    fn insert(&self, job: NewJob) -> Result<u64, StoreError>;

    fn find_by_id(&self, id: u64) -> Result<Option<JobRecord>, StoreError>;

    /// First row matching `filter` under `order`.
    fn find_one(
        &self,
        filter: &JobFilter,
        order: Order,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.find_many(filter, order, 1)?.into_iter().next())
    }

    fn find_many(
        &self,
        filter: &JobFilter,
        order: Order,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Applies `changes` to row `id` only if it still matches `expected`.
    /// Returns whether a row was changed.
    fn conditional_update(
        &self,
        id: u64,
        expected: &JobFilter,
        changes: &JobChanges,
    ) -> Result<bool, StoreError>;

    /// Applies `changes` to row `id`. Returns whether the row exists.
    fn update(
        &self,
        id: u64,
        changes: &JobChanges,
    ) -> Result<bool, StoreError> {
        self.conditional_update(id, &JobFilter::default(), changes)
    }

    /// Applies `changes` to every listed row still matching `expected`.
    /// Returns how many rows were changed.
    fn update_many(
        &self,
        ids: &[u64],
        expected: &JobFilter,
        changes: &JobChanges,
    ) -> Result<usize, StoreError>;

    /// Removes row `id`. Returns whether it existed.
    fn delete(&self, id: u64) -> Result<bool, StoreError>;

    /// Counts rows grouped by tube and state flags, optionally for one tube.
    fn aggregate(
        &self,
        tube: Option<&str>,
        now: i64,
    ) -> Result<Vec<StateGroup>, StoreError>;

    /// Names of all tubes holding at least one row, sorted ascending.
    fn distinct_tubes(&self) -> Result<Vec<String>, StoreError>;

    /// Commits a transaction left open on the store, if any.
    fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Checks a tube name the way beanstalkd does: 1 to 200 bytes of letters,
/// digits and `+/;.$_()-`, not starting with `-`.
pub fn validate_tube(name: &str) -> Result<(), StoreError> {
    fn char_is_name_safe(c: u8, is_first: bool) -> bool {
        match c {
            b'a'..=b'z' => true,
            b'A'..=b'Z' => true,
            b'0'..=b'9' => true,
            b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
            b'-' => !is_first, // - is only name safe outside first position
            _ => false,
        }
    }

    if name.is_empty() || name.len() > MAX_TUBE_NAME_LEN {
        return Err(StoreError::Validation(format!(
            "tube name must be 1 to {MAX_TUBE_NAME_LEN} bytes long"
        )));
    }

    if name
        .bytes()
        .enumerate()
        .all(|(i, c)| char_is_name_safe(c, i == 0))
    {
        Ok(())
    } else {
        Err(StoreError::Validation(format!("invalid tube name {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tube_names() {
        let name_200_bytes: String = (0..200).map(|_| 'a').collect();
        let name_201_bytes: String = (0..201).map(|_| 'a').collect();

        assert!(validate_tube("default").is_ok());
        assert!(validate_tube("tube_name_here-098+/;.()-").is_ok());
        assert!(validate_tube(&name_200_bytes).is_ok());

        let too_long = name_201_bytes.as_str();
        for bad in ["", "-foo", "-", "foo bar", "foo#bar", too_long] {
            assert!(
                matches!(validate_tube(bad), Err(StoreError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn filter_matching() {
        let record = JobRecord {
            id: 1,
            tube: "a".into(),
            body: "1".into(),
            created_at: 0,
            delay: 50,
            priority: 10,
            reserved: false,
            buried: false,
        };

        assert!(JobFilter::default().matches(&record));
        assert!(JobFilter {
            tubes: Some(vec!["b".into(), "a".into()]),
            reserved: Some(false),
            delay: Some(DelayBound::Due(50)),
            ..Default::default()
        }
        .matches(&record));
        assert!(!JobFilter {
            delay: Some(DelayBound::Pending(50)),
            ..Default::default()
        }
        .matches(&record));
        assert!(!JobFilter {
            tubes: Some(vec!["b".into()]),
            ..Default::default()
        }
        .matches(&record));
        assert!(!JobFilter {
            buried: Some(true),
            ..Default::default()
        }
        .matches(&record));
    }
}
