use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::QueueError;
use crate::store::{JobChanges, JobStore};
use crate::types::record::JobRecord;
use crate::types::states::JobState;
use crate::types::stats::JobStats;
use crate::util;

/// Handle on one job, as handed out by `put`/`peek`/`reserve`.
///
/// Caches the job's row. Lifecycle calls write through to the store and then
/// update the cache, so [`state`](Self::state) reflects them without another
/// query. Once [`delete`](Self::delete) succeeds the handle is inert.
pub struct Job<S: JobStore + ?Sized> {
    store: Arc<S>,
    record: JobRecord,
    deleted: bool,
    strict_delete: bool,
}

impl<S: JobStore + ?Sized> fmt::Debug for Job<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Job")
            .field("record", &self.record)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl<S: JobStore + ?Sized> Job<S> {
    pub(crate) fn new(
        store: Arc<S>,
        record: JobRecord,
        strict_delete: bool,
    ) -> Self {
        Self {
            store,
            record,
            deleted: false,
            strict_delete,
        }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    /// The cached row.
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Decodes the payload.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.record.body)?)
    }

    /// Current state, derived from the cached row. Never queries the store.
    pub fn state(&self) -> JobState {
        if self.deleted {
            JobState::Deleted
        } else {
            self.record.state_at(util::now())
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Re-reads the row from the store. Returns `false` if it no longer
    /// exists, leaving the cache as it was.
    pub fn refresh(&mut self) -> Result<bool, QueueError> {
        self.ensure_live("refresh")?;

        match self.store.find_by_id(self.record.id)? {
            Some(record) => {
                self.record = record;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Removes the job. Returns whether the row still existed.
    ///
    /// With `strict_delete` configured, only reserved or buried jobs may be
    /// deleted.
    pub fn delete(&mut self) -> Result<bool, QueueError> {
        if self.strict_delete
            && !matches!(self.state(), JobState::Buried | JobState::Reserved)
        {
            return Err(QueueError::InvalidOperation(format!(
                "job {} is {}: only buried or reserved jobs can be deleted",
                self.record.id,
                self.state()
            )));
        }

        let existed = self.store.delete(self.record.id)?;
        self.deleted = true;
        debug!(id = self.record.id, existed, "deleted job");

        Ok(existed)
    }

    /// Hands a job back to the queue. A `delay` of more than zero seconds
    /// makes it delayed rather than ready; `priority`, if given, replaces the
    /// current one.
    pub fn release(
        &mut self,
        priority: Option<u32>,
        delay: u32,
    ) -> Result<bool, QueueError> {
        self.ensure_live("release")?;

        let delay = if delay > 0 {
            util::now() + i64::from(delay)
        } else {
            0
        };
        self.apply(JobChanges {
            reserved: Some(false),
            delay: Some(delay),
            priority,
            ..Default::default()
        })
    }

    /// Parks the job until it's kicked.
    pub fn bury(&mut self, priority: Option<u32>) -> Result<bool, QueueError> {
        self.ensure_live("bury")?;

        self.apply(JobChanges {
            buried: Some(true),
            reserved: Some(false),
            priority,
            ..Default::default()
        })
    }

    /// Moves a buried or delayed job back to ready. Any other job is left
    /// alone and `true` is returned.
    pub fn kick(&mut self) -> Result<bool, QueueError> {
        self.ensure_live("kick")?;

        let record = &self.record;
        let changes = if record.buried {
            JobChanges {
                buried: Some(false),
                ..Default::default()
            }
        } else if !record.reserved && record.is_delayed_at(util::now()) {
            JobChanges {
                delay: Some(0),
                ..Default::default()
            }
        } else {
            return Ok(true);
        };

        self.apply(changes)
    }

    pub fn stats(&self) -> Result<JobStats, QueueError> {
        if self.deleted {
            return Err(QueueError::InvalidOperation(format!(
                "job {} was deleted: no stats available",
                self.record.id
            )));
        }

        let now = util::now();
        let record = &self.record;

        Ok(JobStats {
            id: record.id,
            age: now - record.created_at,
            state: record.state_at(now),
            tube: record.tube.clone(),
            delay: (record.delay - now).max(0),
            delayed_until: record.delay,
            priority: record.priority,
            priority_text: record.priority_text(),
        })
    }

    fn ensure_live(&self, op: &str) -> Result<(), QueueError> {
        if self.deleted {
            Err(QueueError::InvalidOperation(format!(
                "cannot {op} job {}: it was deleted",
                self.record.id
            )))
        } else {
            Ok(())
        }
    }

    /// Writes `changes` to the store and, if the row was there, to the cache.
    fn apply(&mut self, changes: JobChanges) -> Result<bool, QueueError> {
        let applied = self.store.update(self.record.id, &changes)?;
        if applied {
            changes.apply(&mut self.record);
        }
        debug!(id = self.record.id, ?changes, applied, "updated job");

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{JobFilter, MemoryStore, Order, StateGroup};
    use crate::types::record::{NewJob, PRIORITY_MEDIUM};
    use crate::types::stats::{StatValue, StatsView};

    fn job_with(store: &Arc<MemoryStore>, new: NewJob) -> Job<MemoryStore> {
        let id = store.insert(new).unwrap();
        let record = store.find_by_id(id).unwrap().unwrap();
        Job::new(Arc::clone(store), record, false)
    }

    fn job(store: &Arc<MemoryStore>) -> Job<MemoryStore> {
        job_with(
            store,
            NewJob {
                body: r#"{"to":"a@b.c"}"#.into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn body_decodes() {
        let store = Arc::new(MemoryStore::new());
        let job = job(&store);

        let body: serde_json::Value = job.body().unwrap();
        assert_eq!(body["to"], "a@b.c");

        let wrong: Result<u32, _> = job.body();
        assert!(matches!(wrong, Err(QueueError::Serialization(_))));
    }

    #[test]
    fn bury_then_kick() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job(&store);

        assert!(job.bury(Some(7)).unwrap());
        assert_eq!(job.state(), JobState::Buried);
        assert_eq!(job.record().priority, 7);
        assert!(store.find_by_id(job.id()).unwrap().unwrap().buried);

        assert!(job.kick().unwrap());
        // Priority 7 is urgent.
        assert_eq!(job.state(), JobState::Urgent);
        assert!(!store.find_by_id(job.id()).unwrap().unwrap().buried);
    }

    #[test]
    fn kick_delayed() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job_with(
            &store,
            NewJob {
                body: "1".into(),
                delay: util::now() + 100,
                ..Default::default()
            },
        );
        assert_eq!(job.state(), JobState::Delayed);

        assert!(job.kick().unwrap());
        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(store.find_by_id(job.id()).unwrap().unwrap().delay, 0);
    }

    #[test]
    fn kick_is_noop_for_ready_job() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job(&store);
        let before = store.find_by_id(job.id()).unwrap();

        assert!(job.kick().unwrap());
        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(store.find_by_id(job.id()).unwrap(), before);
    }

    #[test]
    fn release_with_delay() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job(&store);
        store
            .update(
                job.id(),
                &JobChanges {
                    reserved: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(job.refresh().unwrap());
        assert_eq!(job.state(), JobState::Reserved);

        assert!(job.release(None, 30).unwrap());
        assert_eq!(job.state(), JobState::Delayed);
        assert_eq!(job.record().priority, PRIORITY_MEDIUM);
        let stats = job.stats().unwrap();
        assert!((29..=30).contains(&stats.delay()));

        assert!(job.release(Some(PRIORITY_MEDIUM + 5), 0).unwrap());
        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(job.record().delay, 0);
        assert_eq!(job.record().priority, PRIORITY_MEDIUM + 5);
    }

    #[test]
    fn stats_fields() {
        let store = Arc::new(MemoryStore::new());
        let job = job_with(
            &store,
            NewJob {
                tube: "mail".into(),
                body: "1".into(),
                priority: 0,
                ..Default::default()
            },
        );

        let stats = job.stats().unwrap();
        assert_eq!(stats.id(), job.id());
        assert_eq!(stats.tube(), "mail");
        assert_eq!(stats.delay(), 0);
        assert_eq!(stats.delayed_until(), 0);
        assert!(stats.age() >= 0);
        assert_eq!(stats.state(), JobState::Urgent);
        assert_eq!(
            stats.get("priority_text"),
            Some(StatValue::Text("highest"))
        );
    }

    #[test]
    fn deleted_job_is_inert() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job(&store);

        assert!(job.delete().unwrap());
        assert_eq!(job.state(), JobState::Deleted);
        assert!(store.is_empty());
        assert!(matches!(
            job.stats(),
            Err(QueueError::InvalidOperation(_))
        ));
        assert!(matches!(
            job.release(None, 0),
            Err(QueueError::InvalidOperation(_))
        ));
        assert!(matches!(job.refresh(), Err(QueueError::InvalidOperation(_))));
    }

    #[test]
    fn strict_delete() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert(NewJob::default()).unwrap();
        let record = store.find_by_id(id).unwrap().unwrap();
        let mut job = Job::new(Arc::clone(&store), record, true);

        assert!(matches!(job.delete(), Err(QueueError::InvalidOperation(_))));
        assert_eq!(job.state(), JobState::Ready);

        job.bury(None).unwrap();
        assert!(job.delete().unwrap());
        assert_eq!(job.state(), JobState::Deleted);
    }

    #[test]
    fn vanished_row() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job(&store);
        store.delete(job.id()).unwrap();

        assert!(!job.refresh().unwrap());
        assert!(!job.bury(None).unwrap());
        // The cache is left as it was.
        assert_eq!(job.state(), JobState::Ready);
    }

    /// A store that can't delete rows, e.g. while the database is locked.
    #[derive(Default)]
    struct LockedStore(MemoryStore);

    impl JobStore for LockedStore {
        fn insert(&self, job: NewJob) -> Result<u64, StoreError> {
            self.0.insert(job)
        }

        fn find_by_id(&self, id: u64) -> Result<Option<JobRecord>, StoreError> {
            self.0.find_by_id(id)
        }

        fn find_many(
            &self,
            filter: &JobFilter,
            order: Order,
            limit: usize,
        ) -> Result<Vec<JobRecord>, StoreError> {
            self.0.find_many(filter, order, limit)
        }

        fn conditional_update(
            &self,
            id: u64,
            expected: &JobFilter,
            changes: &JobChanges,
        ) -> Result<bool, StoreError> {
            self.0.conditional_update(id, expected, changes)
        }

        fn update_many(
            &self,
            ids: &[u64],
            expected: &JobFilter,
            changes: &JobChanges,
        ) -> Result<usize, StoreError> {
            self.0.update_many(ids, expected, changes)
        }

        fn delete(&self, _id: u64) -> Result<bool, StoreError> {
            Err(StoreError::Backend("database is locked".into()))
        }

        fn aggregate(
            &self,
            tube: Option<&str>,
            now: i64,
        ) -> Result<Vec<StateGroup>, StoreError> {
            self.0.aggregate(tube, now)
        }

        fn distinct_tubes(&self) -> Result<Vec<String>, StoreError> {
            self.0.distinct_tubes()
        }
    }

    #[test]
    fn failed_delete_keeps_job_live() {
        let store = Arc::new(LockedStore::default());
        let id = store.insert(NewJob::default()).unwrap();
        store
            .update(
                id,
                &JobChanges {
                    reserved: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        let record = store.find_by_id(id).unwrap().unwrap();
        let mut job = Job::new(Arc::clone(&store), record, false);

        assert!(matches!(
            job.delete(),
            Err(QueueError::Store(StoreError::Backend(_)))
        ));
        assert!(!job.is_deleted());
        assert_eq!(job.state(), JobState::Reserved);
        assert_eq!(job.stats().unwrap().id(), id);

        // The job can still be handed back.
        assert!(job.release(None, 0).unwrap());
        assert_eq!(job.state(), JobState::Ready);
        assert!(!store.find_by_id(id).unwrap().unwrap().reserved);
    }
}
