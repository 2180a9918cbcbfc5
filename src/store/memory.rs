use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;

use super::{
    validate_tube, JobChanges, JobFilter, JobStore, Order, StateGroup,
};
use crate::error::StoreError;
use crate::types::record::{is_urgent, JobRecord, NewJob};
use crate::util;

/// Keeps the jobs table in process memory.
///
/// Every operation runs under one lock, which is what makes conditional
/// updates atomic across threads sharing the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Last id handed out.
    last_id: u64,
    rows: BTreeMap<u64, JobRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for MemoryStore {
    fn insert(&self, job: NewJob) -> Result<u64, StoreError> {
        validate_tube(&job.tube)?;

        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = inner.last_id;
        inner.rows.insert(
            id,
            JobRecord {
                id,
                tube: job.tube,
                body: job.body,
                created_at: util::now(),
                delay: job.delay,
                priority: job.priority,
                reserved: false,
                buried: false,
            },
        );

        Ok(id)
    }

    fn find_by_id(&self, id: u64) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().rows.get(&id).cloned())
    }

    fn find_many(
        &self,
        filter: &JobFilter,
        order: Order,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut found: Vec<&JobRecord> =
            inner.rows.values().filter(|r| filter.matches(r)).collect();

        match order {
            Order::PriorityThenAge => found.sort_by_key(|r| (r.priority, r.id)),
            Order::Newest => found.sort_by(|a, b| b.id.cmp(&a.id)),
        }

        Ok(found.into_iter().take(limit).cloned().collect())
    }

    fn conditional_update(
        &self,
        id: u64,
        expected: &JobFilter,
        changes: &JobChanges,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.rows.get_mut(&id) {
            Some(record) if expected.matches(record) => {
                changes.apply(record);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    fn update_many(
        &self,
        ids: &[u64],
        expected: &JobFilter,
        changes: &JobChanges,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for id in ids.iter().collect::<BTreeSet<_>>() {
            if let Some(record) = inner.rows.get_mut(id) {
                if expected.matches(record) {
                    changes.apply(record);
                    changed += 1;
                }
            }
        }

        Ok(changed)
    }

    fn delete(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().rows.remove(&id).is_some())
    }

    fn aggregate(
        &self,
        tube: Option<&str>,
        now: i64,
    ) -> Result<Vec<StateGroup>, StoreError> {
        let inner = self.inner.lock();
        let mut groups: HashMap<(&str, bool, bool, bool, bool), u64> =
            HashMap::new();

        for r in inner.rows.values() {
            if tube.is_some_and(|t| t != r.tube) {
                continue;
            }
            let key = (
                r.tube.as_str(),
                r.buried,
                r.reserved,
                is_urgent(r.priority),
                r.is_delayed_at(now),
            );
            *groups.entry(key).or_default() += 1;
        }

        let mut groups: Vec<StateGroup> = groups
            .into_iter()
            .map(|((tube, buried, reserved, urgent, delayed), total)| {
                StateGroup {
                    tube: tube.to_owned(),
                    buried,
                    reserved,
                    urgent,
                    delayed,
                    total,
                }
            })
            .collect();
        groups.sort_by(|a, b| a.tube.cmp(&b.tube));

        Ok(groups)
    }

    fn distinct_tubes(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        let tubes: BTreeSet<&str> =
            inner.rows.values().map(|r| r.tube.as_str()).collect();

        Ok(tubes.into_iter().map(str::to_owned).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DelayBound;
    use crate::types::record::PRIORITY_MEDIUM;

    fn put(store: &MemoryStore, tube: &str, priority: u32) -> u64 {
        store
            .insert(NewJob {
                tube: tube.into(),
                body: "\"x\"".into(),
                priority,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn ids_are_monotonic() {
        let store = MemoryStore::new();
        let a = put(&store, "default", PRIORITY_MEDIUM);
        let b = put(&store, "default", PRIORITY_MEDIUM);
        assert!(b > a);

        store.delete(b).unwrap();
        let c = put(&store, "default", PRIORITY_MEDIUM);
        assert!(c > b, "ids are never reused");
    }

    #[test]
    fn rejects_bad_tube() {
        let store = MemoryStore::new();
        let res = store.insert(NewJob {
            tube: "-bad".into(),
            ..Default::default()
        });
        assert!(matches!(res, Err(StoreError::Validation(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn ordering() {
        let store = MemoryStore::new();
        let low = put(&store, "default", PRIORITY_MEDIUM + 1);
        let first = put(&store, "default", 3);
        let second = put(&store, "default", 3);

        let by_priority = store
            .find_many(&JobFilter::default(), Order::PriorityThenAge, 10)
            .unwrap();
        let ids: Vec<u64> = by_priority.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second, low]);

        let newest = store
            .find_one(&JobFilter::default(), Order::Newest)
            .unwrap()
            .unwrap();
        assert_eq!(newest.id, second);
    }

    #[test]
    fn conditional_update_claims_once() {
        let store = MemoryStore::new();
        let id = put(&store, "default", PRIORITY_MEDIUM);

        let unreserved = JobFilter {
            reserved: Some(false),
            ..Default::default()
        };
        let claim = JobChanges {
            reserved: Some(true),
            ..Default::default()
        };

        assert!(store.conditional_update(id, &unreserved, &claim).unwrap());
        assert!(!store.conditional_update(id, &unreserved, &claim).unwrap());
        assert!(!store.conditional_update(999, &unreserved, &claim).unwrap());
    }

    #[test]
    fn aggregate_groups_by_flags() {
        let store = MemoryStore::new();
        put(&store, "a", PRIORITY_MEDIUM);
        put(&store, "a", PRIORITY_MEDIUM);
        put(&store, "a", 1);
        let delayed = store
            .insert(NewJob {
                tube: "b".into(),
                delay: util::now() + 100,
                ..Default::default()
            })
            .unwrap();

        let groups = store.aggregate(None, util::now()).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.iter().map(|g| g.total).sum::<u64>(), 4);
        assert!(groups
            .iter()
            .any(|g| g.tube == "a" && !g.urgent && g.total == 2));
        assert!(groups.iter().any(|g| g.tube == "b" && g.delayed));

        let only_b = store.aggregate(Some("b"), util::now()).unwrap();
        assert_eq!(only_b.len(), 1);

        let pending = store
            .find_many(
                &JobFilter {
                    delay: Some(DelayBound::Pending(util::now())),
                    ..Default::default()
                },
                Order::PriorityThenAge,
                10,
            )
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, delayed);

        assert_eq!(store.distinct_tubes().unwrap(), vec!["a", "b"]);
    }
}
