//! The queue engine: tube selection, putting, peeking, reserving, kicking and
//! stats, all expressed as queries against a [`JobStore`].
mod process;
mod wait;


pub use process::{IntoVerdict, ProcessOptions, ProcessStats, Verdict};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};
use crate::job::Job;
use crate::store::{DelayBound, JobChanges, JobFilter, JobStore, Order};
use crate::types::record::{JobRecord, NewJob, PRIORITY_DEFAULT};
use crate::types::stats::{QueueStats, TubeStats};
use crate::util;

/// Name of the synthetic tube summing every other tube in [`QueueStats`].
pub const ALL_TUBES: &str = "all";

/// Options for [`Queue::put`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct PutOptions {
    /// Seconds to wait before the job can be reserved.
    pub delay: u32,
    /// Defaults to `PRIORITY_MEDIUM`.
    pub priority: Option<u32>,
}

/// The per-consumer part of a queue, which can be saved and later handed to
/// [`Queue::revive`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub using: String,
    pub watching: Vec<String>,
}

/// A client of the jobs table.
///
/// Jobs are put onto the tube being used and reserved from the tubes being
/// watched. The watch list is never empty. Any number of queues, in any number
/// of processes, may share one store.
pub struct Queue<S: JobStore + ?Sized> {
    store: Arc<S>,
    config: QueueConfig,
    using: String,
    watching: Vec<String>,
}

impl<S: JobStore + ?Sized> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            using: self.using.clone(),
            watching: self.watching.clone(),
        }
    }
}

impl<S: JobStore + ?Sized> fmt::Debug for Queue<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("using", &self.using)
            .field("watching", &self.watching)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: JobStore + ?Sized> Queue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: QueueConfig) -> Self {
        Self {
            store,
            using: config.default_tube.clone(),
            watching: vec![config.default_tube.clone()],
            config,
        }
    }

    /// Rebuilds a queue from a saved [`QueueState`] on top of `store`.
    pub fn revive(
        store: Arc<S>,
        config: QueueConfig,
        state: QueueState,
    ) -> Self {
        let mut queue = Self::with_config(store, config);
        queue.using = state.using;
        queue.watching = vec![queue.using.clone()];
        queue.watch(state.watching, true);
        queue
    }

    pub fn state(&self) -> QueueState {
        QueueState {
            using: self.using.clone(),
            watching: self.watching.clone(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Puts a job on the tube being used, returning its id.
    pub fn put<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: PutOptions,
    ) -> Result<u64, QueueError> {
        let body = serde_json::to_string(payload)?;
        let delay = if options.delay > 0 {
            util::now() + i64::from(options.delay)
        } else {
            0
        };

        let preview = util::preview(&body);
        let id = self
            .store
            .insert(NewJob {
                tube: self.using.clone(),
                body,
                delay,
                priority: options.priority.unwrap_or(PRIORITY_DEFAULT),
            })
            .map_err(|e| match e {
                StoreError::Validation(msg) => QueueError::Validation(msg),
                other => QueueError::Store(other),
            })?;

        debug!(id, tube = %self.using, body = preview, "put job");
        Ok(id)
    }

    /// Changes the tube new jobs are put on.
    pub fn choose(&mut self, tube: impl Into<String>) -> &mut Self {
        self.using = tube.into();
        self
    }

    /// Adds tubes to the watch list, or replaces it if `replace` is set.
    /// Duplicates are dropped, keeping first-seen order. Replacing with an
    /// empty list is ignored.
    pub fn watch<I, T>(&mut self, tubes: I, replace: bool) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tubes = tubes.into_iter().map(Into::into);
        let watching: Vec<String> = if replace {
            tubes.unique().collect()
        } else {
            self.watching.drain(..).chain(tubes).unique().collect()
        };

        if !watching.is_empty() {
            self.watching = watching;
        }
        self
    }

    /// Stops watching `tube`, unless it's the only one left. Returns the
    /// resulting watch list.
    pub fn ignore(&mut self, tube: &str) -> &[String] {
        if self.watching.len() > 1 {
            self.watching.retain(|t| t != tube);
        }
        &self.watching
    }

    /// The tube new jobs are put on.
    pub fn using(&self) -> &str {
        &self.using
    }

    /// Alias of [`using`](Self::using).
    pub fn chosen(&self) -> &str {
        self.using()
    }

    pub fn watching(&self) -> &[String] {
        &self.watching
    }

    /// Looks up any job by id, whatever its tube or state.
    pub fn peek(&self, id: u64) -> Result<Option<Job<S>>, QueueError> {
        Ok(self.store.find_by_id(id)?.map(|r| self.job(r)))
    }

    /// The job the next `reserve` would return.
    pub fn peek_ready(&self) -> Result<Option<Job<S>>, QueueError> {
        self.peek_where(self.ready_filter(util::now()), Order::PriorityThenAge)
    }

    /// The next delayed job in a watched tube.
    pub fn peek_delayed(&self) -> Result<Option<Job<S>>, QueueError> {
        let filter = JobFilter {
            tubes: Some(self.watching.clone()),
            reserved: Some(false),
            delay: Some(DelayBound::Pending(util::now())),
            ..Default::default()
        };
        self.peek_where(filter, Order::PriorityThenAge)
    }

    /// The most recently buried job. Buried jobs form one pool across all
    /// tubes.
    pub fn peek_buried(&self) -> Result<Option<Job<S>>, QueueError> {
        self.peek_where(Self::buried_filter(), Order::Newest)
    }

    /// Reserves a ready job if there is one, without waiting.
    ///
    /// The claim is a conditional update, so a job is only ever handed to one
    /// consumer; losing a race just moves on to the next candidate.
    pub fn try_reserve(&self) -> Result<Option<Job<S>>, QueueError> {
        let claim = JobChanges {
            reserved: Some(true),
            ..Default::default()
        };

        loop {
            let ready = self.ready_filter(util::now());
            let Some(mut record) =
                self.store.find_one(&ready, Order::PriorityThenAge)?
            else {
                return Ok(None);
            };

            if self.store.conditional_update(record.id, &ready, &claim)? {
                claim.apply(&mut record);
                debug!(id = record.id, tube = %record.tube, "reserved job");
                return Ok(Some(self.job(record)));
            }

            trace!(id = record.id, "job claimed elsewhere, retrying");
        }
    }

    /// Reserves a job, polling at the configured interval until `timeout`
    /// passes. `Some(Duration::ZERO)` tries exactly once; `None` waits
    /// forever.
    pub async fn reserve(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Job<S>>, QueueError> {
        self.reserve_with(timeout, self.config.poll_interval(), None)
            .await
    }

    /// As [`reserve`](Self::reserve), with an explicit poll interval and an
    /// optional cancellation token. Cancellation ends the wait with `Ok(None)`.
    #[instrument(skip(self, cancel), fields(watching = ?self.watching))]
    pub async fn reserve_with(
        &self,
        timeout: Option<Duration>,
        poll_interval: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Job<S>>, QueueError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if let Some(job) = self.try_reserve()? {
                return Ok(Some(job));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let left =
                        deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        trace!("timed out");
                        return Ok(None);
                    }
                    left.min(poll_interval)
                },
                None => poll_interval,
            };

            trace!(?pause, "no job ready");
            if !wait::poll_wait(pause, cancel).await {
                debug!("reserve cancelled");
                return Ok(None);
            }
        }
    }

    /// Kicks up to `count` buried jobs back to ready, most recently buried
    /// first. Returns how many were kicked.
    pub fn kick(&self, count: usize) -> Result<usize, QueueError> {
        let buried = self.store.find_many(
            &Self::buried_filter(),
            Order::Newest,
            count,
        )?;
        let ids: Vec<u64> = buried.iter().map(|r| r.id).collect();

        let kicked = self.store.update_many(
            &ids,
            &Self::buried_filter(),
            &JobChanges {
                buried: Some(false),
                ..Default::default()
            },
        )?;

        debug!(requested = count, kicked, "kicked buried jobs");
        Ok(kicked)
    }

    /// Counts jobs per state for every tube, or for `filter_tube` only.
    ///
    /// The tube in use always has an entry, even with no jobs. Unfiltered
    /// stats also carry totals across all tubes.
    pub fn stats(
        &self,
        filter_tube: Option<&str>,
    ) -> Result<QueueStats, QueueError> {
        let groups = self.store.aggregate(filter_tube, util::now())?;

        let mut stats = QueueStats::default();
        match filter_tube {
            Some(tube) if tube == self.using => {
                stats
                    .tubes
                    .insert(self.using.clone(), TubeStats::empty(&self.using));
            },
            Some(_) => {},
            None => {
                stats.all = Some(TubeStats::empty(ALL_TUBES));
                stats
                    .tubes
                    .insert(self.using.clone(), TubeStats::empty(&self.using));
            },
        }

        for group in groups {
            let state = group.state();
            if let Some(all) = stats.all.as_mut() {
                all.add(state, group.total);
            }
            stats
                .tubes
                .entry(group.tube)
                .or_insert_with_key(|name| TubeStats::empty(name.as_str()))
                .add(state, group.total);
        }

        Ok(stats)
    }

    /// Stats of one tube, defaulting to the tube in use.
    pub fn stats_tube(
        &self,
        tube: Option<&str>,
    ) -> Result<TubeStats, QueueError> {
        let tube = tube.unwrap_or(&self.using);
        let mut stats = self.stats(Some(tube))?;

        Ok(stats
            .tubes
            .remove(tube)
            .unwrap_or_else(|| TubeStats::empty(tube)))
    }

    /// Names of all tubes holding jobs, sorted.
    pub fn list_tubes(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.store.distinct_tubes()?)
    }

    fn job(&self, record: JobRecord) -> Job<S> {
        Job::new(Arc::clone(&self.store), record, self.config.strict_delete)
    }

    fn peek_where(
        &self,
        filter: JobFilter,
        order: Order,
    ) -> Result<Option<Job<S>>, QueueError> {
        Ok(self.store.find_one(&filter, order)?.map(|r| self.job(r)))
    }

    /// Jobs in watched tubes that can be reserved at `now`.
    fn ready_filter(&self, now: i64) -> JobFilter {
        JobFilter {
            tubes: Some(self.watching.clone()),
            reserved: Some(false),
            buried: Some(false),
            delay: Some(DelayBound::Due(now)),
        }
    }

    fn buried_filter() -> JobFilter {
        JobFilter {
            buried: Some(true),
            ..Default::default()
        }
    }
}
