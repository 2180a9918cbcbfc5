use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Queue;
use crate::error::QueueError;
use crate::job::Job;
use crate::store::JobStore;

/// What [`Queue::process`] does with a job once the worker returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Done: delete the job.
    Delete,
    /// Not handled: put it straight back.
    Release,
    /// Put it back, ready again after this many seconds.
    Delay(u32),
    /// Failed: bury it.
    Bury,
}

/// Worker return values that [`Queue::process`] understands.
pub trait IntoVerdict {
    fn into_verdict(self) -> Verdict;
}

impl IntoVerdict for Verdict {
    fn into_verdict(self) -> Verdict {
        self
    }
}

/// `true` deletes, `false` buries.
impl IntoVerdict for bool {
    fn into_verdict(self) -> Verdict {
        if self {
            Verdict::Delete
        } else {
            Verdict::Bury
        }
    }
}

/// Returning nothing releases the job.
impl IntoVerdict for () {
    fn into_verdict(self) -> Verdict {
        Verdict::Release
    }
}

/// A number of seconds releases the job with that delay.
impl IntoVerdict for u32 {
    fn into_verdict(self) -> Verdict {
        Verdict::Delay(self)
    }
}

impl IntoVerdict for Option<bool> {
    fn into_verdict(self) -> Verdict {
        match self {
            Some(done) => done.into_verdict(),
            None => Verdict::Release,
        }
    }
}

/// A worker error buries the job.
impl<R: IntoVerdict, E: fmt::Display> IntoVerdict for Result<R, E> {
    fn into_verdict(self) -> Verdict {
        match self {
            Ok(r) => r.into_verdict(),
            Err(error) => {
                warn!(%error, "worker failed");
                Verdict::Bury
            },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    /// Pause between polls; the queue's configured interval if unset.
    pub poll_interval: Option<Duration>,
    /// Stop after this many reservations. Unlimited if unset.
    pub limit: Option<usize>,
    /// How long each reservation may wait for a job. Forever if unset, so
    /// processing then only ends through `limit` or `cancel`.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// Outcome counts of a [`Queue::process`] run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProcessStats {
    /// jobs deleted
    pub success: u64,
    /// jobs buried
    pub failure: u64,
    /// jobs released without delay
    pub skipped: u64,
    /// jobs released with a delay
    pub delayed: u64,
}

impl<S: JobStore + ?Sized> Queue<S> {
    /// Reserves jobs one at a time and hands each payload to `worker`, whose
    /// return value decides the job's fate (see [`IntoVerdict`]).
    ///
    /// Stops once `limit` reservations were made or a reservation comes back
    /// empty. A payload that can't be decoded as `T` is buried. After every
    /// job, any transaction left open on the store is committed.
    #[instrument(skip_all, fields(watching = ?self.watching))]
    pub async fn process<T, F, R>(
        &self,
        mut worker: F,
        options: ProcessOptions,
    ) -> Result<ProcessStats, QueueError>
    where
        T: DeserializeOwned,
        F: FnMut(T, &Job<S>) -> R,
        R: IntoVerdict,
    {
        let poll_interval = options
            .poll_interval
            .unwrap_or_else(|| self.config.poll_interval());
        let limit = options.limit.unwrap_or(usize::MAX);

        let mut stats = ProcessStats::default();
        let mut reserved = 0;

        while reserved < limit {
            let Some(mut job) = self
                .reserve_with(
                    options.timeout,
                    poll_interval,
                    options.cancel.as_ref(),
                )
                .await?
            else {
                break;
            };
            reserved += 1;

            let verdict = match job.body::<T>() {
                Ok(body) => worker(body, &job).into_verdict(),
                Err(error) => {
                    warn!(id = job.id(), %error, "cannot decode payload");
                    Verdict::Bury
                },
            };
            debug!(id = job.id(), ?verdict, "worker finished");

            match verdict {
                Verdict::Delete => {
                    job.delete()?;
                    stats.success += 1;
                },
                Verdict::Release => {
                    job.release(None, 0)?;
                    stats.skipped += 1;
                },
                Verdict::Delay(delay) => {
                    job.release(None, delay)?;
                    stats.delayed += 1;
                },
                Verdict::Bury => {
                    job.bury(None)?;
                    stats.failure += 1;
                },
            }

            self.store.commit()?;
        }

        info!(?stats, "processing finished");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts() {
        assert_eq!(true.into_verdict(), Verdict::Delete);
        assert_eq!(false.into_verdict(), Verdict::Bury);
        assert_eq!(().into_verdict(), Verdict::Release);
        assert_eq!(30u32.into_verdict(), Verdict::Delay(30));
        assert_eq!(None::<bool>.into_verdict(), Verdict::Release);
        assert_eq!(Some(true).into_verdict(), Verdict::Delete);
        assert_eq!(Some(false).into_verdict(), Verdict::Bury);
        assert_eq!(Ok::<_, String>(true).into_verdict(), Verdict::Delete);
        assert_eq!(Err::<bool, _>("boom").into_verdict(), Verdict::Bury);
    }
}
