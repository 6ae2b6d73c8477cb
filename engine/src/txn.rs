//! Optimistic transactions on one list collection.
//!
//! Every write the engine makes to a list goes through [`run`]: the writes
//! are planned against a snapshot of the list and committed with the
//! snapshot's version as a guard. If another writer commits in between, the
//! commit conflicts and the writes are planned again from a fresh snapshot.
//!
//! - Retries use exponential backoff (doubling, capped at 5s) with ±25%
//!   jitter.
//! - The number of attempts is bounded by `Config::txn_max_attempts`.
//! - A plan that gives up on a later attempt (for example because the task
//!   it was about to update has been deleted) leaves the list untouched.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::error::{EngineError, Result, StoreError};
use crate::store::{Snapshot, Transaction, Write};
use crate::types::{ListSpec, LIST_SPEC_ROW};

/// Upper bound on the delay between attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// What to do with one snapshot of a list.
#[derive(Debug)]
pub(crate) enum Plan<T> {
    /// Commit `writes`, yielding `value` once they are in.
    Commit { writes: Vec<Write>, value: T },
    /// Nothing to write.
    Skip(T),
}

impl<T> Plan<T> {
    /// Commits `write` together with a fresh list timestamp.
    pub(crate) fn touching(
        list_id: &str,
        snapshot: &Snapshot,
        write: Write,
        value: T,
    ) -> Result<Self> {
        let spec = list_spec(list_id, snapshot)?;
        Ok(Self::Commit {
            writes: vec![
                write,
                Write::put_json(LIST_SPEC_ROW, &spec.touched(Utc::now()))?,
            ],
            value,
        })
    }
}

/// Decodes the spec row of a list snapshot.
///
/// # Errors
///
/// Returns [`EngineError::UnknownList`] if the snapshot has no spec row.
pub(crate) fn list_spec(list_id: &str, snapshot: &Snapshot) -> Result<ListSpec> {
    match snapshot.rows.get(LIST_SPEC_ROW) {
        Some(raw) => Ok(serde_json::from_slice(raw)?),
        None => Err(EngineError::UnknownList(list_id.to_string())),
    }
}

/// Plans and commits writes to `list_id`, retrying on conflict.
///
/// `plan` is called once per attempt with the latest snapshot. Returns the
/// planned value and the number of the attempt that succeeded.
///
/// # Errors
///
/// - [`EngineError::UnknownList`] if the list collection is missing
/// - [`EngineError::TransactionConflict`] if every attempt conflicted
/// - whatever `plan` returns
pub(crate) async fn run<T, F>(
    ctx: &EngineContext,
    list_id: &str,
    mut plan: F,
) -> Result<(T, u32)>
where
    F: FnMut(&Snapshot) -> Result<Plan<T>>,
{
    let max_attempts = ctx.config.txn_max_attempts;
    let mut delay = ctx.config.txn_retry_delay;

    for attempt in 1..=max_attempts {
        let snapshot = ctx
            .store
            .snapshot(list_id)
            .await
            .map_err(|e| unknown_list(list_id, e))?;

        let (writes, value) = match plan(&snapshot)? {
            Plan::Skip(value) => return Ok((value, attempt)),
            Plan::Commit { writes, value } => (writes, value),
        };

        let txn = Transaction {
            collection: list_id.to_string(),
            expected_version: Some(snapshot.version),
            writes,
        };
        match ctx.store.commit(txn).await {
            Ok(()) => return Ok((value, attempt)),
            Err(e) if e.is_conflict() => {
                warn!(list_id, attempt, max_attempts, error = %e, "List transaction conflicted");
                if attempt < max_attempts {
                    let wait = add_jitter(delay);
                    debug!(list_id, delay_ms = wait.as_millis() as u64, "Waiting before retry");
                    sleep(wait).await;
                    delay = increase_retry_delay(delay);
                }
            }
            Err(e) => return Err(unknown_list(list_id, e)),
        }
    }

    Err(EngineError::TransactionConflict {
        list_id: list_id.to_string(),
        attempts: max_attempts,
    })
}

/// Maps a missing collection to [`EngineError::UnknownList`].
pub(crate) fn unknown_list(list_id: &str, err: StoreError) -> EngineError {
    match err {
        StoreError::NotFound(_) => EngineError::UnknownList(list_id.to_string()),
        other => other.into(),
    }
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
}

/// Doubles the retry delay up to [`MAX_RETRY_DELAY`].
fn increase_retry_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config {
            txn_retry_delay: Duration::from_millis(1),
            ..Config::default()
        }
    }

    async fn seed(ctx: &EngineContext) {
        let spec = serde_json::to_vec(&ListSpec::new("Chores")).unwrap();
        ctx.store
            .create_collection("l1", vec![(LIST_SPEC_ROW.to_string(), spec)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_is_guarded_by_snapshot_version() {
        let (ctx, _store) = EngineContext::in_memory(test_config());
        seed(&ctx).await;

        let mut seen = Vec::new();
        let (value, attempts) = run(&ctx, "l1", |snapshot| {
            seen.push(snapshot.version);
            Ok(Plan::Commit {
                writes: vec![Write::Put {
                    row_key: "t1".to_string(),
                    value: b"{}".to_vec(),
                }],
                value: "done",
            })
        })
        .await
        .unwrap();

        assert_eq!((value, attempts), ("done", 1));
        assert_eq!(seen, vec![1]);
        assert_eq!(ctx.store.snapshot("l1").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn skip_writes_nothing() {
        let (ctx, _store) = EngineContext::in_memory(test_config());
        seed(&ctx).await;

        let (value, _) = run(&ctx, "l1", |_| Ok(Plan::Skip(7))).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(ctx.store.snapshot("l1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn plan_error_is_returned_untouched() {
        let (ctx, _store) = EngineContext::in_memory(test_config());
        seed(&ctx).await;

        let err = run::<(), _>(&ctx, "l1", |_| {
            Err(EngineError::UnknownTask {
                list_id: "l1".to_string(),
                task_id: "t9".to_string(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::UnknownTask { .. }));
        assert_eq!(ctx.store.snapshot("l1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn missing_list_is_unknown() {
        let (ctx, _store) = EngineContext::in_memory(test_config());
        let err = run(&ctx, "nope", |_| Ok(Plan::Skip(()))).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownList(ref id) if id == "nope"));
    }

    #[tokio::test]
    async fn touching_requires_spec_row() {
        let (ctx, _store) = EngineContext::in_memory(test_config());
        ctx.store.create_collection("l1", Vec::new()).await.unwrap();
        let snapshot = ctx.store.snapshot("l1").await.unwrap();

        let write = Write::Delete {
            row_key: "t1".to_string(),
        };
        let err = Plan::touching("l1", &snapshot, write, ()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownList(_)));
    }

    #[test]
    fn add_jitter_stays_within_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..100 {
            let ms = add_jitter(base).as_secs_f64() * 1000.0;
            assert!((300.0..=500.0).contains(&ms), "Jitter out of bounds: {ms}");
        }
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(
            increase_retry_delay(Duration::from_millis(300)),
            Duration::from_millis(600)
        );
        assert_eq!(increase_retry_delay(Duration::from_secs(4)), MAX_RETRY_DELAY);
    }
}
