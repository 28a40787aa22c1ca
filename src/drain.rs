//! One pass over the sync queue. Serial, oldest first, no backoff: a job
//! that fails simply survives, with its failure recorded, until the next
//! manual or scheduled pass.

use crate::auth;
use crate::db::{self, Pool};
use crate::portal::PortalService;
use crate::sync;
use anyhow::Result;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

// Two overlapping drains would each compute a "remaining" set from the same
// snapshot, and the later write-back would resurrect jobs the earlier one
// completed. One pass at a time.
static DRAIN_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub remaining: usize,
}

/// Replay every queued job in enqueue order. Jobs that succeed are dropped;
/// jobs that fail survive with `attempts` bumped and `last_error` replaced.
/// Jobs enqueued while the pass runs are left for the next invocation.
#[instrument(skip_all)]
pub async fn drain(
    pool: &Pool,
    portal: &dyn PortalService,
    identity: Option<&str>,
) -> Result<DrainReport> {
    let _guard = DRAIN_LOCK.lock().await;

    let jobs = db::all_jobs(pool).await?;
    if jobs.is_empty() {
        return Ok(DrainReport { processed: 0, remaining: 0 });
    }

    // One credential refresh serves the whole batch. If it fails, remote
    // jobs below record an auth failure and stay queued; local-only jobs
    // still get their attempt.
    let cred = match auth::ensure_auth(pool, portal, identity).await {
        Ok(cred) => Some(cred),
        Err(err) => {
            warn!(error = %err, "draining without a portal session");
            None
        }
    };

    let mut visited = Vec::with_capacity(jobs.len());
    let mut remaining = Vec::new();
    let mut processed = 0usize;
    for mut job in jobs {
        visited.push(job.seq);
        match sync::replay(pool, portal, cred.as_ref(), &job.task).await {
            Ok(()) => {
                processed += 1;
                info!(kind = job.task.kind(), id = %job.id, "sync job completed");
            }
            Err(err) => {
                job.attempts += 1;
                job.last_error = Some(err.to_string());
                warn!(
                    kind = job.task.kind(),
                    id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "sync job failed; keeping"
                );
                remaining.push(job);
            }
        }
    }

    let report = DrainReport { processed, remaining: remaining.len() };
    db::replace_jobs(pool, &visited, &remaining).await?;
    Ok(report)
}
