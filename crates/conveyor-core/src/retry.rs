//! Retry and poll loop primitives.
//!
//! Shared durable state (git refs, blob keys) is eventually observed, not
//! transactional. Writers converge through `retry_with_reload`: reload the
//! authoritative state, attempt the operation, and loop when a concurrent
//! writer got there first. Readers waiting on remote progress use
//! `poll_until`, whose only cancellation is its deadline.

use std::time::{Duration, Instant};

use tracing::{info, warn};

/// What to do with an error seen inside a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reload and try again (lost race, transient failure).
    Retry,
    /// Not recoverable by retrying; surface immediately.
    Fail,
}

/// Optimistic retry with full state reload.
///
/// Each attempt runs `reload` then `attempt` against the shared context
/// (typically the owning manager). Errors from either are passed to
/// `classify`; `Retry` loops, `Fail` surfaces immediately. When attempts
/// are exhausted the last error surfaces — callers wrap it in their typed
/// exhaustion error and run their cleanup.
pub fn retry_with_reload<Ctx, T, E, R, A, C>(
    max_attempts: u32,
    ctx: &mut Ctx,
    mut reload: R,
    mut attempt: A,
    mut classify: C,
) -> Result<T, E>
where
    R: FnMut(&mut Ctx) -> Result<(), E>,
    A: FnMut(&mut Ctx) -> Result<T, E>,
    C: FnMut(&E) -> RetryDecision,
{
    assert!(max_attempts > 0, "retry_with_reload needs at least one attempt");
    let mut tries = 0;
    loop {
        tries += 1;
        let result = reload(ctx).and_then(|_| attempt(ctx));
        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                if tries >= max_attempts || classify(&e) == RetryDecision::Fail {
                    return Err(e);
                }
                warn!(attempt = tries, max = max_attempts, "retrying after full reload");
            }
        }
    }
}

/// Result of a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// `should_wait` returned false before the deadline.
    ConditionMet,
    DeadlineExceeded,
}

/// Poll `should_wait` on a fixed period until it returns false or the
/// deadline passes, firing `progress` periodically.
pub fn poll_until<E>(
    period: Duration,
    deadline: Duration,
    progress_every: Duration,
    mut should_wait: impl FnMut() -> Result<bool, E>,
    mut progress: impl FnMut(Duration),
) -> Result<PollOutcome, E> {
    let start = Instant::now();
    let mut last_progress = start;
    loop {
        if !should_wait()? {
            return Ok(PollOutcome::ConditionMet);
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            info!(elapsed_secs = elapsed.as_secs(), "poll deadline exceeded");
            return Ok(PollOutcome::DeadlineExceeded);
        }
        if last_progress.elapsed() >= progress_every {
            progress(elapsed);
            last_progress = Instant::now();
        }
        std::thread::sleep(period.min(deadline - elapsed));
    }
}
