//! Bounded retry for cluster writes
//!
//! The rotator's writes race against other replicas and against third
//! parties editing the same objects. Failures fall into two families with
//! different correct responses: an optimistic-concurrency conflict (HTTP
//! 409) means another writer won and the losing side should re-read fresh
//! state and try again immediately, while transient faults (API timeouts,
//! discovery hiccups, a not-yet-established CRD) deserve a jittered
//! pause so competing replicas do not hammer the API server in lockstep.
//! [`retry_cluster_write`] applies that split up to a bounded attempt
//! budget; anything still failing after that is handed back to the
//! controller's requeue machinery.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// First pause after a transient (non-conflict) failure
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Ceiling for the doubling backoff
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// True when the error is an optimistic-concurrency conflict (HTTP 409).
///
/// This is the retry loop's fast path: the object's resourceVersion moved
/// under us, so the next attempt re-reads and reapplies without waiting.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409)
}

/// Run a cluster write until it sticks, up to `attempts` tries.
///
/// Each attempt must do its own fresh read-modify-write; the loop only
/// decides whether (and how fast) to go again. Conflicts retry
/// immediately, transient faults back off with jitter, and the last error
/// is returned once the budget is spent.
pub async fn retry_cluster_write<T, F, Fut>(
    operation_name: &str,
    attempts: u32,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                %error,
                "cluster write failed after max retries"
            );
            return Err(error);
        }

        if matches!(&error, Error::Kube(kube_err) if is_conflict(kube_err)) {
            debug!(
                operation = %operation_name,
                attempt = attempt,
                "write conflict, retrying against fresh state"
            );
            continue;
        }

        // 0.5x to 1.5x so replicas retrying the same fault spread out
        let pause = backoff.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt = attempt,
            %error,
            pause_ms = pause.as_millis(),
            "cluster write failed, backing off"
        );
        tokio::time::sleep(pause).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} while updating object"),
            reason: reason.to_string(),
            code,
        }))
    }

    fn conflict() -> Error {
        api_error(409, "Conflict")
    }

    #[test]
    fn conflict_detection_matches_409_only() {
        for (code, reason, expected) in [
            (409, "Conflict", true),
            (403, "Forbidden", false),
            (404, "NotFound", false),
            (500, "InternalError", false),
        ] {
            let Error::Kube(kube_err) = api_error(code, reason) else {
                unreachable!("api_error always builds a kube error");
            };
            assert_eq!(is_conflict(&kube_err), expected, "code {code}");
        }
    }

    #[tokio::test]
    async fn clean_write_takes_one_attempt() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result = retry_cluster_write("patch bundle", 5, || {
            let w = w.clone();
            async move {
                w.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.expect("write should succeed"), 42);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn losing_the_conflict_race_twice_still_lands_the_write() {
        // two other writers bump the resourceVersion under us, then we win
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result = retry_cluster_write("update secret", 5, || {
            let w = w.clone();
            async move {
                if w.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflicts_retry_without_backing_off() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();
        let start = tokio::time::Instant::now();

        retry_cluster_write("update secret", 4, || {
            let w = w.clone();
            async move {
                if w.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(conflict())
                } else {
                    Ok(())
                }
            }
        })
        .await
        .expect("write should eventually succeed");

        // three straight conflicts must not have slept through even one
        // backoff period
        assert!(start.elapsed() < INITIAL_BACKOFF);
    }

    #[tokio::test]
    async fn endless_conflicts_exhaust_the_budget() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result: Result<(), Error> = retry_cluster_write("update secret", 3, || {
            let w = w.clone();
            async move {
                w.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        let error = result.expect_err("budget should run out");
        assert!(matches!(&error, Error::Kube(kube_err) if is_conflict(kube_err)));
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_fault_backs_off_then_recovers() {
        // e.g. the Provider CRD is not established yet on the first try
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result = retry_cluster_write("update CA bundle", 5, || {
            let w = w.clone();
            async move {
                if w.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(api_error(404, "NotFound"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }
}
