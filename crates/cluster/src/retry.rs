//! Retrying wrapper for remote calls.
//!
//! Policy is fixed and documented: 4xx (including 404) propagates
//! immediately; status >= 500 and transport failures are retried at most
//! twice with 300 ms then 1000 ms backoff; once retries are exhausted the
//! last observed error propagates.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

use crate::CallError;

const BACKOFF_MS: [u64; 2] = [300, 1000];

/// Run `op`, retrying transient failures. `what` names the call in logs.
pub async fn call_with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let mut err = match op().await {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    for backoff in BACKOFF_MS {
        if !err.is_transient() {
            return Err(err);
        }
        counter!("vigil_api_retries_total", 1u64);
        warn!(call = %what, error = %err, backoff_ms = backoff, "transient api failure, retrying");
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
    }
    Err(err)
}
