use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::*;

/// Run `retry_fn` until it succeeds, `should_retry` rejects the error, or
/// `max_retries` extra attempts are spent. The delay doubles after each try.
pub async fn retry<T, E, F, Fut, P>(
    retry_fn: F,
    max_retries: u32,
    delay: Duration,
    should_retry: P,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>> + Send,
    F: Fn() -> Fut,
    P: Fn(&E) -> bool,
    E: std::fmt::Display, {
    let mut retries = 0;
    let mut d = delay;
    loop {
        match retry_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if retries < max_retries && should_retry(&err) => {
                retries += 1;
                warn!("attempt failed ({err}), retry {retries}/{max_retries} in {d:?}");
                sleep(d).await;
                d = d.saturating_mul(2);
            }
            Err(err) => {
                return Err(err);
            }
        }
    }
}
