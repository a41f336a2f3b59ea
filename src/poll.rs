//! Poll-until-condition combinator
//!
//! Mirrors the e2e framework's poll: sleep one interval, run the check, and
//! repeat until the check succeeds, fails, or the timeout would be exceeded.
//! Unlike reconcile-style polling, a check error is final and is not retried.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::{Error, Result};

/// Poll `check_fn` every `interval` until it returns `Ok(true)`
///
/// # Arguments
/// * `interval` - Time to wait before each check, including the first
/// * `timeout` - Overall deadline
/// * `description` - What is being waited for, used in the timeout error
/// * `check_fn` - Returns `Ok(true)` when done, `Ok(false)` to keep waiting,
///   or `Err` to abort
///
/// # Returns
/// `Ok(())` once the condition holds, the check's error as soon as it fails,
/// or [`Error::Timeout`] when the deadline passes first. A timeout too large
/// to represent as a deadline is an [`Error::Config`].
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    description: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let description = description.into();
    let deadline = Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| Error::config(format!("poll timeout {:?} is out of range", timeout)))?;
    let mut attempt = 0u32;

    loop {
        if Instant::now() + interval > deadline {
            return Err(Error::timeout(description, timeout));
        }

        tokio::time::sleep(interval).await;
        attempt += 1;

        if check_fn().await? {
            return Ok(());
        }

        trace!(attempt, wait = %description, "Condition not yet met");
    }
}
