//! Bounded retry for transient read failures

use std::time::Duration;

use crate::error::Result;

/// Waits between attempts: three retries after the first try
pub const READ_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Run `op`, retrying only `TransientIO` failures with the default backoff
pub fn retry_transient<T>(op: impl FnMut() -> Result<T>) -> Result<T> {
    retry_transient_with(&READ_BACKOFF, op)
}

/// Run `op`, sleeping `delays[i]` before retry `i`. Blocking; call from the
/// blocking pool only.
pub fn retry_transient_with<T>(delays: &[Duration], mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < delays.len() => {
                tracing::debug!(attempt = attempt + 1, error = %e, "retrying transient failure");
                std::thread::sleep(delays[attempt]);
                attempt += 1;
            }
            other => return other,
        }
    }
}
