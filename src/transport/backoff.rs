//! Retry backoff.
//!
//! The default is equal-jitter: half the capped exponential ceiling is
//! guaranteed, the other half is random. Callers can swap in their own
//! function through the transport builder.

use rand::Rng;

/// `(min_seconds, max_seconds, attempt) -> seconds to wait`.
/// Zero or negative means no wait.
pub type BackoffFn = dyn Fn(u32, u32, u32) -> f64 + Send + Sync;

/// Equal-jitter backoff: `ceil = min(max, 2^attempt) / 2`, then wait
/// `ceil + rand * (ceil - min) + min` seconds.
pub fn equal_jitter_backoff(min_seconds: u32, max_seconds: u32, attempt: u32) -> f64 {
    let exponential = 2_f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let ceiling = exponential.min(f64::from(max_seconds)) / 2.0;
    let jitter: f64 = rand::thread_rng().gen();
    ceiling + jitter * (ceiling - f64::from(min_seconds)) + f64::from(min_seconds)
}
