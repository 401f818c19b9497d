use crate::error::{is_canceled, Canceled, RetryExhausted};
use eyre::{eyre, Report, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Controls the bounded exponential backoff applied by [`retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. Zero means the operation is never invoked.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt thereafter.
    pub base_delay: Duration,
    /// Hard cap on any single pre-attempt delay, before jitter.
    pub max_delay: Duration,
    /// Add a uniformly random addend in `[0, delay / 4)` to each delay.
    pub jitter: bool,
}

/// Remote command submission over the management channel.
pub const SSM_POLICY: RetryConfig = RetryConfig {
    max_attempts: 3,
    base_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(30),
    jitter: true,
};

/// Control-plane API calls (tagging, metadata lookups).
pub const EC2_POLICY: RetryConfig = RetryConfig {
    max_attempts: 5,
    base_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(10),
    jitter: true,
};

/// Connectivity probes from the target outward.
pub const NETWORK_POLICY: RetryConfig = RetryConfig {
    max_attempts: 3,
    base_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(15),
    jitter: true,
};

impl RetryConfig {
    /// Pre-delay before attempt `attempt + 1` (`attempt` is 1-indexed),
    /// jitter excluded: `min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay + delay.mul_f64(rand::thread_rng().gen_range(0.0..0.25))
    }
}

/// Messages that indicate a transient condition worth retrying.
const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "network is unreachable",
    "temporary failure",
    "rate limit",
    "throttling",
    "service unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
];

/// Messages that indicate retrying cannot help.
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "unauthorized",
    "forbidden",
    "not found",
    "invalid argument",
    "bad request",
    "invalid credentials",
];

/// Classify an error by its message, case-insensitively. Retryable markers
/// win when both kinds match; unrecognized errors default to retryable so a
/// provider SDK with novel wording is not failed on its first hiccup.
pub fn is_retryable(err: &Report) -> bool {
    let message = format!("{err:#}").to_lowercase();
    if RETRYABLE_MARKERS.iter().any(|m| message.contains(m)) {
        return true;
    }
    if NON_RETRYABLE_MARKERS.iter().any(|m| message.contains(m)) {
        return false;
    }
    true
}

/// Run `op` under `config`, backing off between attempts.
///
/// Cancellation is observed before every attempt and during every pre-attempt
/// wait; a canceled run returns the cancellation error immediately without
/// further attempts. Non-retryable errors end the loop on the spot. When
/// every attempt is spent, the terminal error wraps the attempt count.
pub async fn retry<T, F, Fut>(
    ctx: &CancellationToken,
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if config.max_attempts == 0 {
        return Err(eyre!("retry policy for '{operation}' allows zero attempts"));
    }

    let mut last_err: Option<Report> = None;
    for attempt in 1..=config.max_attempts {
        if ctx.is_cancelled() {
            return Err(Canceled.into());
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_canceled(&err) => return Err(err),
            Err(err) if !is_retryable(&err) => {
                return Err(err.wrap_err(format!(
                    "non-retryable error in '{operation}' on attempt {attempt}"
                )));
            }
            Err(err) => {
                if attempt < config.max_attempts {
                    let delay = config.jittered(config.delay_after_attempt(attempt));
                    warn!(
                        operation,
                        attempt,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancelled() => return Err(Canceled.into()),
                    }
                }
                last_err = Some(err);
            }
        }
    }

    let last_error = last_err.expect("at least one attempt ran");
    Err(Report::new(RetryExhausted {
        operation: operation.to_string(),
        attempts: config.max_attempts,
        last_error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn zero_attempts_never_invokes_the_operation() {
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&ctx, &quick(0), "noop", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_runs_exactly_max_attempts() {
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&ctx, &quick(3), "always-fails", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre!("connection refused")) }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("after 3 attempt"));
    }

    #[tokio::test]
    async fn single_attempt_policies_do_not_sleep() {
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result: Result<()> = retry(
            &ctx,
            &RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                jitter: false,
            },
            "one-shot",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(eyre!("timeout")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&ctx, &quick(5), "denied", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre!("access denied for role")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_recover() {
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = retry(&ctx, &quick(3), "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(eyre!("throttling: slow down"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pre_canceled_context_skips_all_attempts() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&ctx, &quick(3), "canceled", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(is_canceled(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(config.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_after_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_after_attempt(6), Duration::from_secs(30));
        assert_eq!(config.delay_after_attempt(60), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(30),
            jitter: true,
        };
        for attempt in 1..=8 {
            let base = config.delay_after_attempt(attempt);
            let delay = config.jittered(base);
            assert!(delay >= base);
            assert!(delay < base.mul_f64(1.25));
        }
    }

    #[test]
    fn classification_follows_the_marker_tables() {
        assert!(is_retryable(&eyre!("Gateway Timeout from upstream")));
        assert!(is_retryable(&eyre!("Rate limit exceeded")));
        assert!(!is_retryable(&eyre!("Permission denied (publickey)")));
        assert!(!is_retryable(&eyre!("document not found")));
        // Retryable wins when both kinds of marker appear.
        assert!(is_retryable(&eyre!("timeout while checking: forbidden")));
        // Unrecognized messages default to retryable.
        assert!(is_retryable(&eyre!("something unexpected happened")));
    }

    #[test]
    fn named_policies_match_their_documented_shapes() {
        assert_eq!(SSM_POLICY.max_attempts, 3);
        assert_eq!(SSM_POLICY.base_delay, Duration::from_secs(1));
        assert_eq!(SSM_POLICY.max_delay, Duration::from_secs(30));
        assert_eq!(EC2_POLICY.max_attempts, 5);
        assert_eq!(EC2_POLICY.base_delay, Duration::from_millis(500));
        assert_eq!(EC2_POLICY.max_delay, Duration::from_secs(10));
        assert_eq!(NETWORK_POLICY.max_attempts, 3);
        assert_eq!(NETWORK_POLICY.base_delay, Duration::from_secs(2));
        assert_eq!(NETWORK_POLICY.max_delay, Duration::from_secs(15));
        assert!(SSM_POLICY.jitter && EC2_POLICY.jitter && NETWORK_POLICY.jitter);
    }
}
