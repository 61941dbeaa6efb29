use std::time::Duration;

/// Configuration for the delayed-redelivery backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// The base interval in seconds.
    pub interval: f64,
    /// The rate at which the exponent grows per failed attempt.
    pub backoff_rate: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            interval: 5.0,
            backoff_rate: 0.25,
        }
    }
}

/// Calculates the wait before redelivering a job whose `retries` field has
/// already been incremented for the upcoming attempt (`retries >= 1`).
///
/// The delay is `interval ^ (1 + backoff_rate * (retries - 1))` seconds, a
/// power-law backoff where the exponent rather than a multiplier grows with
/// each failed attempt.
pub fn calculate_retry_wait(retry_config: &RetryConfig, retries: u32) -> Duration {
    let exponent = 1.0 + retry_config.backoff_rate * (retries.saturating_sub(1)) as f64;
    Duration::from_secs_f64(retry_config.interval.powf(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculates_retry_wait() {
        let retry_config = RetryConfig::default();

        // First scheduled retry waits the base interval of 5 seconds.
        let wait = calculate_retry_wait(&retry_config, 1);
        assert!((wait.as_secs_f64() - 5.0).abs() < 1e-9);

        // Second scheduled retry waits 5^1.25 seconds.
        let wait = calculate_retry_wait(&retry_config, 2);
        assert!((wait.as_secs_f64() - 5f64.powf(1.25)).abs() < 1e-9);

        // Fifth scheduled retry waits 5^2 = 25 seconds.
        let wait = calculate_retry_wait(&retry_config, 5);
        assert!((wait.as_secs_f64() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_retry_wait_grows_monotonically() {
        let retry_config = RetryConfig::default();
        let mut previous = Duration::ZERO;
        for retries in 1..=5 {
            let wait = calculate_retry_wait(&retry_config, retries);
            assert!(
                wait >= previous,
                "wait for retry {retries} ({wait:?}) shrank below {previous:?}"
            );
            previous = wait;
        }
    }

    #[test]
    fn test_custom_interval_and_backoff_rate() {
        let retry_config = RetryConfig {
            interval: 2.0,
            backoff_rate: 0.5,
        };

        let wait = calculate_retry_wait(&retry_config, 3);
        // 2^(1 + 0.5 * 2) = 2^2 = 4 seconds.
        assert!((wait.as_secs_f64() - 4.0).abs() < 1e-9);
    }
}
