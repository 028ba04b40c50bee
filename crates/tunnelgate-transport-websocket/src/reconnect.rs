//! Redial pacing for outbound tunnel connections

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
///
/// With `initial_backoff == max_backoff` the delay never grows, which gives a
/// fixed redial interval.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// None = unlimited
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl ReconnectConfig {
    /// Retry every `interval`, forever
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    /// Exponential backoff from `initial` up to `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_backoff: initial,
            max_backoff: max.max(initial),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks redial attempts and the delay before the next one
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Count an attempt and return how long to wait before making it
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let delay = self.current_backoff;
        let grown =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = grown.min(self.config.max_backoff);

        Ok(delay)
    }

    /// Sleep until the next attempt is due, or until `shutdown` fires
    pub async fn wait(&mut self, shutdown: &CancellationToken) -> Result<(), ReconnectError> {
        let delay = self.next_delay()?;

        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        tokio::select! {
            _ = shutdown.cancelled() => Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff after {} attempts", self.attempt);
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_caps() {
        let mut manager = ReconnectManager::new(ReconnectConfig::exponential(
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));

        let delays: Vec<_> = (0..5).map(|_| manager.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(100),
            ]
        );
        assert_eq!(manager.attempt(), 5);
    }

    #[test]
    fn test_fixed_interval_never_grows() {
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_secs(1)));
        for _ in 0..10 {
            assert_eq!(manager.next_delay().unwrap(), Duration::from_secs(1));
        }
        assert_eq!(manager.current_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_reset() {
        let mut manager = ReconnectManager::new(ReconnectConfig::exponential(
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));
        manager.next_delay().unwrap();
        manager.next_delay().unwrap();
        assert_eq!(manager.attempt(), 2);

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_max_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::fixed(Duration::from_millis(1))
        });

        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());
        assert_eq!(manager.next_delay(), Err(ReconnectError::MaxAttemptsReached));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_backoff() {
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_secs(1)));
        let shutdown = CancellationToken::new();

        let started = tokio::time::Instant::now();
        manager.wait(&shutdown).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_secs(3600)));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert_eq!(manager.wait(&shutdown).await, Err(ReconnectError::Cancelled));
    }
}
