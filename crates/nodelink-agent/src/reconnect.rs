//! Reconnection logic with exponential backoff and server-issued cooldown

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReconnectConfig;

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// What the next pause before reconnecting is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Exponential backoff for the current attempt
    Backoff(Duration),
    /// One-shot cooldown requested by the gateway
    Cooldown(Duration),
}

impl Wait {
    pub fn duration(&self) -> Duration {
        match self {
            Wait::Backoff(d) | Wait::Cooldown(d) => *d,
        }
    }
}

/// `min(base * 2^min(attempt, max_exponent), max_delay)`
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.min(config.max_exponent).min(63);
    let factor = 1u64 << exponent;
    let delay_ms = config
        .base_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);
    Duration::from_millis(delay_ms)
}

/// Tracks the attempt counter and any pending cooldown
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempt: u32,
    cooldown: Option<Duration>,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            cooldown: None,
        }
    }

    /// Count a lost or failed connection; returns the new attempt number
    pub fn record_disconnect(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.attempt = 0;
    }

    /// Arm a cooldown for the next wait. Does not touch the attempt counter.
    pub fn set_cooldown(&mut self, retry_after_sec: Option<u64>) -> Duration {
        let duration = match retry_after_sec {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.config.default_cooldown_ms),
        };
        self.cooldown = Some(duration);
        duration
    }

    pub fn pending_cooldown(&self) -> Option<Duration> {
        self.cooldown
    }

    /// Pick the next pause, consuming any pending cooldown
    pub fn next_wait(&mut self) -> Wait {
        match self.cooldown.take() {
            Some(duration) => Wait::Cooldown(duration),
            None => Wait::Backoff(backoff_delay(&self.config, self.attempt)),
        }
    }

    /// Sleep for the next pause unless `cancel` fires first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<Wait, ReconnectError> {
        let wait = self.next_wait();

        debug!(
            attempt = self.attempt,
            delay_ms = wait.duration().as_millis() as u64,
            cooldown = matches!(wait, Wait::Cooldown(_)),
            "Waiting before reconnection"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = sleep(wait.duration()) => Ok(wait),
        }
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
