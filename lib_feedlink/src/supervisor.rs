//! # Connection Supervisor
//!
//! Ordered connect-with-retry across a candidate list. The supervisor owns at
//! most one attempt at a time and never touches application streams: on
//! success it hands back the raw stream and which candidate produced it.
//!
//! ## Rules
//! - Candidates are tried strictly in the order given, wrapping around.
//! - Every attempt is bounded by `initializationTimeout`.
//! - Between failed attempts the delay grows from `reconnectMinDelay`
//!   towards `reconnectMaxDelay` and never shrinks within one sequence.
//! - The attempt limit counts consecutive failures across the whole list.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::catalog::Candidate;
use crate::error::ConnectError;
use crate::policy::ReconnectOptions;
use crate::transport::{BoxedIo, Transport};

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// The delay to wait now; the following one doubles, up to the max.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// A successful connect.
pub struct Established {
    pub candidate: Candidate,
    pub io: BoxedIo,
    /// Attempts made in this sequence, including the successful one.
    pub attempts: u32,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("candidate", &self.candidate)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    options: ReconnectOptions,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, options: ReconnectOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &ReconnectOptions {
        &self.options
    }

    /// Takes effect from the next connect sequence.
    pub fn set_options(&mut self, options: ReconnectOptions) {
        self.options = options;
    }

    /// Connects using the configured attempt limit.
    pub async fn connect(&self, candidates: &[Candidate], cancel: &CancellationToken) -> Result<Established, ConnectError> {
        let budget = self.options.attempt_budget(candidates.len());
        self.connect_with_budget(candidates, budget, cancel).await
    }

    /// Connects allowing at most `budget` consecutive failures (`None` = forever).
    pub async fn connect_with_budget(
        &self,
        candidates: &[Candidate],
        budget: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Established, ConnectError> {
        if candidates.is_empty() {
            return Err(ConnectError::NoCandidates);
        }

        let mut backoff = Backoff::new(self.options.reconnect_min_delay, self.options.reconnect_max_delay);
        let mut failures: u32 = 0;

        for candidate in candidates.iter().cycle() {
            let channel = &candidate.channel;
            log::info!("Connecting to {} at {} (attempt {})", channel.name, channel.address(), failures + 1);

            let attempt = tokio::time::timeout(self.options.initialization_timeout, self.transport.open(channel));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok(io)) => {
                    log::info!("Connected to {} at {}", channel.name, channel.address());
                    return Ok(Established { candidate: candidate.clone(), io, attempts: failures + 1 });
                }
                Ok(Err(e)) => log::warn!("Connect to {} failed: {}", channel.name, e),
                Err(_) => {
                    let e = ConnectError::Timeout {
                        target: channel.address(),
                        timeout: self.options.initialization_timeout,
                    };
                    log::warn!("Connect to {} failed: {}", channel.name, e);
                }
            }

            failures = failures.saturating_add(1);
            if let Some(limit) = budget {
                if failures >= limit {
                    log::error!("Giving up after {} consecutive connect failures", failures);
                    return Err(ConnectError::AttemptsExhausted { attempts: failures });
                }
            }

            let delay = backoff.next_delay();
            log::debug!("Retrying in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(ConnectError::NoCandidates)
    }
}
