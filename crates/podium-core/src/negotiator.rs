//! Backend negotiation: wait for libraries, try the accelerated tier, fall
//! back to software once.

use crate::backend::{BackendFactory, BackendState, BackendStatus, BackendTier, FaceEstimator, LibraryProbe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const LIBRARY_POLL_ATTEMPTS: u32 = 10;
pub const LIBRARY_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("inference libraries not available after {attempts} polls")]
    LibrariesUnavailable { attempts: u32 },
    #[error("no inference backend could be initialized (accelerated: {accelerated}; fallback: {fallback})")]
    AllTiersFailed { accelerated: String, fallback: String },
}

/// Bounded polling budget for library availability.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: LIBRARY_POLL_ATTEMPTS,
            interval: LIBRARY_POLL_INTERVAL,
        }
    }
}

/// An initialized backend, ready for detection calls.
pub struct ReadyBackend {
    pub tier: BackendTier,
    pub estimator: Box<dyn FaceEstimator>,
}

impl ReadyBackend {
    pub fn state(&self) -> BackendState {
        BackendState::ready(self.tier)
    }
}

pub struct Negotiator {
    probe: Arc<dyn LibraryProbe>,
    factory: Arc<dyn BackendFactory>,
    policy: RetryPolicy,
}

impl Negotiator {
    pub fn new(probe: Arc<dyn LibraryProbe>, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            probe,
            factory,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run negotiation once and publish the final state to `status`.
    ///
    /// Failures never escape as panics: the error is returned and the state
    /// becomes [`BackendState::Failed`].
    pub async fn initialize(&self, status: &BackendStatus) -> Result<ReadyBackend, NegotiationError> {
        let result = self.negotiate().await;
        match &result {
            Ok(ready) => {
                tracing::info!(tier = ready.tier.as_str(), "inference backend ready");
                status.advance(ready.state());
            }
            Err(e) => {
                tracing::error!(error = %e, "framing guidance unavailable");
                status.advance(BackendState::Failed);
            }
        }
        result
    }

    async fn negotiate(&self) -> Result<ReadyBackend, NegotiationError> {
        self.wait_for_libraries().await?;

        let accelerated = match self.create(BackendTier::Accelerated).await {
            Ok(estimator) => {
                return Ok(ReadyBackend {
                    tier: BackendTier::Accelerated,
                    estimator,
                })
            }
            Err(reason) => {
                tracing::warn!(%reason, "accelerated backend failed; trying fallback");
                reason
            }
        };

        match self.create(BackendTier::Fallback).await {
            Ok(estimator) => Ok(ReadyBackend {
                tier: BackendTier::Fallback,
                estimator,
            }),
            Err(fallback) => Err(NegotiationError::AllTiersFailed {
                accelerated,
                fallback,
            }),
        }
    }

    async fn wait_for_libraries(&self) -> Result<(), NegotiationError> {
        for attempt in 1..=self.policy.attempts {
            if self.probe.libraries_available() {
                tracing::debug!(attempt, "inference libraries available");
                return Ok(());
            }
            tracing::debug!(attempt, max = self.policy.attempts, "inference libraries not yet available");
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }
        Err(NegotiationError::LibrariesUnavailable {
            attempts: self.policy.attempts,
        })
    }

    /// Build one tier on the blocking pool; errors are flattened to strings.
    async fn create(&self, tier: BackendTier) -> Result<Box<dyn FaceEstimator>, String> {
        let factory = Arc::clone(&self.factory);
        match tokio::task::spawn_blocking(move || factory.create(tier)).await {
            Ok(Ok(estimator)) => Ok(estimator),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("backend init task failed: {e}")),
        }
    }
}
