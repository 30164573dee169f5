//! Inference backend seams and the process-wide backend state.

use crate::detector::DetectorError;
use crate::types::{BoundingBox, Frame};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Inference execution tier. Both tiers honour the same detection contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendTier {
    Accelerated,
    Fallback,
}

impl BackendTier {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendTier::Accelerated => "accelerated",
            BackendTier::Fallback => "fallback",
        }
    }
}

/// Outcome of backend negotiation.
///
/// Leaves `Uninitialized` exactly once; every other state is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendState {
    #[default]
    Uninitialized,
    ReadyAccelerated,
    ReadyFallback,
    Failed,
}

impl BackendState {
    pub fn ready(tier: BackendTier) -> Self {
        match tier {
            BackendTier::Accelerated => BackendState::ReadyAccelerated,
            BackendTier::Fallback => BackendState::ReadyFallback,
        }
    }

    pub fn is_ready(self) -> bool {
        self.tier().is_some()
    }

    pub fn tier(self) -> Option<BackendTier> {
        match self {
            BackendState::ReadyAccelerated => Some(BackendTier::Accelerated),
            BackendState::ReadyFallback => Some(BackendTier::Fallback),
            BackendState::Uninitialized | BackendState::Failed => None,
        }
    }

    /// Fallback tier active: the host shows a "compatibility mode" hint.
    pub fn is_compatibility_mode(self) -> bool {
        self == BackendState::ReadyFallback
    }

    pub fn can_transition_to(self, next: BackendState) -> bool {
        self == BackendState::Uninitialized && next != BackendState::Uninitialized
    }
}

/// A face-localization backend. Calls may block for an arbitrary time; the
/// scheduler runs them off the async executor.
pub trait FaceEstimator: Send {
    fn estimate_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Reports whether the externally provisioned inference libraries/models are
/// present yet.
pub trait LibraryProbe: Send + Sync {
    fn libraries_available(&self) -> bool;
}

/// Builds a backend for a given tier. May block (model load, device init).
pub trait BackendFactory: Send + Sync {
    fn create(&self, tier: BackendTier) -> Result<Box<dyn FaceEstimator>, DetectorError>;
}

/// Shared, monotonic [`BackendState`] cell.
pub struct BackendStatus {
    tx: watch::Sender<BackendState>,
}

impl BackendStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BackendState::Uninitialized);
        Self { tx }
    }

    pub fn state(&self) -> BackendState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Returns false (and leaves the state alone) when the
    /// transition would break monotonicity.
    pub fn advance(&self, next: BackendState) -> bool {
        let applied = self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if !applied {
            tracing::warn!(current = ?self.state(), rejected = ?next, "ignoring backend state transition");
        }
        applied
    }
}

impl Default for BackendStatus {
    fn default() -> Self {
        Self::new()
    }
}
