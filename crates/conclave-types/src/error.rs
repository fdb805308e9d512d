//! Error types for the conclave deliberation engine.
//!
//! Provides [`CouncilError`] as the top-level error type and
//! [`FailureReason`] for the precise, machine-readable reasons a session
//! can terminate. Both are non-exhaustive to allow future extension
//! without breaking downstream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable reason a deliberation session terminated early.
///
/// These are the only reasons a session is allowed to fail outright;
/// everything else is recovered locally and surfaced as a degradation
/// notice (see the propagation policy in the crate docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum FailureReason {
    /// The tier selector could not produce at least two participants.
    InsufficientPanel,
    /// Fewer than two Stage 1 responses survived to peer review.
    InsufficientStage1Survivors,
    /// Fewer than two valid peer reviews remained after abstentions.
    InsufficientStage2Reviewers,
    /// The client cancelled the session before it sealed.
    Cancelled,
    /// The session deadline expired.
    DeadlineExceeded,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::InsufficientPanel => "insufficient-panel",
            FailureReason::InsufficientStage1Survivors => "insufficient-stage1-survivors",
            FailureReason::InsufficientStage2Reviewers => "insufficient-stage2-reviewers",
            FailureReason::Cancelled => "cancelled",
            FailureReason::DeadlineExceeded => "deadline-exceeded",
        };
        f.write_str(s)
    }
}

/// Top-level error type for the conclave engine.
///
/// Variants are grouped into session-terminal (panel insufficiency,
/// cancellation) and fatal (config, I/O) categories; transient upstream
/// errors never reach this type -- they are retried inside the gateway
/// and surfaced as degradation notices.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CouncilError {
    // ── Session-terminal ─────────────────────────────────────────────

    /// The session failed with a precise reason.
    #[error("session failed: {reason}")]
    SessionFailed {
        /// Why the session terminated.
        reason: FailureReason,
    },

    // ── Fatal ────────────────────────────────────────────────────────

    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The gateway layer failed in a way the session could not absorb.
    #[error("gateway error: {message}")]
    Gateway {
        /// Gateway-supplied error message.
        message: String,
    },

    /// The model registry could not supply required metadata.
    #[error("registry error: {message}")]
    Registry {
        /// What the registry could not provide.
        message: String,
    },

    /// Underlying I/O error (transcript store, audit store).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CouncilError {
    /// Shorthand for a session failure.
    pub fn session(reason: FailureReason) -> Self {
        CouncilError::SessionFailed { reason }
    }

    /// Process exit code for CLI and gate invocations.
    ///
    /// `3` for panel insufficiency at any stage, `4` for everything else
    /// (system error). Verdict-derived codes 0/1/2 come from
    /// `DeliberationResult`, not from errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            CouncilError::SessionFailed { reason } => match reason {
                FailureReason::InsufficientPanel
                | FailureReason::InsufficientStage1Survivors
                | FailureReason::InsufficientStage2Reviewers => 3,
                FailureReason::Cancelled | FailureReason::DeadlineExceeded => 4,
            },
            _ => 4,
        }
    }
}

/// A convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CouncilError>;
