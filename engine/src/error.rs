//! Stable error taxonomy for the engine's public surface.
//!
//! Everything inside a single module is free to use `anyhow::Result` for
//! plumbing; anything that crosses a component boundary (C1-C8) converts into
//! one of these variants so callers — including scripts running inside the
//! sandbox — can branch on a stable tag instead of a message string.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("script compilation failed: {0}")]
    CompileFailed(String),

    #[error("execution timed out: {reason}")]
    Timeout { reason: TimeoutReason },

    #[error("memory limit exceeded: used {used} bytes, limit {limit} bytes")]
    MemoryExceeded { used: usize, limit: usize },

    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("attestation failure: {0}")]
    AttestationFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    Deadline,
    WorkUnitsExceeded,
    Cancelled,
}

impl std::fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutReason::Deadline => write!(f, "deadline"),
            TimeoutReason::WorkUnitsExceeded => write!(f, "work_units_exceeded"),
            TimeoutReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl EngineError {
    /// Stable tag a script (or outer caller) can branch on without parsing
    /// the human-readable message. Matches the taxonomy in spec §7.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::CompileFailed(_) => "compile_failed",
            EngineError::Timeout { .. } => "timeout",
            EngineError::MemoryExceeded { .. } => "memory_exceeded",
            EngineError::CapabilityDenied(_) => "capability_denied",
            EngineError::NotFound(_) => "not_found",
            EngineError::CryptoFailure(_) => "crypto_failure",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::IntegrityFailure(_) => "integrity_failure",
            EngineError::AttestationFailure(_) => "attestation_failure",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
