//! Data model — spec §3.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Identity that owns secrets and under whose authority scripts execute.
pub type PrincipalId = String;

/// Immutable description of a script a caller wants to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub function_id: String,
    pub principal_id: PrincipalId,
    pub source: String,
    /// Secret names this function is allowed to read via `secrets.get`.
    #[serde(default)]
    pub allowed_secrets: Vec<String>,
    pub trigger_kind: TriggerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    OnChainEvent,
    HttpWebhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Error,
    Timeout,
    MemoryExceeded,
    CapabilityDenied,
}

/// Result of one execution, spec §3 "Execution record".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub function_id: String,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub status: TerminalStatus,
    /// JSON-serialized result bytes, present only on `Success`.
    pub result: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    /// Captured console output, oldest-dropped once `log_buffer` is full.
    pub logs: Vec<String>,
    pub peak_memory_bytes: usize,
    pub wall_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub tag: String,
    pub message: String,
}

/// Store-unique identifier for a data key, spec §3 "Data key". A thin
/// newtype rather than a bare `String` so a secret entry's `data_key_id`
/// and the store's `wrapped_data_keys` map can't be confused with a
/// principal id or secret name at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataKeyId(pub String);

impl std::fmt::Display for DataKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DataKeyId {
    fn from(s: String) -> Self {
        DataKeyId(s)
    }
}

/// Per-(principal, name) stored secret, spec §3 "Secret entry".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; 12],
    pub data_key_id: DataKeyId,
    pub metadata: SecretMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub last_access: Option<SystemTime>,
    pub version: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Audit entry, spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: SystemTime,
    pub principal: PrincipalId,
    /// `None` represents a wildcard / bulk operation (export, import).
    pub secret_name: Option<String>,
    pub action: AuditAction,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Export,
    Import,
}

/// Enclave lifecycle + cached attestation, spec §3 "Enclave state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnclaveLifecycle {
    Initializing,
    Running,
    Error,
    Closed,
}

/// Opaque token string plus the evidence it was derived from and its expiry,
/// spec §3 "Attestation token". Cached by a [`Provider`](crate::enclave::Provider)
/// so repeated `get_attestation()` calls reuse a still-valid token instead of
/// re-issuing on every call, per spec §4.7 ("caches the returned token and
/// its expiry").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationToken {
    pub token: String,
    pub evidence: String,
    pub issued_at: SystemTime,
    pub expiry: SystemTime,
}

impl AttestationToken {
    /// Validity predicate, spec §3: "token present AND expiry in the future".
    /// The issuer/enclave-identity half of the predicate is enforced
    /// separately by [`Provider::verify_attestation`](crate::enclave::Provider::verify_attestation).
    pub fn is_fresh(&self) -> bool {
        self.expiry > SystemTime::now()
    }
}

/// Enclave identity, lifecycle, and resource bookkeeping, spec §3 "Enclave
/// state". Distinct from [`EnclaveLifecycle`], which is just the state-machine
/// value this struct carries alongside timestamps and the attestation cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveState {
    pub identifier: String,
    pub lifecycle: EnclaveLifecycle,
    pub created_at: SystemTime,
    pub last_active: SystemTime,
    pub cached_attestation: Option<AttestationToken>,
    pub current_memory_bytes: usize,
    pub memory_ceiling_bytes: usize,
}

/// Export document produced by `export_secrets` / consumed by `import_secrets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretExport {
    pub principal: PrincipalId,
    pub secrets: HashMap<String, String>,
    /// SHA-256 of the canonical JSON of `secrets`, for tamper detection on import.
    pub content_hash: String,
}
