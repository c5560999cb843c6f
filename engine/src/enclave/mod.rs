//! C7 Enclave Provider — spec §4.7.
//!
//! `Simulation` runs the same code paths as `Enclave` but self-signs its
//! attestation tokens with an ephemeral ES256 key pair instead of talking to
//! a real measurement/quoting service, the same split the teacher draws
//! between its in-process worker and the remote `keystore-worker` it calls
//! out to for real TDX quotes. ES256 (rather than an HMAC secret) keeps the
//! simulation path inside spec §4.7's `{RS256, ES256}` allowed-algorithm set.

pub mod attestation;

use crate::config::{EngineConfig, ProviderKind};
use crate::error::{EngineError, EngineResult};
use crate::types::{AttestationToken, EnclaveLifecycle, EnclaveState};
use attestation::AttestationClaims;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p256::ecdsa::SigningKey;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

fn lifecycle_from_u8(v: u8) -> EnclaveLifecycle {
    match v {
        0 => EnclaveLifecycle::Initializing,
        1 => EnclaveLifecycle::Running,
        2 => EnclaveLifecycle::Error,
        _ => EnclaveLifecycle::Closed,
    }
}

/// Shared lifecycle bookkeeping both provider kinds use identically.
struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    fn new() -> Self {
        Self(AtomicU8::new(0))
    }
    fn get(&self) -> EnclaveLifecycle {
        lifecycle_from_u8(self.0.load(Ordering::Acquire))
    }
    fn set(&self, state: EnclaveLifecycle) {
        let v = match state {
            EnclaveLifecycle::Initializing => 0,
            EnclaveLifecycle::Running => 1,
            EnclaveLifecycle::Error => 2,
            EnclaveLifecycle::Closed => 3,
        };
        self.0.store(v, Ordering::Release);
    }
}

/// Enclave identity and attestation surface, spec §4.7.
pub trait Provider: Send + Sync {
    fn lifecycle(&self) -> EnclaveLifecycle;

    /// Issue a fresh attestation token for this enclave instance, or return
    /// the cached one if it's still within its validity window.
    fn get_attestation(&self) -> EngineResult<String>;

    /// Verify a token presented by a caller, checking its measurement claims
    /// against the values this engine was configured to trust.
    fn verify_attestation(&self, token: &str) -> EngineResult<AttestationClaims>;

    /// Whether secret-store operations are currently permitted. Per spec
    /// §4.7, secret access is gated on the enclave being `Running` with a
    /// valid self-attestation, never on an externally presented token.
    fn secret_ops_allowed(&self) -> bool {
        self.lifecycle() == EnclaveLifecycle::Running
    }

    /// Snapshot of identity, lifecycle, and attestation cache state, spec §3
    /// "Enclave state".
    fn state(&self) -> EnclaveState;

    fn mark_error(&self);
    fn close(&self);
}

const TOKEN_VALIDITY_SECONDS: usize = 300;

/// Caches the last-issued attestation token so repeated `get_attestation()`
/// calls reuse it while still fresh instead of re-issuing (and re-signing)
/// on every call, spec §4.7 "caches the returned token and its expiry".
struct AttestationCache(Mutex<Option<AttestationToken>>);

impl AttestationCache {
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn get_or_issue(
        &self,
        issue: impl FnOnce() -> EngineResult<(String, String)>,
        validity_seconds: u64,
    ) -> EngineResult<String> {
        let mut slot = self.0.lock().unwrap();
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.token.clone());
            }
        }
        let (token, evidence) = issue()?;
        let issued_at = SystemTime::now();
        let expiry = issued_at + std::time::Duration::from_secs(validity_seconds);
        let fresh = token.clone();
        *slot = Some(AttestationToken { token, evidence, issued_at, expiry });
        Ok(fresh)
    }

    fn snapshot(&self) -> Option<AttestationToken> {
        self.0.lock().unwrap().clone()
    }
}

pub struct SimulationProvider {
    lifecycle: LifecycleCell,
    enclave_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    audience: String,
    code_measurement: String,
    signer_measurement: String,
    memory_ceiling_bytes: usize,
    created_at: SystemTime,
    last_active: Mutex<SystemTime>,
    attestation_cache: AttestationCache,
}

impl SimulationProvider {
    pub fn new(config: &EngineConfig) -> Self {
        let lifecycle = LifecycleCell::new();
        lifecycle.set(EnclaveLifecycle::Running);
        let now = SystemTime::now();
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let private_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("p256 key always encodes to pkcs8 pem");
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("p256 public key always encodes to pem");
        let encoding_key =
            EncodingKey::from_ec_pem(private_pem.as_bytes()).expect("freshly generated ES256 key is well-formed");
        let decoding_key =
            DecodingKey::from_ec_pem(public_pem.as_bytes()).expect("freshly generated ES256 key is well-formed");
        Self {
            lifecycle,
            enclave_id: format!("sim-{}", uuid::Uuid::new_v4()),
            encoding_key,
            decoding_key,
            audience: config
                .attestation_audience
                .clone()
                .unwrap_or_else(|| "tee-engine-clients".to_string()),
            code_measurement: config
                .expected_code_measurement
                .clone()
                .unwrap_or_else(|| "simulation-code-measurement".to_string()),
            signer_measurement: config
                .expected_signer_measurement
                .clone()
                .unwrap_or_else(|| "simulation-signer-measurement".to_string()),
            memory_ceiling_bytes: config.js_memory_limit_mib as usize * 1024 * 1024,
            created_at: now,
            last_active: Mutex::new(now),
            attestation_cache: AttestationCache::new(),
        }
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = SystemTime::now();
    }
}

impl Provider for SimulationProvider {
    fn lifecycle(&self) -> EnclaveLifecycle {
        self.lifecycle.get()
    }

    fn get_attestation(&self) -> EngineResult<String> {
        self.touch();
        self.attestation_cache.get_or_issue(
            || {
                let token = attestation::issue(
                    &self.encoding_key,
                    Algorithm::ES256,
                    &self.enclave_id,
                    &self.audience,
                    &self.code_measurement,
                    &self.signer_measurement,
                    TOKEN_VALIDITY_SECONDS,
                )?;
                Ok((token, format!("{}:{}", self.code_measurement, self.signer_measurement)))
            },
            TOKEN_VALIDITY_SECONDS as u64,
        )
    }

    fn verify_attestation(&self, token: &str) -> EngineResult<AttestationClaims> {
        self.touch();
        attestation::verify(
            token,
            &self.decoding_key,
            Algorithm::ES256,
            &self.audience,
            &self.code_measurement,
            &self.signer_measurement,
        )
    }

    fn state(&self) -> EnclaveState {
        EnclaveState {
            identifier: self.enclave_id.clone(),
            lifecycle: self.lifecycle(),
            created_at: self.created_at,
            last_active: *self.last_active.lock().unwrap(),
            cached_attestation: self.attestation_cache.snapshot(),
            current_memory_bytes: 0,
            memory_ceiling_bytes: self.memory_ceiling_bytes,
        }
    }

    fn mark_error(&self) {
        self.lifecycle.set(EnclaveLifecycle::Error);
    }

    fn close(&self) {
        self.lifecycle.set(EnclaveLifecycle::Closed);
    }
}

/// Real-enclave provider: signs with an RSA/EC key material the TEE's key
/// management service would actually hold, and verifies callers' tokens
/// against a separately distributed public key rather than the signing
/// secret. Spec §9 leaves real quote retrieval as a future `attestation_url`
/// integration; this provider validates the config shape that integration
/// will need (`attestation_url`, `attestation_audience`, both expected
/// measurements) without performing the network call itself.
pub struct EnclaveProvider {
    lifecycle: LifecycleCell,
    enclave_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    audience: String,
    code_measurement: String,
    signer_measurement: String,
    memory_ceiling_bytes: usize,
    created_at: SystemTime,
    last_active: Mutex<SystemTime>,
    attestation_cache: AttestationCache,
}

impl EnclaveProvider {
    pub fn new(config: &EngineConfig, encoding_key: EncodingKey, decoding_key: DecodingKey) -> EngineResult<Self> {
        let code_measurement = config
            .expected_code_measurement
            .clone()
            .ok_or_else(|| EngineError::Internal("enclave provider requires expected_code_measurement".into()))?;
        let signer_measurement = config
            .expected_signer_measurement
            .clone()
            .ok_or_else(|| EngineError::Internal("enclave provider requires expected_signer_measurement".into()))?;
        let audience = config
            .attestation_audience
            .clone()
            .ok_or_else(|| EngineError::Internal("enclave provider requires attestation_audience".into()))?;

        let lifecycle = LifecycleCell::new();
        lifecycle.set(EnclaveLifecycle::Running);
        let now = SystemTime::now();

        Ok(Self {
            lifecycle,
            enclave_id: format!("enclave-{}", uuid::Uuid::new_v4()),
            encoding_key,
            decoding_key,
            algorithm: Algorithm::RS256,
            audience,
            code_measurement,
            signer_measurement,
            memory_ceiling_bytes: config.js_memory_limit_mib as usize * 1024 * 1024,
            created_at: now,
            last_active: Mutex::new(now),
            attestation_cache: AttestationCache::new(),
        })
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = SystemTime::now();
    }
}

impl Provider for EnclaveProvider {
    fn lifecycle(&self) -> EnclaveLifecycle {
        self.lifecycle.get()
    }

    fn get_attestation(&self) -> EngineResult<String> {
        self.touch();
        self.attestation_cache.get_or_issue(
            || {
                let token = attestation::issue(
                    &self.encoding_key,
                    self.algorithm,
                    &self.enclave_id,
                    &self.audience,
                    &self.code_measurement,
                    &self.signer_measurement,
                    TOKEN_VALIDITY_SECONDS,
                )?;
                Ok((token, format!("{}:{}", self.code_measurement, self.signer_measurement)))
            },
            TOKEN_VALIDITY_SECONDS as u64,
        )
    }

    fn verify_attestation(&self, token: &str) -> EngineResult<AttestationClaims> {
        self.touch();
        attestation::verify(
            token,
            &self.decoding_key,
            self.algorithm,
            &self.audience,
            &self.code_measurement,
            &self.signer_measurement,
        )
    }

    fn state(&self) -> EnclaveState {
        EnclaveState {
            identifier: self.enclave_id.clone(),
            lifecycle: self.lifecycle(),
            created_at: self.created_at,
            last_active: *self.last_active.lock().unwrap(),
            cached_attestation: self.attestation_cache.snapshot(),
            current_memory_bytes: 0,
            memory_ceiling_bytes: self.memory_ceiling_bytes,
        }
    }

    fn mark_error(&self) {
        self.lifecycle.set(EnclaveLifecycle::Error);
    }

    fn close(&self) {
        self.lifecycle.set(EnclaveLifecycle::Closed);
    }
}

/// Build the provider named by `config.provider`. The enclave variant needs
/// real key material the simulation path fabricates for itself, so callers
/// that chose `enclave` must supply it out of band (spec leaves exactly how
/// as an open integration point, see `ProviderKind::Enclave` in `config.rs`).
pub fn build_simulation(config: &EngineConfig) -> Box<dyn Provider> {
    debug_assert_eq!(config.provider, ProviderKind::Simulation);
    Box::new(SimulationProvider::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            provider: ProviderKind::Simulation,
            js_memory_limit_mib: 128,
            execution_timeout_seconds: 30,
            max_cpu_work_units: 10_000_000,
            log_buffer_max_lines: 200,
            log_buffer_max_bytes: 65_536,
            attestation_url: None,
            attestation_audience: None,
            expected_code_measurement: None,
            expected_signer_measurement: None,
            master_key_material: "0123456789abcdef0123456789abcdef".to_string(),
            fetch_allowed_host_suffixes: vec![],
            fetch_sensitive_header_hosts: vec![],
            fetch_max_calls_per_host_per_minute: 60,
            secret_key_rotation_interval: Duration::from_secs(2_592_000),
            audit_log_capacity: 100,
            max_secrets_per_principal: 200,
            max_secret_value_bytes: 65_536,
        }
    }

    #[test]
    fn simulation_starts_running_and_self_attests() {
        let provider = SimulationProvider::new(&config());
        assert_eq!(provider.lifecycle(), EnclaveLifecycle::Running);
        assert!(provider.secret_ops_allowed());

        let token = provider.get_attestation().unwrap();
        let claims = provider.verify_attestation(&token).unwrap();
        assert_eq!(claims.iss, attestation::ISSUER);
    }

    #[test]
    fn mark_error_blocks_secret_ops() {
        let provider = SimulationProvider::new(&config());
        provider.mark_error();
        assert!(!provider.secret_ops_allowed());
    }

    #[test]
    fn close_is_terminal() {
        let provider = SimulationProvider::new(&config());
        provider.close();
        assert_eq!(provider.lifecycle(), EnclaveLifecycle::Closed);
        assert!(!provider.secret_ops_allowed());
    }

    #[test]
    fn repeated_get_attestation_reuses_the_cached_token() {
        let provider = SimulationProvider::new(&config());
        let first = provider.get_attestation().unwrap();
        let second = provider.get_attestation().unwrap();
        assert_eq!(first, second, "a still-fresh token must be reused rather than re-issued");
    }

    #[test]
    fn state_reflects_identity_lifecycle_and_attestation_cache() {
        let provider = SimulationProvider::new(&config());
        let before = provider.state();
        assert_eq!(before.cached_attestation, None);

        let token = provider.get_attestation().unwrap();
        let after = provider.state();
        assert_eq!(after.identifier, before.identifier);
        assert_eq!(after.lifecycle, EnclaveLifecycle::Running);
        assert_eq!(after.cached_attestation.unwrap().token, token);
    }
}
