//! C8 Engine Facade — spec §4.8. The single entry point external callers
//! (the `cli` crate, or any future host process) use; every other module in
//! this crate is reached only through here.

use crate::bridge::fetch::FetchPolicy;
use crate::bridge::neo::ChainGateway;
use crate::config::EngineConfig;
use crate::enclave::attestation::AttestationClaims;
use crate::enclave::{self, EnclaveProvider, Provider};
use crate::error::{EngineError, EngineResult};
use jsonwebtoken::{DecodingKey, EncodingKey};
use crate::sandbox::{self, SandboxEnv, SandboxRequest};
use crate::secret_store::SecretStore;
use crate::types::{AuditEntry, ExecutionRecord, FunctionDescriptor, SecretExport, SecretMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct Engine {
    config: EngineConfig,
    secret_store: Arc<SecretStore>,
    provider: Box<dyn Provider>,
    chain_gateway: ChainGateway,
}

impl Engine {
    /// Build an engine for `config.provider`. The `simulation` provider
    /// fabricates its own signing key material and can always be built here;
    /// `enclave` needs real key material this constructor cannot invent, so
    /// it returns `Internal` directing the caller to
    /// [`Engine::with_enclave_provider`] instead (spec §9's "Provider" is a
    /// trait with two implementations — only one of which is self-contained).
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let provider: Box<dyn Provider> = match config.provider {
            crate::config::ProviderKind::Simulation => enclave::build_simulation(&config),
            crate::config::ProviderKind::Enclave => {
                return Err(EngineError::Internal(
                    "enclave provider requires key material supplied via Engine::with_enclave_provider".into(),
                ))
            }
        };

        Self::with_provider(config, provider)
    }

    /// Build an engine in `enclave` mode with the real signing/verification
    /// key pair the deployment's key management service holds. Kept separate
    /// from `new` because that key material cannot be fabricated the way the
    /// simulation provider fabricates its own.
    pub fn with_enclave_provider(
        config: EngineConfig,
        encoding_key: EncodingKey,
        decoding_key: DecodingKey,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if config.provider != crate::config::ProviderKind::Enclave {
            return Err(EngineError::Internal(
                "with_enclave_provider requires config.provider == ProviderKind::Enclave".into(),
            ));
        }

        let provider: Box<dyn Provider> =
            Box::new(EnclaveProvider::new(&config, encoding_key, decoding_key)?);

        Self::with_provider(config, provider)
    }

    fn with_provider(config: EngineConfig, provider: Box<dyn Provider>) -> EngineResult<Self> {
        let secret_store = Arc::new(SecretStore::new(&config));

        let rpc_url = config
            .attestation_url
            .clone()
            .unwrap_or_else(|| "https://rpc.neo.org:443".to_string());
        let chain_gateway = ChainGateway::new(rpc_url, config.fetch_max_calls_per_host_per_minute);

        Ok(Self {
            config,
            secret_store,
            provider,
            chain_gateway,
        })
    }

    fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            allowed_host_suffixes: self.config.fetch_allowed_host_suffixes.clone(),
            sensitive_header_hosts: self.config.fetch_sensitive_header_hosts.clone(),
            max_calls_per_host_per_minute: self.config.fetch_max_calls_per_host_per_minute,
        }
    }

    /// Execute a function end to end, spec §4.5 + §4.8. Runs off the async
    /// executor via `spawn_blocking` since the JS engine itself is
    /// synchronous; a deadline beyond `execution_timeout_seconds` would mean
    /// the interrupt controller failed to fire, so the outer timeout is a
    /// backstop rather than the primary enforcement mechanism.
    pub async fn execute_function(
        &self,
        function: FunctionDescriptor,
        execution_id: String,
        input: serde_json::Value,
        secret_overrides: HashMap<String, String>,
    ) -> ExecutionRecord {
        if !self.provider.secret_ops_allowed() && !function.allowed_secrets.is_empty() {
            return denied_record(&function, &execution_id, "enclave is not in a running state");
        }

        let env = SandboxEnv {
            secret_store: self.secret_store.clone(),
            fetch_policy: self.fetch_policy(),
            chain_gateway: self.chain_gateway.clone(),
            memory_limit_bytes: self.config.js_memory_limit_mib as usize * 1024 * 1024,
            timeout: Duration::from_secs(self.config.execution_timeout_seconds),
            work_ceiling: self.config.max_cpu_work_units,
            log_buffer_max_lines: self.config.log_buffer_max_lines,
            log_buffer_max_bytes: self.config.log_buffer_max_bytes,
        };

        let req = SandboxRequest {
            function: function.clone(),
            execution_id: execution_id.clone(),
            input,
            secret_overrides,
        };

        let backstop = Duration::from_secs(self.config.execution_timeout_seconds + 5);
        let join = tokio::task::spawn_blocking(move || sandbox::run(&env, req));

        match tokio::time::timeout(backstop, join).await {
            Ok(Ok(record)) => record,
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "sandbox task panicked");
                denied_record(&function, &execution_id, "execution task failed unexpectedly")
            }
            Err(_) => {
                tracing::error!("sandbox exceeded backstop timeout, interrupt controller likely failed to fire");
                denied_record(&function, &execution_id, "execution exceeded backstop timeout")
            }
        }
    }

    pub fn store_secret(&self, principal: &str, name: &str, value: &str, tags: Vec<String>) -> EngineResult<()> {
        self.require_secret_ops()?;
        self.secret_store.set(principal, name, value, tags)
    }

    pub fn get_secret(&self, principal: &str, name: &str) -> EngineResult<String> {
        self.require_secret_ops()?;
        self.secret_store.get(principal, name)
    }

    pub fn delete_secret(&self, principal: &str, name: &str) -> EngineResult<()> {
        self.require_secret_ops()?;
        self.secret_store.delete(principal, name)
    }

    pub fn list_secrets(&self, principal: &str) -> EngineResult<Vec<String>> {
        self.require_secret_ops()?;
        Ok(self.secret_store.list(principal))
    }

    pub fn get_secret_metadata(&self, principal: &str, name: &str) -> EngineResult<SecretMetadata> {
        self.require_secret_ops()?;
        self.secret_store.get_metadata(principal, name)
    }

    pub fn update_secret_tags(&self, principal: &str, name: &str, tags: Vec<String>) -> EngineResult<()> {
        self.require_secret_ops()?;
        self.secret_store.update_tags(principal, name, tags)
    }

    pub fn export_secrets(&self, principal: &str) -> EngineResult<SecretExport> {
        self.require_secret_ops()?;
        self.secret_store.export_secrets(principal)
    }

    pub fn import_secrets(&self, principal: &str, export: &SecretExport) -> EngineResult<usize> {
        self.require_secret_ops()?;
        self.secret_store.import_secrets(principal, export)
    }

    pub fn audit_log(&self, principal: &str) -> EngineResult<Vec<AuditEntry>> {
        self.require_secret_ops()?;
        Ok(self.secret_store.audit_log(principal))
    }

    pub fn get_attestation(&self) -> EngineResult<String> {
        self.provider.get_attestation()
    }

    pub fn verify_attestation(&self, token: &str) -> EngineResult<AttestationClaims> {
        self.provider.verify_attestation(token)
    }

    pub fn enclave_state(&self) -> crate::types::EnclaveState {
        self.provider.state()
    }

    fn require_secret_ops(&self) -> EngineResult<()> {
        if self.provider.secret_ops_allowed() {
            Ok(())
        } else {
            Err(EngineError::CapabilityDenied(
                "secret store operations require a running, attested enclave".into(),
            ))
        }
    }
}

fn denied_record(function: &FunctionDescriptor, execution_id: &str, message: &str) -> ExecutionRecord {
    let now = std::time::SystemTime::now();
    ExecutionRecord {
        execution_id: execution_id.to_string(),
        function_id: function.function_id.clone(),
        started_at: now,
        ended_at: now,
        status: crate::types::TerminalStatus::CapabilityDenied,
        result: None,
        error: Some(crate::types::ExecutionError {
            tag: EngineError::CapabilityDenied(String::new()).tag().to_string(),
            message: message.to_string(),
        }),
        logs: vec![],
        peak_memory_bytes: 0,
        wall_time: Duration::from_secs(0),
    }
}
