//! Engine configuration loaded from environment variables.
//!
//! Mirrors the teacher's `worker::config::Config::from_env` shape: required
//! fields `.context(...)`-wrapped, optional fields with documented defaults,
//! a `validate()` pass run once at startup.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Enclave,
    Simulation,
}

/// Engine configuration — the only recognised knobs, spec §6.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: ProviderKind,

    // Sandbox resource ceilings (spec §5)
    pub js_memory_limit_mib: u32,
    pub execution_timeout_seconds: u64,
    pub max_cpu_work_units: u64,
    pub log_buffer_max_lines: usize,
    pub log_buffer_max_bytes: usize,

    // Attestation
    pub attestation_url: Option<String>,
    pub attestation_audience: Option<String>,
    pub expected_code_measurement: Option<String>,
    pub expected_signer_measurement: Option<String>,
    /// Master-key material the simulation/enclave master key is derived from.
    pub master_key_material: String,

    // Fetch policy
    pub fetch_allowed_host_suffixes: Vec<String>,
    pub fetch_sensitive_header_hosts: Vec<String>,
    pub fetch_max_calls_per_host_per_minute: u32,

    // Secret store
    pub secret_key_rotation_interval: Duration,
    pub audit_log_capacity: usize,
    pub max_secrets_per_principal: usize,
    pub max_secret_value_bytes: usize,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `MASTER_KEY_MATERIAL`: seed material the master key is derived from
    ///   (in `enclave` mode this stands in for a real sealing key).
    ///
    /// Optional (with defaults):
    /// - `TEE_PROVIDER` (`enclave` | `simulation`, default `simulation`)
    /// - `JS_MEMORY_LIMIT_MIB` (default 128)
    /// - `EXECUTION_TIMEOUT_SECONDS` (default 30)
    /// - `MAX_CPU_WORK_UNITS` (default 10_000_000)
    /// - `LOG_BUFFER_MAX_LINES` (default 200)
    /// - `LOG_BUFFER_MAX_BYTES` (default 65536)
    /// - `ATTESTATION_URL`, `ATTESTATION_AUDIENCE`
    /// - `EXPECTED_CODE_MEASUREMENT`, `EXPECTED_SIGNER_MEASUREMENT`
    /// - `FETCH_ALLOWED_HOST_SUFFIXES` (comma separated, default empty = deny all)
    /// - `FETCH_SENSITIVE_HEADER_HOSTS` (comma separated, default empty)
    /// - `FETCH_MAX_CALLS_PER_HOST_PER_MINUTE` (default 60)
    /// - `SECRET_KEY_ROTATION_INTERVAL_SECONDS` (default 2_592_000 = 30 days)
    /// - `AUDIT_LOG_CAPACITY` (default 10_000)
    /// - `MAX_SECRETS_PER_PRINCIPAL` (default 200)
    /// - `MAX_SECRET_VALUE_BYTES` (default 65536)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let master_key_material = env::var("MASTER_KEY_MATERIAL")
            .context("MASTER_KEY_MATERIAL environment variable is required")?;

        let provider = match env::var("TEE_PROVIDER")
            .unwrap_or_else(|_| "simulation".to_string())
            .as_str()
        {
            "enclave" => ProviderKind::Enclave,
            "simulation" => ProviderKind::Simulation,
            other => anyhow::bail!("Invalid TEE_PROVIDER: {other} (expected enclave|simulation)"),
        };

        let js_memory_limit_mib = env_parse("JS_MEMORY_LIMIT_MIB", 128)?;
        let execution_timeout_seconds = env_parse("EXECUTION_TIMEOUT_SECONDS", 30)?;
        let max_cpu_work_units = env_parse("MAX_CPU_WORK_UNITS", 10_000_000)?;
        let log_buffer_max_lines = env_parse("LOG_BUFFER_MAX_LINES", 200)?;
        let log_buffer_max_bytes = env_parse("LOG_BUFFER_MAX_BYTES", 65_536)?;

        let attestation_url = env::var("ATTESTATION_URL").ok();
        let attestation_audience = env::var("ATTESTATION_AUDIENCE").ok();
        let expected_code_measurement = env::var("EXPECTED_CODE_MEASUREMENT").ok();
        let expected_signer_measurement = env::var("EXPECTED_SIGNER_MEASUREMENT").ok();

        let fetch_allowed_host_suffixes = env::var("FETCH_ALLOWED_HOST_SUFFIXES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let fetch_sensitive_header_hosts = env::var("FETCH_SENSITIVE_HEADER_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let fetch_max_calls_per_host_per_minute =
            env_parse("FETCH_MAX_CALLS_PER_HOST_PER_MINUTE", 60)?;

        let secret_key_rotation_interval = Duration::from_secs(env_parse(
            "SECRET_KEY_ROTATION_INTERVAL_SECONDS",
            2_592_000,
        )?);
        let audit_log_capacity = env_parse("AUDIT_LOG_CAPACITY", 10_000)?;
        let max_secrets_per_principal = env_parse("MAX_SECRETS_PER_PRINCIPAL", 200)?;
        let max_secret_value_bytes = env_parse("MAX_SECRET_VALUE_BYTES", 65_536)?;

        Ok(Self {
            provider,
            js_memory_limit_mib,
            execution_timeout_seconds,
            max_cpu_work_units,
            log_buffer_max_lines,
            log_buffer_max_bytes,
            attestation_url,
            attestation_audience,
            expected_code_measurement,
            expected_signer_measurement,
            master_key_material,
            fetch_allowed_host_suffixes,
            fetch_sensitive_header_hosts,
            fetch_max_calls_per_host_per_minute,
            secret_key_rotation_interval,
            audit_log_capacity,
            max_secrets_per_principal,
            max_secret_value_bytes,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.js_memory_limit_mib == 0 {
            anyhow::bail!("js_memory_limit_mib must be greater than zero");
        }
        if self.execution_timeout_seconds == 0 || self.execution_timeout_seconds > 300 {
            anyhow::bail!("execution_timeout_seconds must be between 1 and 300");
        }
        if self.master_key_material.len() < 16 {
            anyhow::bail!("MASTER_KEY_MATERIAL must be at least 16 bytes");
        }
        if self.provider == ProviderKind::Enclave
            && (self.expected_code_measurement.is_none()
                || self.expected_signer_measurement.is_none())
        {
            anyhow::bail!(
                "enclave provider requires EXPECTED_CODE_MEASUREMENT and EXPECTED_SIGNER_MEASUREMENT"
            );
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
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
            master_key_material: "0123456789abcdef".to_string(),
            fetch_allowed_host_suffixes: vec!["example.com".to_string()],
            fetch_sensitive_header_hosts: vec![],
            fetch_max_calls_per_host_per_minute: 60,
            secret_key_rotation_interval: Duration::from_secs(2_592_000),
            audit_log_capacity: 10_000,
            max_secrets_per_principal: 200,
            max_secret_value_bytes: 65_536,
        }
    }

    #[test]
    fn validates_happy_path() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_short_master_key() {
        let mut cfg = base_config();
        cfg.master_key_material = "short".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn enclave_requires_measurements() {
        let mut cfg = base_config();
        cfg.provider = ProviderKind::Enclave;
        assert!(cfg.validate().is_err());
        cfg.expected_code_measurement = Some("abc".to_string());
        cfg.expected_signer_measurement = Some("def".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_timeout() {
        let mut cfg = base_config();
        cfg.execution_timeout_seconds = 0;
        assert!(cfg.validate().is_err());
        cfg.execution_timeout_seconds = 1000;
        assert!(cfg.validate().is_err());
    }
}
