//! C5 JS Execution Sandbox — spec §4.5.
//!
//! Orchestrates C1 (memory), C2 (interrupt), C3 (isolation) and C4
//! (capability bridge) around a single `rquickjs` context. One
//! `SandboxRequest` is consumed by exactly one call to [`run`] — there is no
//! context reuse across executions, the same one-shot-per-call shape as the
//! teacher's `executor::run_function`.

use crate::bridge::fetch::FetchPolicy;
use crate::bridge::neo::ChainGateway;
use crate::bridge::secrets::SecretsBinding;
use crate::bridge::{crypto, fetch, neo, secrets, validate};
use crate::error::EngineError;
use crate::interrupt::InterruptController;
use crate::isolation::{self, ExecutionIdentity};
use crate::memory::MemoryAccountant;
use crate::secret_store::SecretStore;
use crate::types::{ExecutionError, ExecutionRecord, FunctionDescriptor, TerminalStatus};
use rquickjs::{Context, Runtime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

pub struct SandboxRequest {
    pub function: FunctionDescriptor,
    pub execution_id: String,
    pub input: serde_json::Value,
    pub secret_overrides: HashMap<String, String>,
}

/// Everything a sandbox run needs that does not change per-request.
pub struct SandboxEnv {
    pub secret_store: Arc<SecretStore>,
    pub fetch_policy: FetchPolicy,
    pub chain_gateway: ChainGateway,
    pub memory_limit_bytes: usize,
    pub timeout: Duration,
    pub work_ceiling: u64,
    pub log_buffer_max_lines: usize,
    pub log_buffer_max_bytes: usize,
}

struct LogBuffer {
    max_lines: usize,
    max_bytes: usize,
    bytes: usize,
    lines: Vec<String>,
}

impl LogBuffer {
    fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            max_lines,
            max_bytes,
            bytes: 0,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push(line);
        while self.lines.len() > self.max_lines || self.bytes > self.max_bytes {
            if let Some(dropped) = self.lines.first() {
                self.bytes = self.bytes.saturating_sub(dropped.len());
            }
            if self.lines.is_empty() {
                break;
            }
            self.lines.remove(0);
        }
    }
}

/// Run one function to completion. Synchronous and blocking by design — the
/// facade calls this inside `tokio::spawn_blocking`.
pub fn run(env: &SandboxEnv, req: SandboxRequest) -> ExecutionRecord {
    let started_at = SystemTime::now();
    let wall_clock_start = Instant::now();

    if let Err(e) = validate::validate_shape(&req.input, 0) {
        // `validate_shape` only ever returns `InvalidInput`, which
        // `status_for`'s catch-all arm maps to `Error` — spec §4.5 step 4:
        // "On failure, return error with tag invalid_input".
        return terminal(
            &req,
            started_at,
            wall_clock_start,
            TerminalStatus::Error,
            None,
            Some(e),
            vec![],
            0,
        );
    }

    let memory = MemoryAccountant::new(env.memory_limit_bytes);
    let interrupt = InterruptController::start(env.timeout, env.work_ceiling);
    let logs = Arc::new(Mutex::new(LogBuffer::new(
        env.log_buffer_max_lines,
        env.log_buffer_max_bytes,
    )));

    let outcome = run_context(env, &req, &memory, &interrupt, logs.clone());

    interrupt.stop();
    let collected_logs = logs.lock().unwrap().lines.clone();
    let peak = memory.peak();

    match outcome {
        Ok(result) => terminal(
            &req,
            started_at,
            wall_clock_start,
            TerminalStatus::Success,
            Some(result),
            None,
            collected_logs,
            peak,
        ),
        Err(e) => {
            let status = status_for(&e, &interrupt);
            terminal(
                &req,
                started_at,
                wall_clock_start,
                status,
                None,
                Some(e),
                collected_logs,
                peak,
            )
        }
    }
}

fn status_for(e: &EngineError, interrupt: &InterruptController) -> TerminalStatus {
    match e {
        EngineError::Timeout { .. } => TerminalStatus::Timeout,
        EngineError::MemoryExceeded { .. } => TerminalStatus::MemoryExceeded,
        EngineError::CapabilityDenied(_) => TerminalStatus::CapabilityDenied,
        _ if interrupt.is_poisoned() => TerminalStatus::Timeout,
        _ => TerminalStatus::Error,
    }
}

fn run_context(
    env: &SandboxEnv,
    req: &SandboxRequest,
    memory: &MemoryAccountant,
    interrupt: &InterruptController,
    logs: Arc<Mutex<LogBuffer>>,
) -> Result<serde_json::Value, EngineError> {
    let runtime = Runtime::new().map_err(|e| EngineError::Internal(format!("failed to start js runtime: {e}")))?;
    runtime.set_memory_limit(env.memory_limit_bytes);

    let ctl = interrupt.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || ctl.check())));

    let context = Context::full(&runtime)
        .map_err(|e| EngineError::Internal(format!("failed to build js context: {e}")))?;

    let source = req.function.source.clone();
    let input = req.input.clone();
    let execution_id = req.execution_id.clone();
    let function_id = req.function.function_id.clone();
    let principal_id = req.function.principal_id.clone();
    let allowed_secrets = req.function.allowed_secrets.clone();
    let overrides = req.secret_overrides.clone();
    let secret_store = env.secret_store.clone();
    let fetch_policy = env.fetch_policy.clone();
    let chain_gateway = env.chain_gateway.clone();
    let memory = memory.clone();

    context.with(|ctx| -> Result<serde_json::Value, EngineError> {
        isolation::setup(
            &ctx,
            &ExecutionIdentity {
                function_id: function_id.clone(),
                principal_id: principal_id.clone(),
                execution_id: execution_id.clone(),
            },
        )?;

        let secrets_binding = SecretsBinding {
            store: secret_store,
            principal_id: principal_id.clone(),
            allowed_secrets,
            overrides,
        };
        secrets::install(&ctx, secrets_binding.clone())?;
        fetch::install(&ctx, fetch_policy)?;
        crypto::install(&ctx)?;
        neo::install(&ctx, chain_gateway, secrets_binding)?;
        install_console(&ctx, logs, memory.clone())?;

        // Every C4 binding is installed above; only now can the global
        // object be made non-extensible without breaking those installs.
        isolation::lock_globals(&ctx)?;

        let input_json = serde_json::to_string(&input)
            .map_err(|e| EngineError::Internal(format!("failed to serialize input: {e}")))?;
        memory.allocate(input_json.len())?;
        let missing_main = serde_json::to_string(MISSING_MAIN_MARKER).unwrap();

        // Wrapping the user source *inside* the IIFE (rather than appending
        // an IIFE after it) keeps `main` a binding local to this function
        // scope instead of a new property on the frozen global object, spec
        // §4.5 step 5's "strict IIFE that requires a main function".
        let wrapped = format!(
            "\"use strict\";\n(function () {{\n{source}\n  if (typeof main !== \"function\") {{ throw new Error({missing_main}); }}\n  const input = {input_json};\n  const result = main(input);\n  return JSON.stringify(result === undefined ? null : result);\n}})()"
        );

        let raw: String = ctx.eval(wrapped).map_err(|e| classify_js_error(&e, interrupt))?;
        memory.allocate(raw.len())?;

        serde_json::from_str(&raw)
            .map_err(|e| EngineError::Internal(format!("function result was not valid json: {e}")))
    })
}

const MISSING_MAIN_MARKER: &str = "script does not declare a main(input) function";

fn classify_js_error(err: &rquickjs::Error, interrupt: &InterruptController) -> EngineError {
    if interrupt.is_poisoned() {
        return interrupt.as_engine_error();
    }
    let message = err.to_string();
    if message.contains(MISSING_MAIN_MARKER) || message.contains("SyntaxError") {
        return EngineError::CompileFailed(message);
    }
    match err {
        rquickjs::Error::Exception => EngineError::Internal(format!("uncaught exception: {err}")),
        _ => EngineError::CompileFailed(message),
    }
}

fn install_console(
    ctx: &rquickjs::Ctx<'_>,
    logs: Arc<Mutex<LogBuffer>>,
    memory: MemoryAccountant,
) -> Result<(), EngineError> {
    use rquickjs::{Function, Object};

    let console = Object::new(ctx.clone())
        .map_err(|e| EngineError::Internal(format!("console object: {e}")))?;

    let log_fn = Function::new(ctx.clone(), move |line: String| -> rquickjs::Result<()> {
        let _ = memory.allocate(line.len());
        logs.lock().unwrap().push(line);
        Ok(())
    });

    console
        .set("log", log_fn.clone())
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    console
        .set("error", log_fn.clone())
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    console
        .set("warn", log_fn)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    ctx.globals()
        .set("console", console)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn terminal(
    req: &SandboxRequest,
    started_at: SystemTime,
    wall_clock_start: Instant,
    status: TerminalStatus,
    result: Option<serde_json::Value>,
    error: Option<EngineError>,
    logs: Vec<String>,
    peak_memory_bytes: usize,
) -> ExecutionRecord {
    ExecutionRecord {
        execution_id: req.execution_id.clone(),
        function_id: req.function.function_id.clone(),
        started_at,
        ended_at: SystemTime::now(),
        status,
        result,
        error: error.map(|e| ExecutionError {
            tag: e.tag().to_string(),
            message: e.to_string(),
        }),
        logs,
        peak_memory_bytes,
        wall_time: wall_clock_start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::TriggerKind;
    use std::time::Duration as StdDuration;

    fn test_env() -> (SandboxEnv, Arc<SecretStore>) {
        let config = EngineConfig {
            provider: crate::config::ProviderKind::Simulation,
            js_memory_limit_mib: 64,
            execution_timeout_seconds: 2,
            max_cpu_work_units: 5_000_000,
            log_buffer_max_lines: 50,
            log_buffer_max_bytes: 16_384,
            attestation_url: None,
            attestation_audience: None,
            expected_code_measurement: None,
            expected_signer_measurement: None,
            master_key_material: "0123456789abcdef0123456789abcdef".to_string(),
            fetch_allowed_host_suffixes: vec![],
            fetch_sensitive_header_hosts: vec![],
            fetch_max_calls_per_host_per_minute: 60,
            secret_key_rotation_interval: StdDuration::from_secs(2_592_000),
            audit_log_capacity: 100,
            max_secrets_per_principal: 20,
            max_secret_value_bytes: 65_536,
        };
        let store = Arc::new(SecretStore::new(&config));
        let env = SandboxEnv {
            secret_store: store.clone(),
            fetch_policy: FetchPolicy {
                allowed_host_suffixes: vec![],
                sensitive_header_hosts: vec![],
                max_calls_per_host_per_minute: 60,
            },
            chain_gateway: ChainGateway::new("https://example.invalid/rpc".to_string(), 60),
            memory_limit_bytes: 64 * 1024 * 1024,
            timeout: StdDuration::from_secs(2),
            work_ceiling: 5_000_000,
            log_buffer_max_lines: 50,
            log_buffer_max_bytes: 16_384,
        };
        (env, store)
    }

    fn descriptor(source: &str) -> FunctionDescriptor {
        FunctionDescriptor {
            function_id: "f1".to_string(),
            principal_id: "alice".to_string(),
            source: source.to_string(),
            allowed_secrets: vec![],
            trigger_kind: TriggerKind::Manual,
        }
    }

    #[test]
    fn oversized_input_is_rejected_as_error_not_capability_denied() {
        let (env, _store) = test_env();
        let req = SandboxRequest {
            function: descriptor("function main(input) { return input; }"),
            execution_id: "e0".to_string(),
            input: serde_json::json!({"big": "x".repeat(crate::bridge::validate::MAX_STRING_BYTES + 1)}),
            secret_overrides: HashMap::new(),
        };
        let record = run(&env, req);
        assert_eq!(record.status, TerminalStatus::Error);
        assert_eq!(record.error.unwrap().tag, "invalid_input");
    }

    #[test]
    fn echo_function_succeeds() {
        let (env, _store) = test_env();
        let req = SandboxRequest {
            function: descriptor("function main(input) { return { echoed: input.value }; }"),
            execution_id: "e1".to_string(),
            input: serde_json::json!({"value": 42}),
            secret_overrides: HashMap::new(),
        };
        let record = run(&env, req);
        assert_eq!(record.status, TerminalStatus::Success);
        assert_eq!(record.result.unwrap()["echoed"], 42);
    }

    #[test]
    fn infinite_loop_times_out() {
        let (env, _store) = test_env();
        let req = SandboxRequest {
            function: descriptor("function main(input) { while (true) {} }"),
            execution_id: "e2".to_string(),
            input: serde_json::json!({}),
            secret_overrides: HashMap::new(),
        };
        let record = run(&env, req);
        assert_eq!(record.status, TerminalStatus::Timeout);
    }

    #[test]
    fn forbidden_fetch_host_is_catchable_capability_denied() {
        let (env, _store) = test_env();
        let req = SandboxRequest {
            function: descriptor(
                r#"function main(input) {
                    try {
                        fetch("https://evil.example/");
                        return { blocked: false };
                    } catch (e) {
                        return { blocked: true, tag: e.tag, message: String(e.message) };
                    }
                }"#,
            ),
            execution_id: "e3".to_string(),
            input: serde_json::json!({}),
            secret_overrides: HashMap::new(),
        };
        let record = run(&env, req);
        assert_eq!(record.status, TerminalStatus::Success);
        let result = record.result.unwrap();
        assert_eq!(result["blocked"], true);
        assert_eq!(result["tag"], "capability_denied");
    }

    #[test]
    fn secret_outside_allowlist_is_denied() {
        let (env, store) = test_env();
        store.set("alice", "token", "abc123", vec![]).unwrap();
        let req = SandboxRequest {
            function: descriptor(
                r#"function main(input) {
                    try {
                        secrets.get("token");
                        return { denied: false };
                    } catch (e) {
                        return { denied: true };
                    }
                }"#,
            ),
            execution_id: "e4".to_string(),
            input: serde_json::json!({}),
            secret_overrides: HashMap::new(),
        };
        let record = run(&env, req);
        assert_eq!(record.status, TerminalStatus::Success);
        assert_eq!(record.result.unwrap()["denied"], true);
    }

    #[test]
    fn secret_overrides_shadow_the_store_without_persisting() {
        let (env, store) = test_env();
        store.set("alice", "token", "stored-value", vec![]).unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("token".to_string(), "override-value".to_string());

        let mut descriptor_with_access = descriptor(
            r#"function main(input) { return { value: secrets.get("token") }; }"#,
        );
        descriptor_with_access.allowed_secrets = vec!["token".to_string()];

        let req = SandboxRequest {
            function: descriptor_with_access,
            execution_id: "e5".to_string(),
            input: serde_json::json!({}),
            secret_overrides: overrides,
        };
        let record = run(&env, req);
        assert_eq!(record.status, TerminalStatus::Success);
        assert_eq!(record.result.unwrap()["value"], "override-value");
        assert_eq!(store.get("alice", "token").unwrap(), "stored-value");
    }
}
