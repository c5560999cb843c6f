//! End-to-end coverage of the facade, spec §8 acceptance scenarios.
//! Exercises `Engine::execute_function` the way the `cli` crate does,
//! rather than reaching into `sandbox::run` directly as the unit tests do.

use std::collections::HashMap;
use std::time::Duration;
use tee_engine::config::{EngineConfig, ProviderKind};
use tee_engine::facade::Engine;
use tee_engine::types::{FunctionDescriptor, TerminalStatus, TriggerKind};

fn config() -> EngineConfig {
    EngineConfig {
        provider: ProviderKind::Simulation,
        js_memory_limit_mib: 16,
        execution_timeout_seconds: 2,
        max_cpu_work_units: 2_000_000,
        log_buffer_max_lines: 50,
        log_buffer_max_bytes: 16_384,
        attestation_url: None,
        attestation_audience: None,
        expected_code_measurement: None,
        expected_signer_measurement: None,
        master_key_material: "integration-test-master-key-material".to_string(),
        fetch_allowed_host_suffixes: vec!["example.com".to_string()],
        fetch_sensitive_header_hosts: vec![],
        fetch_max_calls_per_host_per_minute: 60,
        secret_key_rotation_interval: Duration::from_secs(2_592_000),
        audit_log_capacity: 1_000,
        max_secrets_per_principal: 50,
        max_secret_value_bytes: 65_536,
    }
}

fn function(source: &str, principal: &str, allowed_secrets: Vec<String>) -> FunctionDescriptor {
    FunctionDescriptor {
        function_id: "it-fn".to_string(),
        principal_id: principal.to_string(),
        source: source.to_string(),
        allowed_secrets,
        trigger_kind: TriggerKind::Manual,
    }
}

#[tokio::test]
async fn echo_round_trips_through_the_facade() {
    let engine = Engine::new(config()).unwrap();
    let record = engine
        .execute_function(
            function("function main(input) { return input; }", "alice", vec![]),
            "exec-echo".to_string(),
            serde_json::json!({"hello": "world"}),
            HashMap::new(),
        )
        .await;

    assert_eq!(record.status, TerminalStatus::Success);
    assert_eq!(record.result.unwrap()["hello"], "world");
}

#[tokio::test]
async fn allocation_bomb_is_caught_as_memory_exceeded() {
    let engine = Engine::new(config()).unwrap();
    let record = engine
        .execute_function(
            function(
                "function main(input) { let xs = []; while (true) { xs.push(new Array(1 << 20).fill(1)); } }",
                "alice",
                vec![],
            ),
            "exec-bomb".to_string(),
            serde_json::json!({}),
            HashMap::new(),
        )
        .await;

    assert!(matches!(
        record.status,
        TerminalStatus::MemoryExceeded | TerminalStatus::Timeout
    ));
}

#[tokio::test]
async fn secret_round_trip_and_cross_principal_denial() {
    let engine = Engine::new(config()).unwrap();
    engine.store_secret("alice", "api_key", "abc-123", vec![]).unwrap();

    let own = engine
        .execute_function(
            function(
                r#"function main(input) { return { key: secrets.get("api_key") }; }"#,
                "alice",
                vec!["api_key".to_string()],
            ),
            "exec-own".to_string(),
            serde_json::json!({}),
            HashMap::new(),
        )
        .await;
    assert_eq!(own.status, TerminalStatus::Success);
    assert_eq!(own.result.unwrap()["key"], "abc-123");

    // bob's function cannot read alice's secret even if it names it, because
    // the store keys secrets by (principal, name): bob has no such entry.
    let other = engine.get_secret("bob", "api_key");
    assert!(other.is_err());
}

#[tokio::test]
async fn export_then_import_preserves_isolation_between_principals() {
    let engine = Engine::new(config()).unwrap();
    engine.store_secret("alice", "k1", "v1", vec![]).unwrap();
    engine.store_secret("alice", "k2", "v2", vec![]).unwrap();

    let export = engine.export_secrets("alice").unwrap();

    // spec §8 scenario 6: importing alice's export under bob creates
    // independent copies under bob's namespace; alice's own list and values
    // are unaffected.
    let bob_count = engine.import_secrets("bob", &export).unwrap();
    assert_eq!(bob_count, 2);
    assert_eq!(engine.get_secret("bob", "k1").unwrap(), "v1");
    assert_eq!(engine.list_secrets("alice").unwrap().len(), 2);
    assert_eq!(engine.get_secret("alice", "k1").unwrap(), "v1");

    // Re-importing into alice's own namespace after a hypothetical wipe still
    // restores the same (name -> plaintext) map.
    engine.delete_secret("alice", "k1").unwrap();
    engine.delete_secret("alice", "k2").unwrap();
    let count = engine.import_secrets("alice", &export).unwrap();
    assert_eq!(count, 2);
    assert_eq!(engine.get_secret("alice", "k1").unwrap(), "v1");
}

#[tokio::test]
async fn attestation_round_trips() {
    let engine = Engine::new(config()).unwrap();
    let token = engine.get_attestation().unwrap();
    let claims = engine.verify_attestation(&token).unwrap();
    assert!(!claims.sub.is_empty());
}
