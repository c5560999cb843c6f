//! Demo host process for `tee-engine`.
//!
//! Loads engine configuration from the environment, runs one function
//! through the facade, and prints the resulting execution record as JSON.
//! A real host (a scheduler, an HTTP webhook listener, a chain event
//! monitor) would call `Engine::execute_function` the same way, just driven
//! by its own trigger source instead of a hardcoded demo script.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tee_engine::facade::Engine;
use tee_engine::types::{FunctionDescriptor, TriggerKind};
use tee_engine::EngineConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tee_engine=info".into()),
        )
        .init();

    info!("tee-engine starting");

    let config = EngineConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let engine = Engine::new(config).context("failed to construct engine")?;

    let attestation = engine
        .get_attestation()
        .context("failed to obtain attestation token")?;
    info!(token_len = attestation.len(), "obtained attestation token");

    engine.store_secret("demo-principal", "greeting", "hello from the secret store", vec!["demo".into()])
        .context("failed to store demo secret")?;

    let function = FunctionDescriptor {
        function_id: "demo-function".to_string(),
        principal_id: "demo-principal".to_string(),
        source: r#"
            function main(input) {
                const greeting = secrets.get("greeting");
                console.log("running demo function");
                return { greeting, doubled: input.n * 2 };
            }
        "#
        .to_string(),
        allowed_secrets: vec!["greeting".to_string()],
        trigger_kind: TriggerKind::Manual,
    };

    let record = engine
        .execute_function(
            function,
            uuid::Uuid::new_v4().to_string(),
            serde_json::json!({ "n": 21 }),
            HashMap::new(),
        )
        .await;

    println!("{}", serde_json::to_string_pretty(&record)?);

    Ok(())
}
