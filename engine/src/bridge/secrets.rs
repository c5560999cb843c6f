//! `secrets.get` host binding — spec §4.4 "capability surface: secrets".
//!
//! A function can only read a secret whose name appears in its own
//! `allowed_secrets` list (spec §4.3 (iii)); this is checked here, before the
//! call ever reaches the secret store, so a denial never touches ciphertext
//! and is cheap enough to not need its own rate limit the way `fetch` does.

use crate::bridge::throw_like;
use crate::error::EngineError;
use crate::secret_store::SecretStore;
use rquickjs::{Ctx, Function, Object};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-execution wiring for the `secrets` global: which principal is running,
/// which names it may read, and any overrides shadowing the persisted store
/// for this call only (spec §4.6 `secret_overrides`, never persisted).
#[derive(Clone)]
pub struct SecretsBinding {
    pub store: Arc<SecretStore>,
    pub principal_id: String,
    pub allowed_secrets: Vec<String>,
    pub overrides: HashMap<String, String>,
}

impl SecretsBinding {
    /// Resolve `name` under the same allowlist/override rules `secrets.get`
    /// applies, for other C4 bindings (the `neo` signing flow) that need a
    /// secret without exposing raw key material to script space.
    pub(crate) fn resolve(&self, name: &str) -> Result<String, EngineError> {
        if !self.allowed_secrets.iter().any(|n| n == name) {
            self.store.record_read_audit(&self.principal_id, name, false);
            return Err(EngineError::CapabilityDenied(format!(
                "function is not permitted to read secret '{name}'"
            )));
        }
        if let Some(v) = self.overrides.get(name) {
            self.store.record_read_audit(&self.principal_id, name, true);
            return Ok(v.clone());
        }
        self.store.get(&self.principal_id, name)
    }
}

pub fn install(ctx: &Ctx<'_>, binding: SecretsBinding) -> Result<(), EngineError> {
    let secrets = Object::new(ctx.clone())
        .map_err(|e| EngineError::Internal(format!("secrets object: {e}")))?;

    secrets
        .set(
            "get",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, name: String| -> rquickjs::Result<String> {
                binding
                    .resolve(&name)
                    .map_err(|e| throw_like(&ctx, &e))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    ctx.globals()
        .set("secrets", secrets)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(())
}
