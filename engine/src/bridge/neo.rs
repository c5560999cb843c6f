//! `neo.*` host binding — Neo N3 JSON-RPC gateway, spec §4.4.4 "capability
//! surface: blockchain". Grounded on the teacher's `RpcProxy` shape in
//! `worker/src/outlayer_rpc/mod.rs` (a thin `reqwest` wrapper around a fixed
//! allowlist of RPC methods with its own rate limiter), re-pointed at Neo
//! N3's JSON-RPC surface and split into named operations the way
//! `outlayer_rpc::methods` exposes one typed function per RPC call instead of
//! a single generic `call(method, params)` escape hatch. The sign/submit path
//! mirrors `host_functions_sync::sign_and_send_tx_as` — fetch the signing key
//! through the secrets capability, sign host-side, never let the key cross
//! into script space — with `near-crypto` swapped for `p256` (see
//! `other_examples/manifests/r3e-network-neo-rs/Cargo.toml`).

use crate::bridge::secrets::SecretsBinding;
use crate::bridge::validate::validate_shape;
use crate::error::EngineError;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rquickjs::{Ctx, Function, Object};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Methods this gateway is willing to forward. `sendrawtransaction` is
/// reachable only through [`ChainGateway::build_sign_submit`], never the raw
/// RPC path, so a script can never submit a transaction it did not build
/// through the validated signing flow.
const ALLOWED_METHODS: &[&str] = &[
    "getblockcount",
    "invokefunction",
    "getrawtransaction",
    "gettransactionheight",
    "getstorage",
    "getnep17balances",
    "sendrawtransaction",
];

/// Per-execution chain RPC wiring.
#[derive(Clone)]
pub struct ChainGateway {
    pub rpc_url: String,
    pub max_calls_per_minute: u32,
    calls_this_minute: std::sync::Arc<AtomicU64>,
    window_started: std::sync::Arc<std::sync::Mutex<std::time::Instant>>,
}

impl ChainGateway {
    pub fn new(rpc_url: String, max_calls_per_minute: u32) -> Self {
        Self {
            rpc_url,
            max_calls_per_minute,
            calls_this_minute: std::sync::Arc::new(AtomicU64::new(0)),
            window_started: std::sync::Arc::new(std::sync::Mutex::new(std::time::Instant::now())),
        }
    }

    fn check_rate(&self) -> bool {
        let mut started = self.window_started.lock().unwrap();
        if started.elapsed() >= Duration::from_secs(60) {
            *started = std::time::Instant::now();
            self.calls_this_minute.store(0, Ordering::Release);
        }
        let count = self.calls_this_minute.fetch_add(1, Ordering::AcqRel) + 1;
        count <= self.max_calls_per_minute as u64
    }

    fn call(
        &self,
        client: &reqwest::blocking::Client,
        method: &str,
        params: Value,
    ) -> Result<Value, EngineError> {
        if !ALLOWED_METHODS.contains(&method) {
            return Err(EngineError::CapabilityDenied(format!(
                "chain RPC method '{method}' is not permitted"
            )));
        }
        if !self.check_rate() {
            return Err(EngineError::CapabilityDenied(
                "chain RPC rate limit exceeded".into(),
            ));
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp: Value = client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .map_err(|e| EngineError::Internal(format!("chain RPC request failed: {e}")))?
            .json()
            .map_err(|e| EngineError::Internal(format!("chain RPC response was not JSON: {e}")))?;

        if let Some(error) = resp.get("error") {
            return Err(EngineError::Internal(format!("chain RPC error: {error}")));
        }

        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    fn get_height(&self, client: &reqwest::blocking::Client) -> Result<Value, EngineError> {
        self.call(client, "getblockcount", json!([]))
    }

    fn invoke_read(
        &self,
        client: &reqwest::blocking::Client,
        script_hash: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, EngineError> {
        self.call(
            client,
            "invokefunction",
            json!([script_hash, method, params]),
        )
    }

    fn get_transaction(
        &self,
        client: &reqwest::blocking::Client,
        txid: &str,
    ) -> Result<Value, EngineError> {
        self.call(client, "getrawtransaction", json!([txid, 1]))
    }

    fn get_storage(
        &self,
        client: &reqwest::blocking::Client,
        script_hash: &str,
        key_base64: &str,
    ) -> Result<Value, EngineError> {
        self.call(client, "getstorage", json!([script_hash, key_base64]))
    }

    fn get_balance(
        &self,
        client: &reqwest::blocking::Client,
        address: &str,
        asset_hash: &str,
    ) -> Result<Value, EngineError> {
        let balances = self.call(client, "getnep17balances", json!([address]))?;
        let matched = balances
            .get("balance")
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| entry.get("assethash") == Some(&json!(asset_hash)))
                    .cloned()
            })
            .unwrap_or(json!({"assethash": asset_hash, "amount": "0"}));
        Ok(matched)
    }

    /// Build a structurally plausible invocation transaction, sign it with a
    /// key resolved through the secrets capability (the script never sees the
    /// key material, only the resulting txid), and submit it.
    fn build_sign_submit(
        &self,
        client: &reqwest::blocking::Client,
        script_hash: &str,
        method: &str,
        params: Value,
        signer_key_hex: &str,
    ) -> Result<Value, EngineError> {
        let key_bytes = hex::decode(signer_key_hex)
            .map_err(|e| EngineError::Internal(format!("signing key is not valid hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&key_bytes)
            .map_err(|e| EngineError::Internal(format!("invalid secp256r1 signing key: {e}")))?;

        let unsigned = json!({
            "scriptHash": script_hash,
            "method": method,
            "params": params,
        });
        let unsigned_bytes = serde_json::to_vec(&unsigned)
            .map_err(|e| EngineError::Internal(format!("failed to encode transaction: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&unsigned_bytes);
        let digest = hasher.finalize();

        let signature: Signature = signing_key.sign(&digest);
        let verifying_key = signing_key.verifying_key();

        let raw_tx = json!({
            "scriptHash": script_hash,
            "method": method,
            "params": params,
            "witnesses": [{
                "invocation": hex::encode(signature.to_der().as_bytes()),
                "verification": hex::encode(verifying_key.to_encoded_point(true).as_bytes()),
            }],
        });
        let raw_tx_hex = hex::encode(
            serde_json::to_vec(&raw_tx)
                .map_err(|e| EngineError::Internal(format!("failed to encode raw transaction: {e}")))?,
        );

        self.call(client, "sendrawtransaction", json!([raw_tx_hex]))
    }
}

fn parse_params(raw: Option<String>) -> Result<Value, EngineError> {
    let value: Value = match raw {
        Some(p) => serde_json::from_str(&p)
            .map_err(|e| EngineError::InvalidInput(format!("invalid params json: {e}")))?,
        None => Value::Array(vec![]),
    };
    validate_shape(&value, 0)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_method_outside_the_allowlist() {
        let gateway = ChainGateway::new("https://example.invalid/rpc".to_string(), 60);
        let client = reqwest::blocking::Client::new();
        let err = gateway.call(&client, "deletedatabase", json!([])).unwrap_err();
        assert!(matches!(err, EngineError::CapabilityDenied(_)));
    }

    #[test]
    fn rate_limiter_denies_after_ceiling() {
        let gateway = ChainGateway::new("https://example.invalid/rpc".to_string(), 2);
        assert!(gateway.check_rate());
        assert!(gateway.check_rate());
        assert!(!gateway.check_rate());
    }

    #[test]
    fn parse_params_defaults_to_empty_array() {
        assert_eq!(parse_params(None).unwrap(), json!([]));
    }

    #[test]
    fn parse_params_rejects_invalid_json() {
        let err = parse_params(Some("{not json".to_string())).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn parse_params_parses_well_formed_json() {
        let parsed = parse_params(Some(r#"["scripthash", "method"]"#.to_string())).unwrap();
        assert_eq!(parsed, json!(["scripthash", "method"]));
    }
}

pub fn install(
    ctx: &Ctx<'_>,
    gateway: ChainGateway,
    secrets: SecretsBinding,
) -> Result<(), EngineError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .map_err(|e| EngineError::Internal(format!("failed to build chain RPC client: {e}")))?;

    let neo = Object::new(ctx.clone()).map_err(|e| EngineError::Internal(format!("neo object: {e}")))?;

    {
        let gateway = gateway.clone();
        let client = client.clone();
        neo.set(
            "getHeight",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<i64> {
                let result = gateway
                    .get_height(&client)
                    .map_err(|e| super::throw_like(&ctx, &e))?;
                result
                    .as_i64()
                    .ok_or_else(|| super::throw_like(&ctx, &EngineError::Internal("getblockcount did not return an integer".into())))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    }

    {
        let gateway = gateway.clone();
        let client = client.clone();
        neo.set(
            "invokeRead",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, script_hash: String, method: String, params: Option<String>| -> rquickjs::Result<String> {
                    let params = parse_params(params).map_err(|e| super::throw_like(&ctx, &e))?;
                    let result = gateway
                        .invoke_read(&client, &script_hash, &method, params)
                        .map_err(|e| super::throw_like(&ctx, &e))?;
                    serde_json::to_string(&result)
                        .map_err(|e| super::throw_like(&ctx, &EngineError::Internal(e.to_string())))
                },
            ),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    }

    {
        let gateway = gateway.clone();
        let client = client.clone();
        neo.set(
            "getTransaction",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, txid: String| -> rquickjs::Result<String> {
                let result = gateway
                    .get_transaction(&client, &txid)
                    .map_err(|e| super::throw_like(&ctx, &e))?;
                serde_json::to_string(&result)
                    .map_err(|e| super::throw_like(&ctx, &EngineError::Internal(e.to_string())))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    }

    {
        let gateway = gateway.clone();
        let client = client.clone();
        neo.set(
            "getStorage",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, script_hash: String, key_base64: String| -> rquickjs::Result<String> {
                    let result = gateway
                        .get_storage(&client, &script_hash, &key_base64)
                        .map_err(|e| super::throw_like(&ctx, &e))?;
                    serde_json::to_string(&result)
                        .map_err(|e| super::throw_like(&ctx, &EngineError::Internal(e.to_string())))
                },
            ),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    }

    {
        let gateway = gateway.clone();
        let client = client.clone();
        neo.set(
            "getBalance",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, address: String, asset_hash: String| -> rquickjs::Result<String> {
                    let result = gateway
                        .get_balance(&client, &address, &asset_hash)
                        .map_err(|e| super::throw_like(&ctx, &e))?;
                    serde_json::to_string(&result)
                        .map_err(|e| super::throw_like(&ctx, &EngineError::Internal(e.to_string())))
                },
            ),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    }

    neo.set(
        "invoke",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>,
                  script_hash: String,
                  method: String,
                  params: Option<String>,
                  signing_secret_name: String|
                  -> rquickjs::Result<String> {
                let params = parse_params(params).map_err(|e| super::throw_like(&ctx, &e))?;
                let signer_key_hex = secrets
                    .resolve(&signing_secret_name)
                    .map_err(|e| super::throw_like(&ctx, &e))?;
                let result = gateway
                    .build_sign_submit(&client, &script_hash, &method, params, &signer_key_hex)
                    .map_err(|e| super::throw_like(&ctx, &e))?;
                serde_json::to_string(&result)
                    .map_err(|e| super::throw_like(&ctx, &EngineError::Internal(e.to_string())))
            },
        ),
    )
    .map_err(|e| EngineError::Internal(e.to_string()))?;

    ctx.globals()
        .set("neo", neo)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(())
}
