//! `crypto.*` host bindings — spec §4.4 "capability surface: crypto".
//!
//! No network or filesystem access, no key material reachable from script
//! space; these are pure functions over bytes the script already has,
//! grounded on the same call shape as `host_functions::register_fetch` but
//! without the allowlist/rate-limit machinery fetch needs.

use crate::error::EngineError;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rquickjs::{Ctx, Function, Object};
use sha2::{Digest, Sha256};

/// Raise a catchable JS `Error` with `msg` and an `invalid_input` tag, for
/// the bridge functions below to return as their `Err` arm — user code can
/// `try { ... } catch` around any of these the same way it does around
/// `fetch`, and branch on `e.tag` the same way.
fn throw(ctx: &Ctx<'_>, msg: impl Into<String>) -> rquickjs::Error {
    super::throw_like(ctx, &EngineError::InvalidInput(msg.into()))
}

pub fn install(ctx: &Ctx<'_>) -> Result<(), EngineError> {
    let crypto = Object::new(ctx.clone())
        .map_err(|e| EngineError::Internal(format!("crypto object: {e}")))?;

    crypto
        .set(
            "sha256Hex",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, input: String| -> rquickjs::Result<String> {
                let mut hasher = Sha256::new();
                hasher.update(input.as_bytes());
                let _ = &ctx;
                Ok(hex::encode(hasher.finalize()))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    crypto
        .set(
            "hmacSha256Hex",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, key: String, input: String| -> rquickjs::Result<String> {
                    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                        .map_err(|e| throw(&ctx, format!("invalid hmac key: {e}")))?;
                    mac.update(input.as_bytes());
                    Ok(hex::encode(mac.finalize().into_bytes()))
                },
            ),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    crypto
        .set(
            "randomBytesHex",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, n: u32| -> rquickjs::Result<String> {
                const MAX: u32 = 1024;
                if n > MAX {
                    return Err(throw(&ctx, format!("randomBytesHex: n must be <= {MAX}")));
                }
                let mut buf = vec![0u8; n as usize];
                rand::thread_rng().fill_bytes(&mut buf);
                Ok(hex::encode(buf))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    crypto
        .set(
            "base64Encode",
            Function::new(ctx.clone(), move |_ctx: Ctx<'_>, input: String| -> rquickjs::Result<String> {
                Ok(base64::engine::general_purpose::STANDARD.encode(input.as_bytes()))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    crypto
        .set(
            "base64Decode",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, input: String| -> rquickjs::Result<String> {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(input.as_bytes())
                    .map_err(|e| throw(&ctx, format!("invalid base64: {e}")))?;
                String::from_utf8(bytes).map_err(|e| throw(&ctx, format!("base64 payload is not utf-8: {e}")))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    crypto
        .set(
            "hexEncode",
            Function::new(ctx.clone(), move |_ctx: Ctx<'_>, input: String| -> rquickjs::Result<String> {
                Ok(hex::encode(input.as_bytes()))
            }),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    ctx.globals()
        .set("crypto", crypto)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn eval<T: for<'js> rquickjs::FromJs<'js>>(source: &str) -> T {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            install(&ctx).unwrap();
            ctx.eval(source).unwrap()
        })
    }

    #[test]
    fn sha256_matches_known_digest() {
        let digest: String = eval(r#"crypto.sha256Hex("abc")"#);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hmac_is_deterministic_for_the_same_key_and_input() {
        let a: String = eval(r#"crypto.hmacSha256Hex("k", "message")"#);
        let b: String = eval(r#"crypto.hmacSha256Hex("k", "message")"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn random_bytes_rejects_over_the_1kib_ceiling() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            install(&ctx).unwrap();
            let result: rquickjs::Result<String> = ctx.eval("crypto.randomBytesHex(2000)");
            assert!(result.is_err());
        });
    }

    #[test]
    fn random_bytes_produces_requested_length() {
        let hex_str: String = eval("crypto.randomBytesHex(16)");
        assert_eq!(hex_str.len(), 32);
    }

    #[test]
    fn base64_round_trips() {
        let decoded: String = eval(r#"crypto.base64Decode(crypto.base64Encode("hello world"))"#);
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn hex_encode_matches_known_value() {
        let encoded: String = eval(r#"crypto.hexEncode("ab")"#);
        assert_eq!(encoded, "6162");
    }
}
