//! Attestation token issuance and verification — spec §4.7.
//!
//! The teacher's `tdx_attestation` module parses a raw TDX quote byte layout;
//! this crate needs a token a caller outside the enclave can independently
//! verify without understanding that layout, so attestation is expressed as
//! a signed JWT (`jsonwebtoken`) carrying the same measurement fields a TDX
//! quote would, instead of the opaque quote blob itself.

use crate::error::EngineError;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ISSUER: &str = "tee-engine";

/// Spec §4.7: attestation tokens are restricted to `{RS256, ES256}`
/// regardless of provider — unlike the measurement check, this is not gated
/// on running against real hardware.
fn ensure_allowed_algorithm(algorithm: Algorithm) -> Result<(), EngineError> {
    match algorithm {
        Algorithm::RS256 | Algorithm::ES256 => Ok(()),
        other => Err(EngineError::AttestationFailure(format!(
            "attestation algorithm {other:?} is not in the allowed set {{RS256, ES256}}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: usize,
    pub iat: usize,
    pub code_measurement: String,
    pub signer_measurement: String,
}

/// Sign a fresh attestation token. `validity_seconds` is the window the
/// caller has to present it before `verify` rejects it as expired.
pub fn issue(
    encoding_key: &EncodingKey,
    algorithm: Algorithm,
    enclave_id: &str,
    audience: &str,
    code_measurement: &str,
    signer_measurement: &str,
    validity_seconds: usize,
) -> Result<String, EngineError> {
    ensure_allowed_algorithm(algorithm)?;
    let now = now_unix();
    let claims = AttestationClaims {
        sub: enclave_id.to_string(),
        iss: ISSUER.to_string(),
        aud: audience.to_string(),
        exp: now + validity_seconds,
        iat: now,
        code_measurement: code_measurement.to_string(),
        signer_measurement: signer_measurement.to_string(),
    };

    jsonwebtoken::encode(&Header::new(algorithm), &claims, encoding_key)
        .map_err(|e| EngineError::AttestationFailure(format!("failed to sign attestation token: {e}")))
}

/// Verify a token's signature, expiry, issuer and audience, then check its
/// measurement claims against the values this engine was configured to
/// trust. A signature or expiry failure and a measurement mismatch are both
/// `attestation_failure` — spec §4.7 makes no distinction callers can act on.
pub fn verify(
    token: &str,
    decoding_key: &DecodingKey,
    algorithm: Algorithm,
    audience: &str,
    expected_code_measurement: &str,
    expected_signer_measurement: &str,
) -> Result<AttestationClaims, EngineError> {
    ensure_allowed_algorithm(algorithm)?;
    let mut validation = Validation::new(algorithm);
    validation.set_audience(&[audience]);
    validation.set_issuer(&[ISSUER]);

    let data = jsonwebtoken::decode::<AttestationClaims>(token, decoding_key, &validation)
        .map_err(|e| EngineError::AttestationFailure(format!("attestation token rejected: {e}")))?;

    if data.claims.code_measurement != expected_code_measurement {
        return Err(EngineError::AttestationFailure(
            "code measurement does not match expected value".into(),
        ));
    }
    if data.claims.signer_measurement != expected_signer_measurement {
        return Err(EngineError::AttestationFailure(
            "signer measurement does not match expected value".into(),
        ));
    }

    Ok(data.claims)
}

fn now_unix() -> usize {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after 1970")
        .as_secs() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    /// Generate a fresh ES256 key pair the same way `SimulationProvider`
    /// does, for tests that exercise the asymmetric path `jsonwebtoken`
    /// requires for `Algorithm::ES256`.
    fn es256_keys() -> (EncodingKey, DecodingKey) {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let private_pem = signing_key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes()).unwrap();
        let decoding_key = DecodingKey::from_ec_pem(public_pem.as_bytes()).unwrap();
        (encoding_key, decoding_key)
    }

    #[test]
    fn issued_token_verifies_with_matching_measurements() {
        let (encoding_key, decoding_key) = es256_keys();

        let token = issue(
            &encoding_key,
            Algorithm::ES256,
            "enclave-1",
            "tee-engine-clients",
            "code-hash-abc",
            "signer-hash-xyz",
            300,
        )
        .unwrap();

        let claims = verify(
            &token,
            &decoding_key,
            Algorithm::ES256,
            "tee-engine-clients",
            "code-hash-abc",
            "signer-hash-xyz",
        )
        .unwrap();

        assert_eq!(claims.sub, "enclave-1");
    }

    #[test]
    fn rejects_mismatched_code_measurement() {
        let (encoding_key, decoding_key) = es256_keys();

        let token = issue(
            &encoding_key,
            Algorithm::ES256,
            "enclave-1",
            "tee-engine-clients",
            "code-hash-abc",
            "signer-hash-xyz",
            300,
        )
        .unwrap();

        let err = verify(
            &token,
            &decoding_key,
            Algorithm::ES256,
            "tee-engine-clients",
            "different-code-hash",
            "signer-hash-xyz",
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::AttestationFailure(_)));
    }

    #[test]
    fn rejects_token_signed_with_wrong_key() {
        let (encoding_key, _) = es256_keys();
        let (_, decoding_key) = es256_keys();

        let token = issue(&encoding_key, Algorithm::ES256, "enclave-1", "aud", "c", "s", 300).unwrap();

        let err = verify(&token, &decoding_key, Algorithm::ES256, "aud", "c", "s").unwrap_err();
        assert!(matches!(err, EngineError::AttestationFailure(_)));
    }

    #[test]
    fn rejects_algorithm_outside_the_allowed_set() {
        let secret = b"test-hmac-secret-key-material-32";
        let encoding_key = EncodingKey::from_secret(secret);
        let decoding_key = DecodingKey::from_secret(secret);

        let issue_err = issue(&encoding_key, Algorithm::HS256, "enclave-1", "aud", "c", "s", 300).unwrap_err();
        assert!(matches!(issue_err, EngineError::AttestationFailure(_)));

        // Bypass `issue`'s own guard to prove `verify` enforces the allowlist
        // independently rather than trusting whatever signed the token.
        let header = Header::new(Algorithm::HS256);
        let claims = AttestationClaims {
            sub: "enclave-1".into(),
            iss: ISSUER.into(),
            aud: "aud".into(),
            exp: now_unix() + 300,
            iat: now_unix(),
            code_measurement: "c".into(),
            signer_measurement: "s".into(),
        };
        let token = jsonwebtoken::encode(&header, &claims, &encoding_key).unwrap();
        let verify_err = verify(&token, &decoding_key, Algorithm::HS256, "aud", "c", "s").unwrap_err();
        assert!(matches!(verify_err, EngineError::AttestationFailure(_)));
    }
}
