//! Shape limits enforced on every value crossing the host/script boundary —
//! spec §4.4 "input validation". Grounded on `outlayer_rpc::host_functions`'s
//! pattern of validating a `serde_json::Value` before it is handed to the
//! sandbox or sent upstream.

use crate::error::EngineError;
use serde_json::Value;

pub const MAX_STRING_BYTES: usize = 1 << 20; // 1 MiB
pub const MAX_OBJECT_KEYS: usize = 1_000;
pub const MAX_ARRAY_ENTRIES: usize = 10_000;
pub const MAX_DEPTH: usize = 10;

/// Recursively validate a JSON value against the shape limits, spec §4.4.
/// Depth starts at 0 for the value a caller hands in directly.
pub fn validate_shape(value: &Value, depth: usize) -> Result<(), EngineError> {
    if depth > MAX_DEPTH {
        return Err(EngineError::InvalidInput(format!(
            "value nesting exceeds max depth of {MAX_DEPTH}"
        )));
    }

    match value {
        Value::String(s) => {
            if s.len() > MAX_STRING_BYTES {
                return Err(EngineError::InvalidInput(format!(
                    "string of {} bytes exceeds max of {MAX_STRING_BYTES}",
                    s.len()
                )));
            }
        }
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_ENTRIES {
                return Err(EngineError::InvalidInput(format!(
                    "array of {} entries exceeds max of {MAX_ARRAY_ENTRIES}",
                    items.len()
                )));
            }
            for item in items {
                validate_shape(item, depth + 1)?;
            }
        }
        Value::Object(map) => {
            if map.len() > MAX_OBJECT_KEYS {
                return Err(EngineError::InvalidInput(format!(
                    "object of {} keys exceeds max of {MAX_OBJECT_KEYS}",
                    map.len()
                )));
            }
            for (key, v) in map {
                if key.len() > MAX_STRING_BYTES {
                    return Err(EngineError::InvalidInput("object key too long".into()));
                }
                validate_shape(v, depth + 1)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_value() {
        let v = json!({"a": [1, 2, 3], "b": "hello"});
        assert!(validate_shape(&v, 0).is_ok());
    }

    #[test]
    fn rejects_oversized_string() {
        let v = Value::String("x".repeat(MAX_STRING_BYTES + 1));
        assert!(validate_shape(&v, 0).is_err());
    }

    #[test]
    fn rejects_too_many_array_entries() {
        let v = Value::Array(vec![Value::Null; MAX_ARRAY_ENTRIES + 1]);
        assert!(validate_shape(&v, 0).is_err());
    }

    #[test]
    fn rejects_excess_nesting() {
        let mut v = json!("leaf");
        for _ in 0..MAX_DEPTH + 2 {
            v = json!([v]);
        }
        assert!(validate_shape(&v, 0).is_err());
    }

    #[test]
    fn accepts_nesting_at_the_boundary() {
        let mut v = json!("leaf");
        for _ in 0..MAX_DEPTH {
            v = json!([v]);
        }
        assert!(validate_shape(&v, 0).is_ok());
    }
}
