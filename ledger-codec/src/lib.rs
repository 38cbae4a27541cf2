//! Deterministic canonical encoding for the ledger's hash surface.
//!
//! Every signed or hashed value in this system round-trips through
//! [`to_canonical_bytes`]. Object keys sort ascending because
//! `serde_json::Value`'s map is backed by a `BTreeMap` (the `preserve_order`
//! feature is never enabled in this workspace); arrays keep source order;
//! floats are rejected outright since money and rates are always integers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value contains a floating-point or otherwise unsupported number")]
    UnsupportedType,
    #[error("failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Walks a `Value` tree and rejects anything the canonical form can't carry.
/// Object key ordering and array ordering are already correct by construction
/// (`serde_json::Value`'s default map is a `BTreeMap`), so this is purely a
/// validation pass, not a rewrite.
fn validate(value: &serde_json::Value) -> Result<(), CodecError> {
    match value {
        serde_json::Value::Number(n) => {
            if n.is_f64() {
                return Err(CodecError::UnsupportedType);
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                validate(item)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                validate(v)?;
            }
            Ok(())
        }
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::String(_) => {
            Ok(())
        }
    }
}

/// Serializes `value` to its canonical JSON bytes: compact, sorted object
/// keys, no floats.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let as_value = serde_json::to_value(value)?;
    validate(&as_value)?;
    Ok(serde_json::to_vec(&as_value)?)
}

/// Same as [`to_canonical_bytes`] but operating on an already-built
/// `serde_json::Value` (useful for governance contexts and disclosure
/// groupings that are assembled dynamically rather than from a typed struct).
pub fn canonicalize_value(value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
    validate(value)?;
    Ok(serde_json::to_vec(value)?)
}

/// `SHA-256` of arbitrary bytes, lowercase hex-64.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// `H(v) = SHA-256(canonical_bytes(v))`, hex-64.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(sha256_hex(&to_canonical_bytes(value)?))
}

/// Same as [`hash_canonical`] for an already-built `Value`.
pub fn hash_canonical_value(value: &serde_json::Value) -> Result<String, CodecError> {
    Ok(sha256_hex(&canonicalize_value(value)?))
}

/// `SHA-256("")`, the empty-Merkle-tree root and a handy constant for tests.
pub fn empty_hash() -> String {
    sha256_hex(b"")
}

/// The all-zero hex-64 sentinel used as `prev_hash` for the first ledger row.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const _ZERO_HASH_LEN_CHECK: () = assert!(ZERO_HASH.len() == 64);

/// `serde(with = "ledger_codec::rfc3339")` — RFC3339 UTC, microsecond
/// precision, `Z` suffix, as required by the canonical codec's instant rule.
pub mod rfc3339 {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let text = dt.to_rfc3339_opts(SecondsFormat::Micros, true);
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let text: Option<String> = Option::deserialize(deserializer)?;
            match text {
                Some(text) => DateTime::parse_from_rfc3339(&text)
                    .map(|dt| Some(dt.with_timezone(&Utc)))
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Formats an instant exactly the way the canonical codec requires,
/// independent of serde — used where a hash key is built by hand (e.g. anchor
/// key names keyed by `period.start`).
pub fn format_instant(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stable_key_order_across_construction_order() {
        let a = json!({"b": 2, "a": 1, "nested": {"y": 2, "x": 1}});
        let b = json!({"nested": {"x": 1, "y": 2}, "a": 1, "b": 2});
        assert_eq!(
            canonicalize_value(&a).unwrap(),
            canonicalize_value(&b).unwrap()
        );
        assert_eq!(
            hash_canonical_value(&a).unwrap(),
            hash_canonical_value(&b).unwrap()
        );
    }

    #[test]
    fn rejects_float() {
        let v = json!({"amount": 1.23});
        assert!(matches!(
            canonicalize_value(&v),
            Err(CodecError::UnsupportedType)
        ));
    }

    #[test]
    fn hash_is_deterministic() {
        let v = json!({"a": 1, "b": "ok"});
        assert_eq!(hash_canonical_value(&v).unwrap(), hash_canonical_value(&v).unwrap());
    }

    #[test]
    fn instant_formats_with_z_suffix_and_micros() {
        let dt = DateTime::parse_from_rfc3339("2026-01-01T08:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let formatted = format_instant(&dt);
        assert!(formatted.ends_with('Z'));
        assert!(formatted.contains('.'));
    }

    #[test]
    fn empty_hash_matches_sha256_of_empty_input() {
        assert_eq!(empty_hash(), sha256_hex(b""));
        assert_eq!(empty_hash().len(), 64);
    }

    proptest::proptest! {
        #[test]
        fn hashing_is_stable_across_repeated_canonicalization(
            keys in proptest::collection::vec("[a-z]{1,8}", 1..10),
            values in proptest::collection::vec(proptest::prelude::any::<i64>(), 1..10),
        ) {
            let pairs: Vec<(String, i64)> = keys.into_iter().zip(values).collect();
            let value: serde_json::Value = json!(pairs.into_iter().collect::<std::collections::BTreeMap<_, _>>());
            let first = hash_canonical_value(&value).unwrap();
            let second = hash_canonical_value(&value).unwrap();
            proptest::prop_assert_eq!(first, second);
        }
    }
}
