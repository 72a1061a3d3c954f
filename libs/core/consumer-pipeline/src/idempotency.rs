//! Idempotency key derivation
//!
//! The consumer side derives a dedup key per delivery with [`derive_key`].
//! The remaining functions are for producers that want to stamp their own keys.
//!
//! ```rust,ignore
//! use consumer_pipeline::idempotency::{business_key, with_idempotency_key};
//!
//! let key = business_key(&[&user_id, &order_id]);
//! let metadata = with_idempotency_key(Metadata::new(), Some(key), "idempotency-key");
//! producer.send(payload, metadata).await?;
//! ```

use crate::config::IdempotencyPolicy;
use crate::message::{InboundMessage, Metadata};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use tracing::warn;
use uuid::Uuid;

/// Separator used by [`business_key`]
pub const BUSINESS_KEY_DELIMITER: &str = ":";

/// Dedup key for a delivered message.
///
/// Uses the broker message ID, or the configured metadata property when
/// `use_message_id` is off. A missing business key falls back to the message ID.
pub fn derive_key(message: &InboundMessage, policy: &IdempotencyPolicy) -> String {
    if policy.use_message_id {
        return message.id().to_string();
    }

    match message.property(&policy.key_property) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            warn!(
                message_id = %message.id(),
                key_property = %policy.key_property,
                "No idempotency key found in message metadata, falling back to message ID"
            );
            message.id().to_string()
        }
    }
}

/// Random key: `<unix-millis>-<32 hex chars>`
pub fn generate_idempotency_key() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

/// SHA-256 hex digest of the canonical JSON form of `data`.
///
/// Object keys are sorted before hashing, so field order does not matter.
pub fn deterministic_key<T: Serialize + ?Sized>(data: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(&serde_json::to_value(data)?)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Compact JSON with object keys sorted at every depth.
///
/// Independent of the map type backing `Value` (`preserve_order` keeps insertion order).
fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(value, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Join ordered business fields, e.g. `["user-1", "order-9"]` -> `"user-1:order-9"`
pub fn business_key<P: Display>(parts: &[P]) -> String {
    parts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(BUSINESS_KEY_DELIMITER)
}

/// Copy of `metadata` with `key_property` set to `key`, or a fresh random key
pub fn with_idempotency_key(
    mut metadata: Metadata,
    key: Option<String>,
    key_property: &str,
) -> Metadata {
    let key = key.unwrap_or_else(generate_idempotency_key);
    metadata.insert(key_property.to_string(), key);
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(metadata: &[(&str, &str)]) -> InboundMessage {
        InboundMessage::new(
            "1700000000000-3",
            "orders",
            b"{}".to_vec(),
            metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_derive_key_uses_message_id_by_default() {
        let policy = IdempotencyPolicy::enabled();
        let msg = message(&[("idempotency-key", "order-9")]);
        assert_eq!(derive_key(&msg, &policy), "1700000000000-3");
    }

    #[test]
    fn test_derive_key_uses_business_property() {
        let policy = IdempotencyPolicy::enabled().with_key_property("order-id");
        let msg = message(&[("order-id", "order-9")]);
        assert_eq!(derive_key(&msg, &policy), "order-9");
    }

    #[test]
    fn test_derive_key_falls_back_to_message_id() {
        let policy = IdempotencyPolicy::enabled().with_key_property("order-id");
        assert_eq!(derive_key(&message(&[]), &policy), "1700000000000-3");
        assert_eq!(
            derive_key(&message(&[("order-id", "")]), &policy),
            "1700000000000-3"
        );
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = generate_idempotency_key();
        let b = generate_idempotency_key();
        assert_ne!(a, b);

        let (millis, random) = a.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 32);
    }

    #[test]
    fn test_deterministic_key_ignores_field_order() {
        let a = deterministic_key(&json!({"user": 1, "order": "x"})).unwrap();
        let b = deterministic_key(&json!({"order": "x", "user": 1})).unwrap();
        let c = deterministic_key(&json!({"order": "y", "user": 1})).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let mut inner = serde_json::Map::new();
        inner.insert("y".to_string(), json!([{"n": 2, "m": 1}]));
        inner.insert("x".to_string(), json!(1));
        let mut outer = serde_json::Map::new();
        outer.insert("b".to_string(), json!("two"));
        outer.insert("a".to_string(), Value::Object(inner));

        assert_eq!(
            canonical_json(&Value::Object(outer)).unwrap(),
            r#"{"a":{"x":1,"y":[{"m":1,"n":2}]},"b":"two"}"#
        );
    }

    #[test]
    fn test_deterministic_key_ignores_nested_field_order() {
        let a: Value = serde_json::from_str(r#"{"order":{"id":9,"lines":[{"sku":"a","qty":1}]},"user":1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"user":1,"order":{"lines":[{"qty":1,"sku":"a"}],"id":9}}"#).unwrap();
        assert_eq!(deterministic_key(&a).unwrap(), deterministic_key(&b).unwrap());
    }

    #[test]
    fn test_deterministic_key_is_stable_sha256() {
        // sha256("{}")
        assert_eq!(
            deterministic_key(&json!({})).unwrap(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_business_key_joins_in_order() {
        assert_eq!(business_key(&["user-1", "order-9"]), "user-1:order-9");
        assert_eq!(business_key(&[42, 7]), "42:7");
    }

    #[test]
    fn test_with_idempotency_key() {
        let metadata = with_idempotency_key(Metadata::new(), Some("k-1".into()), "idempotency-key");
        assert_eq!(metadata.get("idempotency-key").map(String::as_str), Some("k-1"));

        let generated = with_idempotency_key(Metadata::new(), None, "dedup");
        assert!(generated.contains_key("dedup"));
    }
}
