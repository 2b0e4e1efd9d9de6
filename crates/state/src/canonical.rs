use serde_json::Value;

/// Deterministic JSON rendering used as the signing/checksum input.
///
/// `serde_json::Map` is backed by a `BTreeMap` (the `preserve_order`
/// feature is not enabled anywhere in the workspace), so plain
/// `to_string` already produces sorted-key output; this just names
/// that guarantee at the call sites that rely on it.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("snapshot state is always serializable")
}

pub fn canonical_value(value: &Value) -> String {
    serde_json::to_string(value).expect("value is always serializable")
}
