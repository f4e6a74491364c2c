//! Foreign-key translation at the source boundary (§10).
//!
//! Reference attributes are always stored **as storeKeys** in `data` and
//! always travel **as ids** across the `Source` boundary. These helpers do
//! that translation using a schema's cached `reference_attributes()`
//! descriptor; callers supply a `resolve` closure (ingress: id -> storeKey,
//! minting one if unseen) or `lookup` closure (egress: storeKey -> id, if
//! known) rather than this module touching the store's tables directly.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::ids::{RecordId, StoreKey};
use crate::schema::{AttributeKind, RecordSchema};

/// Converts a wire payload (references as id strings) into in-memory `data`
/// (references as storeKey numbers), minting storeKeys for unseen ids via
/// `resolve`.
pub(crate) fn translate_ingress(
    schema: &RecordSchema,
    raw: &HashMap<String, JsonValue>,
    mut resolve: impl FnMut(&str, &RecordId) -> StoreKey,
) -> HashMap<String, JsonValue> {
    let mut out = raw.clone();
    for (property_key, kind, target_type) in schema.reference_attributes() {
        let Some(_target_type) = target_type else { continue };
        let Some(value) = raw.get(property_key) else { continue };
        let translated = match kind {
            AttributeKind::Scalar => continue,
            AttributeKind::ToOne => value
                .as_str()
                .map(|id| JsonValue::from(resolve(property_key, &RecordId::new(id)).raw())),
            AttributeKind::ToManyList | AttributeKind::ToManySet => value.as_array().map(|arr| {
                JsonValue::Array(
                    arr.iter()
                        .filter_map(JsonValue::as_str)
                        .map(|id| JsonValue::from(resolve(property_key, &RecordId::new(id)).raw()))
                        .collect(),
                )
            }),
        };
        if let Some(translated) = translated {
            out.insert(property_key.to_string(), translated);
        }
    }
    out
}

/// Converts in-memory `data` (references as storeKey numbers) into a wire
/// payload (references as id strings), using `lookup` to resolve each
/// storeKey. References whose id is not yet known (still `NEW`) are dropped
/// from the outgoing payload -- a commit cannot reference a record the
/// server hasn't assigned an id to yet.
pub(crate) fn translate_egress(
    schema: &RecordSchema,
    data: &HashMap<String, JsonValue>,
    mut lookup: impl FnMut(StoreKey) -> Option<RecordId>,
) -> HashMap<String, JsonValue> {
    let mut out = data.clone();
    for (property_key, kind, target_type) in schema.reference_attributes() {
        if target_type.is_none() {
            continue;
        }
        let Some(value) = data.get(property_key) else { continue };
        match kind {
            AttributeKind::Scalar => {}
            AttributeKind::ToOne => {
                let translated = value
                    .as_u64()
                    .and_then(|raw| lookup(StoreKey::from_raw(raw)))
                    .map(|id| JsonValue::String(id.as_str().to_string()));
                match translated {
                    Some(v) => {
                        out.insert(property_key.to_string(), v);
                    }
                    None => {
                        out.remove(property_key);
                    }
                }
            }
            AttributeKind::ToManyList | AttributeKind::ToManySet => {
                if let Some(arr) = value.as_array() {
                    let ids: Vec<JsonValue> = arr
                        .iter()
                        .filter_map(JsonValue::as_u64)
                        .filter_map(|raw| lookup(StoreKey::from_raw(raw)))
                        .map(|id| JsonValue::String(id.as_str().to_string()))
                        .collect();
                    out.insert(property_key.to_string(), JsonValue::Array(ids));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TypeId;
    use crate::schema::AttributeDef;

    fn schema_with_assignee() -> RecordSchema {
        RecordSchema::new(
            "Task",
            vec![
                AttributeDef::scalar("title"),
                AttributeDef::scalar("assignee")
                    .kind(AttributeKind::ToOne)
                    .target_type(TypeId::from_raw(1)),
            ],
        )
    }

    #[test]
    fn ingress_translates_id_string_to_store_key_number() {
        let schema = schema_with_assignee();
        let mut raw = HashMap::new();
        raw.insert("title".to_string(), JsonValue::from("fix bug"));
        raw.insert("assignee".to_string(), JsonValue::from("u1"));

        let out = translate_ingress(&schema, &raw, |_prop, id| {
            assert_eq!(id.as_str(), "u1");
            StoreKey::from_raw(42)
        });
        assert_eq!(out.get("assignee"), Some(&JsonValue::from(42)));
        assert_eq!(out.get("title"), Some(&JsonValue::from("fix bug")));
    }

    #[test]
    fn egress_translates_store_key_number_back_to_id_string() {
        let schema = schema_with_assignee();
        let mut data = HashMap::new();
        data.insert("assignee".to_string(), JsonValue::from(42));

        let out = translate_egress(&schema, &data, |sk| {
            assert_eq!(sk.raw(), 42);
            Some(RecordId::new("u1"))
        });
        assert_eq!(out.get("assignee"), Some(&JsonValue::String("u1".to_string())));
    }

    #[test]
    fn egress_drops_reference_whose_id_is_not_yet_known() {
        let schema = schema_with_assignee();
        let mut data = HashMap::new();
        data.insert("assignee".to_string(), JsonValue::from(42));

        let out = translate_egress(&schema, &data, |_sk| None);
        assert!(!out.contains_key("assignee"));
    }
}
