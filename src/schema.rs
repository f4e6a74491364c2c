//! Record schema: attribute metadata for a registered [`TypeId`].
//!
//! Grounded on the teacher's `MapSchema`/`FieldDef` (`core-rust/src/schema.rs`),
//! generalised from "field name + required" to the full attribute contract
//! the spec calls for: wire/property name pair, default value, `noSync`, an
//! optional validator, and a foreign-key kind used for storeKey<->id
//! translation at the source boundary (§10, "Foreign-key translation").

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value as JsonValue;

use crate::ids::TypeId;



/// What an attribute's value represents, for foreign-key translation and for
/// the commit pipeline's client-settable filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// A plain scalar value (string, number, bool, opaque JSON).
    Scalar,
    /// A reference to a single other record (stored as a storeKey in
    /// memory, translated to/from an id at the source boundary).
    ToOne,
    /// An ordered list of references.
    ToManyList,
    /// A keyed set of references (order not significant).
    ToManySet,
}

impl AttributeKind {
    /// Whether this attribute carries foreign-key references that must be
    /// translated between storeKeys (in memory) and ids (on the wire).
    #[must_use]
    pub const fn is_reference(self) -> bool {
        !matches!(self, AttributeKind::Scalar)
    }
}

/// A validator invoked with an attribute's candidate value.
///
/// Returns `Some(message)` describing the failure, or `None` if the value is
/// acceptable. Kept as a trait object (`Rc<dyn Validator>`) rather than a
/// bare `fn` pointer so closures with captured state can be used.
pub trait Validator {
    /// Validates `value` for the attribute named `property_key` on `data`.
    fn validate(&self, value: &JsonValue, property_key: &str) -> Option<String>;
}

impl<F> Validator for F
where
    F: Fn(&JsonValue, &str) -> Option<String>,
{
    fn validate(&self, value: &JsonValue, property_key: &str) -> Option<String> {
        self(value, property_key)
    }
}

/// Declaration of a single attribute on a [`RecordSchema`].
#[derive(Clone)]
pub struct AttributeDef {
    /// Name as it appears in the wire payload (source JSON).
    pub attribute_key: String,
    /// Name as it appears in the in-memory `data` map.
    pub property_key: String,
    /// Value substituted when a record is saved without this attribute set.
    pub default: JsonValue,
    /// If `true`, this attribute is never sent in a commit's `changes`/`data`
    /// (e.g. server-computed or purely local fields).
    pub no_sync: bool,
    /// Reference kind, for foreign-key translation.
    pub kind: AttributeKind,
    /// For reference kinds, the type the referenced storeKey(s) belong to.
    /// `None` for `Scalar` attributes.
    pub target_type: Option<TypeId>,
    /// Optional validator run on every write.
    pub validator: Option<Rc<dyn Validator>>,
}

impl std::fmt::Debug for AttributeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeDef")
            .field("attribute_key", &self.attribute_key)
            .field("property_key", &self.property_key)
            .field("default", &self.default)
            .field("no_sync", &self.no_sync)
            .field("kind", &self.kind)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl AttributeDef {
    /// Builds a plain scalar attribute with matching wire/property names and
    /// a JSON `null` default.
    #[must_use]
    pub fn scalar(name: impl Into<String>) -> Self {
        let name = name.into();
        AttributeDef {
            attribute_key: name.clone(),
            property_key: name,
            default: JsonValue::Null,
            no_sync: false,
            kind: AttributeKind::Scalar,
            target_type: None,
            validator: None,
        }
    }

    /// Marks the attribute as `noSync` (builder style).
    #[must_use]
    pub fn no_sync(mut self) -> Self {
        self.no_sync = true;
        self
    }

    /// Sets the default value (builder style).
    #[must_use]
    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = value;
        self
    }

    /// Sets the reference kind (builder style).
    #[must_use]
    pub fn kind(mut self, kind: AttributeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the referenced type for a reference-kind attribute (builder
    /// style).
    #[must_use]
    pub fn target_type(mut self, type_id: TypeId) -> Self {
        self.target_type = Some(type_id);
        self
    }

    /// Attaches a validator (builder style).
    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Rc::new(validator));
        self
    }
}

/// A record class: name, primary-key attribute, and ordered attribute list.
pub struct RecordSchema {
    /// Human-readable type name.
    pub name: String,
    /// Name of the primary-key attribute (default `"id"`).
    pub primary_key: String,
    /// Declared attributes, in declaration order.
    pub attributes: Vec<AttributeDef>,
}

impl RecordSchema {
    /// Creates a schema with the default primary-key attribute name `"id"`.
    #[must_use]
    pub fn new(name: impl Into<String>, attributes: Vec<AttributeDef>) -> Self {
        RecordSchema {
            name: name.into(),
            primary_key: "id".to_string(),
            attributes,
        }
    }

    /// Overrides the primary-key attribute name (builder style).
    #[must_use]
    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    /// Looks up an attribute by its in-memory property key.
    #[must_use]
    pub fn attribute(&self, property_key: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.property_key == property_key)
    }

    /// Builds the default `data` map: every declared attribute set to its
    /// default value.
    #[must_use]
    pub fn defaults(&self) -> HashMap<String, JsonValue> {
        self.attributes
            .iter()
            .map(|a| (a.property_key.clone(), a.default.clone()))
            .collect()
    }

    /// Property keys of attributes that reference other records, with their
    /// kind and target type -- the cached descriptor used for ingress/egress
    /// translation (§10, "Foreign-key translation").
    #[must_use]
    pub fn reference_attributes(&self) -> Vec<(&str, AttributeKind, Option<TypeId>)> {
        self.attributes
            .iter()
            .filter(|a| a.kind.is_reference())
            .map(|a| (a.property_key.as_str(), a.kind, a.target_type))
            .collect()
    }

    /// Property keys of attributes a client is permitted to set on create
    /// (all attributes that aren't `noSync`).
    #[must_use]
    pub fn client_settable(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| !a.no_sync)
            .map(|a| a.property_key.as_str())
            .collect()
    }
}

/// A registered schema paired with the [`TypeId`] the store assigned it.
pub(crate) struct RegisteredSchema {
    pub schema: RecordSchema,
    pub type_id: TypeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_uses_declared_default_values() {
        let schema = RecordSchema::new(
            "Contact",
            vec![
                AttributeDef::scalar("name").default_value(JsonValue::String("".into())),
                AttributeDef::scalar("age").default_value(JsonValue::from(0)),
            ],
        );
        let defaults = schema.defaults();
        assert_eq!(defaults.get("name"), Some(&JsonValue::String("".into())));
        assert_eq!(defaults.get("age"), Some(&JsonValue::from(0)));
    }

    #[test]
    fn client_settable_excludes_no_sync_attributes() {
        let schema = RecordSchema::new(
            "Contact",
            vec![
                AttributeDef::scalar("name"),
                AttributeDef::scalar("computedScore").no_sync(),
            ],
        );
        let settable = schema.client_settable();
        assert_eq!(settable, vec!["name"]);
    }

    #[test]
    fn reference_attributes_reports_kind_and_target() {
        let person = TypeId::from_raw(1);
        let schema = RecordSchema::new(
            "Task",
            vec![
                AttributeDef::scalar("title"),
                AttributeDef::scalar("assignee").kind(AttributeKind::ToOne).target_type(person),
                AttributeDef::scalar("tags").kind(AttributeKind::ToManySet),
            ],
        );
        let refs = schema.reference_attributes();
        assert_eq!(
            refs,
            vec![
                ("assignee", AttributeKind::ToOne, Some(person)),
                ("tags", AttributeKind::ToManySet, None),
            ]
        );
    }

    #[test]
    fn validator_closure_reports_failure() {
        let attr = AttributeDef::scalar("age").validator(|v: &JsonValue, _k: &str| {
            if v.as_i64().unwrap_or(0) < 0 {
                Some("must be non-negative".to_string())
            } else {
                None
            }
        });
        let validator = attr.validator.unwrap();
        assert_eq!(validator.validate(&JsonValue::from(-1), "age"), Some("must be non-negative".to_string()));
        assert_eq!(validator.validate(&JsonValue::from(5), "age"), None);
    }
}
