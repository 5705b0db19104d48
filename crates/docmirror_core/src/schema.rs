//! Collection schemas.
//!
//! A schema is a JSON Schema (draft 7) definition with two docmirror
//! annotations on its top-level properties:
//!
//! - `"primary": true` marks the single field whose value keys the item
//! - `"index": true` marks fields the store should index
//!
//! The `type` property is the discriminant shared by every document of a
//! collection; its `const` (or `default`) is the collection's type name.

use crate::error::{FieldViolation, SchemaError, ValidationError};
use jsonschema::{Draft, JSONSchema};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the type discriminant property.
pub const TYPE_FIELD: &str = "type";

/// A compiled collection schema.
pub struct Schema {
    definition: Value,
    validator: JSONSchema,
    primary_field: String,
    type_name: String,
    defaults: Map<String, Value>,
    indexes: Vec<String>,
    property_validators: RwLock<HashMap<String, Arc<JSONSchema>>>,
}

impl Schema {
    /// Compiles a schema definition.
    ///
    /// # Errors
    ///
    /// Fails if the definition does not compile, has zero or several primary
    /// fields, or has no string value for the type discriminant.
    pub fn new(definition: Value) -> Result<Self, SchemaError> {
        let validator = compile(&definition)?;
        let properties = definition
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let primary: Vec<String> = properties
            .iter()
            .filter(|(_, prop)| prop.get("primary").and_then(Value::as_bool) == Some(true))
            .map(|(name, _)| name.clone())
            .collect();
        let primary_field = match primary.as_slice() {
            [] => return Err(SchemaError::NoPrimaryField),
            [single] => single.clone(),
            _ => return Err(SchemaError::MultiplePrimaryFields { fields: primary }),
        };

        let type_name = properties
            .get(TYPE_FIELD)
            .and_then(|prop| prop.get("const").or_else(|| prop.get("default")))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| SchemaError::MissingType {
                field: TYPE_FIELD.to_string(),
            })?;

        let defaults = properties
            .iter()
            .filter_map(|(name, prop)| {
                prop.get("const")
                    .or_else(|| prop.get("default"))
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        let mut indexes = Vec::new();
        collect_indexes(&properties, "", &mut indexes);
        indexes.push(TYPE_FIELD.to_string());
        let mut seen = std::collections::HashSet::new();
        indexes.retain(|path| seen.insert(path.clone()));

        Ok(Self {
            definition,
            validator,
            primary_field,
            type_name,
            defaults,
            indexes,
            property_validators: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the raw definition.
    pub fn definition(&self) -> &Value {
        &self.definition
    }

    /// Name of the primary field.
    pub fn primary_field(&self) -> &str {
        &self.primary_field
    }

    /// Name of the type discriminant field.
    pub fn type_field(&self) -> &str {
        TYPE_FIELD
    }

    /// Value of the type discriminant.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Per-property default values (`const` wins over `default`).
    pub fn defaults(&self) -> Map<String, Value> {
        self.defaults.clone()
    }

    /// Dotted paths of every indexed field, always ending with `type`.
    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    /// Validates a whole document against the schema.
    pub fn validate_document(&self, doc: &Value) -> Result<(), ValidationError> {
        run(&self.validator, doc)
    }

    /// Validates a single property value against its sub-schema.
    ///
    /// Property validators are compiled on first use and cached.
    pub fn validate_property(&self, name: &str, value: &Value) -> Result<(), ValidationError> {
        let validator = self.property_validator(name)?;
        let mut wrapper = Map::new();
        wrapper.insert(name.to_string(), value.clone());
        run(&validator, &Value::Object(wrapper))
    }

    fn property_validator(&self, name: &str) -> Result<Arc<JSONSchema>, ValidationError> {
        if let Some(validator) = self.property_validators.read().get(name) {
            return Ok(Arc::clone(validator));
        }

        let sub = self
            .definition
            .get("properties")
            .and_then(|props| props.get(name))
            .ok_or_else(|| {
                ValidationError::single(format!("/{name}"), format!("unknown property `{name}`"))
            })?;

        // Keep local definitions reachable so `$ref`s still resolve.
        let mut properties = Map::new();
        properties.insert(name.to_string(), sub.clone());
        let mut wrapper = json!({ "type": "object", "properties": properties });
        for key in ["definitions", "$defs"] {
            if let Some(defs) = self.definition.get(key) {
                wrapper[key] = defs.clone();
            }
        }

        let validator = compile(&wrapper)
            .map_err(|e| ValidationError::single(format!("/{name}"), e.to_string()))?;
        let validator = Arc::new(validator);
        self.property_validators
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&validator));
        Ok(validator)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("type_name", &self.type_name)
            .field("primary_field", &self.primary_field)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

fn compile(definition: &Value) -> Result<JSONSchema, SchemaError> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(definition)
        .map_err(|e| SchemaError::invalid(e.to_string()))
}

fn run(validator: &JSONSchema, instance: &Value) -> Result<(), ValidationError> {
    validator.validate(instance).map_err(|errors| {
        ValidationError::new(
            errors
                .map(|e| FieldViolation {
                    path: e.instance_path.to_string(),
                    schema_path: e.schema_path.to_string(),
                    message: e.to_string(),
                })
                .collect(),
        )
    })
}

fn collect_indexes(properties: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (name, prop) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        if prop.get("index").and_then(Value::as_bool) == Some(true) {
            out.push(path.clone());
        }
        if let Some(nested) = prop.get("properties").and_then(Value::as_object) {
            collect_indexes(nested, &path, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo() -> Value {
        json!({
            "title": "todo",
            "type": "object",
            "properties": {
                "type": { "type": "string", "const": "todo" },
                "id": { "type": "string", "primary": true },
                "title": { "type": "string", "index": true },
                "desc": { "type": "string", "default": "" },
                "counter": { "type": "integer", "minimum": 0, "maximum": 99, "default": 0 },
                "params": {
                    "type": "object",
                    "properties": {
                        "param1": { "type": "string", "index": true },
                        "param2": { "type": "string" }
                    }
                }
            },
            "required": ["id", "title"]
        })
    }

    #[test]
    fn discovers_primary_type_and_defaults() {
        let schema = Schema::new(todo()).unwrap();
        assert_eq!(schema.primary_field(), "id");
        assert_eq!(schema.type_name(), "todo");

        let defaults = schema.defaults();
        let mut keys: Vec<_> = defaults.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["counter", "desc", "type"]);
        assert_eq!(defaults["type"], "todo");
        assert_eq!(defaults["counter"], 0);
    }

    #[test]
    fn indexes_are_dotted_and_end_with_type() {
        let schema = Schema::new(todo()).unwrap();
        let indexes = schema.indexes();
        assert_eq!(indexes.len(), 3);
        assert!(indexes.contains(&"params.param1".to_string()));
        assert!(indexes.contains(&"title".to_string()));
        assert_eq!(indexes.last().map(String::as_str), Some("type"));
    }

    #[test]
    fn type_is_not_duplicated_in_indexes() {
        let mut def = todo();
        def["properties"]["type"]["index"] = json!(true);
        let schema = Schema::new(def).unwrap();
        assert_eq!(
            schema.indexes().iter().filter(|p| p.as_str() == "type").count(),
            1
        );
    }

    #[test]
    fn rejects_missing_primary() {
        let mut def = todo();
        def["properties"]["id"]
            .as_object_mut()
            .unwrap()
            .remove("primary");
        assert_eq!(Schema::new(def).unwrap_err(), SchemaError::NoPrimaryField);
    }

    #[test]
    fn rejects_several_primaries() {
        let mut def = todo();
        def["properties"]["title"]["primary"] = json!(true);
        assert!(matches!(
            Schema::new(def),
            Err(SchemaError::MultiplePrimaryFields { .. })
        ));
    }

    #[test]
    fn rejects_missing_type() {
        let mut def = todo();
        def["properties"]
            .as_object_mut()
            .unwrap()
            .remove("type");
        assert!(matches!(Schema::new(def), Err(SchemaError::MissingType { .. })));
    }

    #[test]
    fn default_works_as_type_name() {
        let mut def = todo();
        def["properties"]["type"] = json!({ "type": "string", "default": "task" });
        assert_eq!(Schema::new(def).unwrap().type_name(), "task");
    }

    #[test]
    fn rejects_uncompilable_definition() {
        let def = json!({
            "type": "object",
            "properties": {
                "type": { "const": "x" },
                "id": { "type": "not-a-type", "primary": true }
            }
        });
        assert!(matches!(Schema::new(def), Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn validates_documents() {
        let schema = Schema::new(todo()).unwrap();
        schema
            .validate_document(&json!({ "type": "todo", "id": "1", "title": "milk" }))
            .unwrap();

        let err = schema
            .validate_document(&json!({ "type": "todo", "title": "milk" }))
            .unwrap_err();
        assert!(err.mentions("id"));

        let err = schema
            .validate_document(&json!({ "type": "todo", "id": "1", "title": "milk", "counter": 100 }))
            .unwrap_err();
        assert!(err.mentions("counter"));
    }

    #[test]
    fn validates_properties() {
        let schema = Schema::new(todo()).unwrap();
        schema.validate_property("counter", &json!(5)).unwrap();

        let err = schema.validate_property("counter", &json!(100)).unwrap_err();
        assert_eq!(err.violations()[0].path, "/counter");
        assert!(err.to_string().contains("counter"));

        assert!(schema.validate_property("title", &json!(12)).is_err());
        assert!(schema.validate_property("nope", &json!(1)).is_err());

        // cached validator gives the same answer
        assert!(schema.validate_property("counter", &json!(100)).is_err());
    }
}
