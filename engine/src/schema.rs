//! Schema definition and validation.
//!
//! Schemas describe the payload of each entity type. Operations are validated
//! against them at the queue boundary, merged records are re-validated before
//! commit, and the consistency checker reads references, unique fields and
//! hierarchy fields from them.

use crate::{error::Result, EntityType, Error, Operation, OperationKind, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// JSON array; merged with append semantics
    List,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::List => write!(f, "List"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Values must be unique across all active records of the entity type
    #[serde(default)]
    pub unique: bool,
    /// Entity type this field points at (foreign-key style reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<EntityType>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            unique: false,
            references: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            references: None,
        }
    }

    /// Mark the field as unique-keyed.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark the field as a reference to another entity type.
    pub fn references(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.references = Some(entity_type.into());
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::List => value.is_array(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Entity type name
    pub name: EntityType,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Field holding the parent id for tree-shaped entities (e.g. folders)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_field: Option<String>,
}

impl EntitySchema {
    /// Create a new entity schema.
    pub fn new(name: impl Into<EntityType>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            hierarchy_field: None,
        }
    }

    /// Declare the field that links a record to its parent of the same type.
    pub fn with_hierarchy(mut self, field: impl Into<String>) -> Self {
        self.hierarchy_field = Some(field.into());
        self
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Fields that reference other entity types.
    pub fn reference_fields(&self) -> impl Iterator<Item = (&FieldDef, &EntityType)> {
        self.fields
            .iter()
            .filter_map(|f| f.references.as_ref().map(|target| (f, target)))
    }
}

/// Schema for every entity type the engine syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Entity schemas by name
    pub entities: HashMap<EntityType, EntitySchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            entities: HashMap::new(),
        }
    }

    /// Add an entity type to the schema.
    pub fn add_entity(&mut self, entity: EntitySchema) -> &mut Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Builder-style method to add an entity type.
    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.add_entity(entity);
        self
    }

    /// Get an entity schema by name.
    pub fn get_entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.get(name)
    }

    /// Entity type names in a stable order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut names: Vec<_> = self.entities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a record payload for an entity type.
    pub fn validate_record(&self, entity_type: &str, data: &serde_json::Value) -> Result<()> {
        self.entities
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))?
            .validate_payload(data)
    }

    /// Validate an operation against the schema.
    pub fn validate_operation(&self, op: &Operation) -> Result<()> {
        let entity_schema = self
            .entities
            .get(&op.entity_type)
            .ok_or_else(|| Error::UnknownEntityType(op.entity_type.clone()))?;

        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                entity_schema.validate_payload(&op.data)?;
            }
            // Deletes and pulls carry no payload
            OperationKind::Delete | OperationKind::Pull => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1)
            .with_entity(EntitySchema::new(
                "card",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("points", FieldType::Int),
                    FieldDef::optional("tags", FieldType::List),
                    FieldDef::optional("folderId", FieldType::String).references("folder"),
                ],
            ))
            .with_entity(
                EntitySchema::new(
                    "folder",
                    vec![
                        FieldDef::required("name", FieldType::String).unique(),
                        FieldDef::optional("parentId", FieldType::String),
                    ],
                )
                .with_hierarchy("parentId"),
            )
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();
        let card = schema.get_entity("card").unwrap();

        assert!(card.validate_payload(&json!({"title": "A"})).is_ok());
        assert!(card
            .validate_payload(&json!({"title": "A", "points": 3, "tags": ["x"]}))
            .is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();
        let result = schema.validate_record("card", &json!({"points": 1}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "title"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let result = schema.validate_record("card", &json!({"title": "A", "tags": "x"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "tags"));
    }

    #[test]
    fn validate_non_object_payload() {
        let schema = test_schema();
        let result = schema.validate_record("card", &json!([1, 2]));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn validate_unknown_entity_type() {
        let schema = test_schema();
        let op = Operation::create("board", "b1", json!({"name": "x"}));
        let result = schema.validate_operation(&op);
        assert!(matches!(result, Err(Error::UnknownEntityType(t)) if t == "board"));
    }

    #[test]
    fn delete_skips_payload_validation() {
        let schema = test_schema();
        let op = Operation::delete("card", "c1");
        assert!(schema.validate_operation(&op).is_ok());
    }

    #[test]
    fn reference_and_hierarchy_metadata() {
        let schema = test_schema();
        let card = schema.get_entity("card").unwrap();
        let refs: Vec<_> = card.reference_fields().map(|(f, t)| (f.name.clone(), t.clone())).collect();
        assert_eq!(refs, vec![("folderId".to_string(), "folder".to_string())]);

        let folder = schema.get_entity("folder").unwrap();
        assert_eq!(folder.hierarchy_field.as_deref(), Some("parentId"));
        assert!(folder.field("name").unwrap().unique);
    }

    #[test]
    fn entity_types_are_sorted() {
        assert_eq!(test_schema().entity_types(), vec!["card", "folder"]);
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
