//! Collection registration, schema validation and the collection handle.

use braid_core::InstanceId;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::db::Db;
use crate::error::DbError;
use crate::index::IndexConfig;
use crate::listeners::Action;
use crate::query::Query;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9]+(?:-[A-Za-z0-9]+)*$").expect("static pattern"));

/// The reserved primary-key field.
pub const ID_FIELD: &str = "_id";

/// Describes a collection to register.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Collection name; alphanumeric segments joined by single dashes.
    pub name: String,
    /// JSON schema; must declare a required string property `_id`.
    pub schema: Value,
    /// Secondary indexes by dotted path.
    pub indexes: Vec<IndexConfig>,
}

/// A registered collection's in-memory state.
pub(crate) struct CollectionSpec {
    pub(crate) name: String,
    pub(crate) schema: Value,
    pub(crate) compiled: JSONSchema,
    pub(crate) indexes: Vec<IndexConfig>,
}

impl std::fmt::Debug for CollectionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionSpec")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .finish()
    }
}

impl CollectionSpec {
    /// Validate a config and compile its schema.
    pub(crate) fn build(config: &CollectionConfig) -> Result<Self, DbError> {
        if !NAME_RE.is_match(&config.name) {
            return Err(DbError::InvalidCollectionName(config.name.clone()));
        }
        if !schema_requires_id(&config.schema) {
            return Err(DbError::InvalidCollectionSchema(format!(
                "schema must declare a required string property {ID_FIELD:?}"
            )));
        }
        for index in &config.indexes {
            if index.path == ID_FIELD {
                return Err(DbError::CannotIndexIdField);
            }
        }
        let compiled = JSONSchema::compile(&config.schema)
            .map_err(|err| DbError::InvalidCollectionSchema(err.to_string()))?;
        Ok(CollectionSpec {
            name: config.name.clone(),
            schema: config.schema.clone(),
            compiled,
            indexes: config.indexes.clone(),
        })
    }

    /// Validate one instance against the compiled schema.
    pub(crate) fn validate(&self, instance: &Value) -> Result<(), DbError> {
        if let Err(errors) = self.compiled.validate(instance) {
            let detail = errors
                .map(|error| error.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DbError::InvalidSchemaInstance(detail));
        }
        Ok(())
    }
}

fn schema_requires_id(schema: &Value) -> bool {
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().any(|entry| entry == ID_FIELD))
        .unwrap_or(false);
    let id_is_string = schema
        .get("properties")
        .and_then(|properties| properties.get(ID_FIELD))
        .and_then(|id| id.get("type"))
        .map(|kind| kind == "string")
        .unwrap_or(false);
    required && id_is_string
}

/// Handle to one collection of a database. Cheap to clone; every method
/// runs in its own transaction.
#[derive(Debug, Clone)]
pub struct Collection {
    pub(crate) db: Db,
    pub(crate) name: String,
}

impl Collection {
    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create instances, returning their (possibly generated) ids.
    pub async fn create(&self, instances: &[&[u8]]) -> Result<Vec<InstanceId>, DbError> {
        let mut txn = self.db.write_txn().await?;
        let ids = txn.create(&self.name, instances)?;
        txn.commit().await?;
        Ok(ids)
    }

    /// Replace existing instances.
    pub async fn save(&self, instances: &[&[u8]]) -> Result<(), DbError> {
        let mut txn = self.db.write_txn().await?;
        txn.save(&self.name, instances)?;
        txn.commit().await
    }

    /// Delete instances by id.
    pub async fn delete(&self, ids: &[InstanceId]) -> Result<(), DbError> {
        let mut txn = self.db.write_txn().await?;
        txn.delete(&self.name, ids)?;
        txn.commit().await
    }

    /// True only if all ids exist.
    pub async fn has(&self, ids: &[InstanceId]) -> Result<bool, DbError> {
        self.db.read_txn().await?.has(&self.name, ids)
    }

    /// The raw JSON bytes of one instance.
    pub async fn find_by_id(&self, id: &InstanceId) -> Result<Vec<u8>, DbError> {
        self.db.read_txn().await?.find_by_id(&self.name, id)
    }

    /// Run a query, returning matching instances as raw JSON bytes.
    pub async fn find(&self, query: &Query) -> Result<Vec<Vec<u8>>, DbError> {
        self.db.read_txn().await?.find(&self.name, query)
    }

    /// Listen to changes of this collection only.
    pub fn listen(&self) -> Result<crate::listeners::Listener, DbError> {
        self.db.listen(vec![crate::listeners::ActionFilter {
            collection: Some(self.name.clone()),
            ..Default::default()
        }])
    }
}

/// Extract (or mint) the instance id of a JSON document and write it back
/// into the `_id` field.
pub(crate) fn ensure_instance_id(instance: &mut Value) -> Result<InstanceId, DbError> {
    let id = match instance.get(ID_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) if text.is_empty() => None,
        Some(Value::String(text)) => Some(text.parse::<InstanceId>().map_err(|_| {
            DbError::InvalidSchemaInstance(format!("{ID_FIELD} must be a UUIDv4 string"))
        })?),
        Some(_) => {
            return Err(DbError::InvalidSchemaInstance(format!(
                "{ID_FIELD} must be a string"
            )))
        }
    };
    let id = id.unwrap_or_else(InstanceId::new_random);
    match instance {
        Value::Object(map) => {
            map.insert(ID_FIELD.into(), Value::String(id.to_string()));
        }
        _ => {
            return Err(DbError::InvalidSchemaInstance(
                "instance must be a JSON object".into(),
            ))
        }
    }
    Ok(id)
}

/// A convenience wrapper deriving [`Action`]s for notification.
pub(crate) fn action_of(collection: &str, kind: braid_core::EventKind, id: InstanceId) -> Action {
    Action {
        collection: collection.to_string(),
        kind,
        instance: id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "_id": {"type": "string"},
                "title": {"type": "string"},
            },
            "required": ["_id", "title"],
        })
    }

    #[test]
    fn build_accepts_valid_config() {
        let spec = CollectionSpec::build(&CollectionConfig {
            name: "books".into(),
            schema: schema(),
            indexes: vec![IndexConfig {
                path: "title".into(),
                unique: false,
            }],
        })
        .unwrap();
        assert_eq!(spec.name, "books");
    }

    #[test]
    fn build_rejects_bad_names() {
        for name in ["", "-lead", "trail-", "a--b", "sp ace", "dots."] {
            let result = CollectionSpec::build(&CollectionConfig {
                name: name.into(),
                schema: schema(),
                indexes: Vec::new(),
            });
            assert!(
                matches!(result, Err(DbError::InvalidCollectionName(_))),
                "accepted {name:?}"
            );
        }
        for name in ["books", "my-books", "B2", "a-b-c"] {
            assert!(CollectionSpec::build(&CollectionConfig {
                name: name.into(),
                schema: schema(),
                indexes: Vec::new(),
            })
            .is_ok());
        }
    }

    #[test]
    fn build_rejects_schema_without_id() {
        let result = CollectionSpec::build(&CollectionConfig {
            name: "books".into(),
            schema: json!({"type": "object", "properties": {"title": {"type": "string"}}}),
            indexes: Vec::new(),
        });
        assert!(matches!(result, Err(DbError::InvalidCollectionSchema(_))));
    }

    #[test]
    fn build_rejects_index_on_id() {
        let result = CollectionSpec::build(&CollectionConfig {
            name: "books".into(),
            schema: schema(),
            indexes: vec![IndexConfig {
                path: ID_FIELD.into(),
                unique: true,
            }],
        });
        assert!(matches!(result, Err(DbError::CannotIndexIdField)));
    }

    #[test]
    fn validate_enforces_schema() {
        let spec = CollectionSpec::build(&CollectionConfig {
            name: "books".into(),
            schema: schema(),
            indexes: Vec::new(),
        })
        .unwrap();
        let id = InstanceId::new_random().to_string();
        spec.validate(&json!({"_id": id, "title": "T"})).unwrap();
        assert!(spec.validate(&json!({"_id": id})).is_err());
    }

    #[test]
    fn ensure_instance_id_generates_and_patches() {
        let mut doc = json!({"title": "T"});
        let id = ensure_instance_id(&mut doc).unwrap();
        assert_eq!(doc[ID_FIELD], json!(id.to_string()));

        let mut doc = json!({"_id": "", "title": "T"});
        ensure_instance_id(&mut doc).unwrap();
        assert_ne!(doc[ID_FIELD], json!(""));

        let existing = InstanceId::new_random();
        let mut doc = json!({"_id": existing.to_string()});
        assert_eq!(ensure_instance_id(&mut doc).unwrap(), existing);

        let mut doc = json!({"_id": 42});
        assert!(ensure_instance_id(&mut doc).is_err());
        let mut doc = json!("not an object");
        assert!(ensure_instance_id(&mut doc).is_err());
    }
}
