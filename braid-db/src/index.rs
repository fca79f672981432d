//! Secondary indexes: `(collection, path, value) -> sorted instance keys`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use braid_store::WriteBatch;

use crate::error::DbError;
use crate::path::{path_value, value_key};

/// Declaration of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Dotted path to the indexed field.
    pub path: String,
    /// Reject overlapping values when true.
    #[serde(default)]
    pub unique: bool,
}

/// Storage key of one index bucket.
pub(crate) fn bucket_key(db_prefix: &str, collection: &str, path: &str, value: &str) -> Vec<u8> {
    format!("{db_prefix}/_index/collection/{collection}/{path}/{value}").into_bytes()
}

/// Prefix holding every bucket of one collection.
pub(crate) fn collection_index_prefix(db_prefix: &str, collection: &str) -> Vec<u8> {
    format!("{db_prefix}/_index/collection/{collection}/").into_bytes()
}

/// A sorted, deduplicated list of instance keys, as stored in a bucket.
fn decode_keys(raw: Option<Vec<u8>>) -> Result<Vec<Vec<u8>>, DbError> {
    match raw {
        Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
        None => Ok(Vec::new()),
    }
}

fn insert_key(keys: &mut Vec<Vec<u8>>, key: &[u8]) {
    match keys.binary_search_by(|entry| entry.as_slice().cmp(key)) {
        Ok(_) => {} // already present
        Err(position) => keys.insert(position, key.to_vec()),
    }
}

fn remove_key(keys: &mut Vec<Vec<u8>>, key: &[u8]) {
    if let Ok(position) = keys.binary_search_by(|entry| entry.as_slice().cmp(key)) {
        keys.remove(position);
    }
}

/// Add an instance to every index of its collection.
///
/// A missing value on an indexed path is not indexable and is skipped.
/// `strict_unique` distinguishes the authoring path (pre-checked, a
/// violation is [`DbError::UniqueViolation`]) from replica apply, where a
/// violation is [`DbError::ReplicaIntegrity`].
pub(crate) fn index_add(
    tx: &mut WriteBatch<'_>,
    db_prefix: &str,
    collection: &str,
    indexes: &[IndexConfig],
    instance_key: &[u8],
    instance: &Value,
    strict_unique: bool,
) -> Result<(), DbError> {
    for index in indexes {
        let Some(value) = path_value(instance, &index.path) else {
            continue;
        };
        let bucket = bucket_key(db_prefix, collection, &index.path, &value_key(value));
        let mut keys = decode_keys(tx.get(&bucket)?)?;
        if index.unique && keys.iter().any(|key| key.as_slice() != instance_key) {
            return if strict_unique {
                Err(DbError::UniqueViolation {
                    path: index.path.clone(),
                })
            } else {
                Err(DbError::ReplicaIntegrity(format!(
                    "unique index {} violated by replicated event",
                    index.path
                )))
            };
        }
        insert_key(&mut keys, instance_key);
        tx.put(&bucket, &postcard::to_stdvec(&keys)?)?;
    }
    Ok(())
}

/// Remove an instance from every index, using the bytes it was stored
/// with (not the incoming replacement).
pub(crate) fn index_delete(
    tx: &mut WriteBatch<'_>,
    db_prefix: &str,
    collection: &str,
    indexes: &[IndexConfig],
    instance_key: &[u8],
    instance: &Value,
) -> Result<(), DbError> {
    for index in indexes {
        let Some(value) = path_value(instance, &index.path) else {
            continue;
        };
        let bucket = bucket_key(db_prefix, collection, &index.path, &value_key(value));
        let mut keys = decode_keys(tx.get(&bucket)?)?;
        remove_key(&mut keys, instance_key);
        if keys.is_empty() {
            tx.delete(&bucket)?;
        } else {
            tx.put(&bucket, &postcard::to_stdvec(&keys)?)?;
        }
    }
    Ok(())
}

/// Read the instance keys of one bucket.
pub(crate) fn bucket_keys(
    store: &braid_store::Datastore,
    db_prefix: &str,
    collection: &str,
    path: &str,
    value: &str,
) -> Result<Vec<Vec<u8>>, DbError> {
    let bucket = bucket_key(db_prefix, collection, path, value);
    decode_keys(store.get(&bucket)?)
}

/// Drop every bucket of one index path.
pub(crate) fn drop_index(
    tx: &mut WriteBatch<'_>,
    db_prefix: &str,
    collection: &str,
    path: &str,
) -> Result<(), DbError> {
    let prefix = format!("{db_prefix}/_index/collection/{collection}/{path}/").into_bytes();
    tx.delete_prefix(&prefix)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_store::Datastore;
    use serde_json::json;

    fn indexes() -> Vec<IndexConfig> {
        vec![
            IndexConfig {
                path: "email".into(),
                unique: true,
            },
            IndexConfig {
                path: "author.name".into(),
                unique: false,
            },
        ]
    }

    #[test]
    fn add_and_remove_round_trip() {
        let store = Datastore::memory().unwrap();
        let doc = json!({"email": "a@x", "author": {"name": "ada"}});
        store
            .write(|tx| index_add(tx, "/db/t", "c", &indexes(), b"i1", &doc, true))
            .unwrap();

        let keys = bucket_keys(&store, "/db/t", "c", "email", "a@x").unwrap();
        assert_eq!(keys, vec![b"i1".to_vec()]);

        store
            .write(|tx| index_delete(tx, "/db/t", "c", &indexes(), b"i1", &doc))
            .unwrap();
        assert!(bucket_keys(&store, "/db/t", "c", "email", "a@x")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unique_violation_is_detected() {
        let store = Datastore::memory().unwrap();
        store
            .write(|tx| index_add(tx, "/db/t", "c", &indexes(), b"i1", &json!({"email": "a@x"}), true))
            .unwrap();
        let result = store.write(|tx| {
            index_add(tx, "/db/t", "c", &indexes(), b"i2", &json!({"email": "a@x"}), true)
        });
        assert!(matches!(result, Err(DbError::UniqueViolation { .. })));

        // the same collision during replica apply is an integrity error
        let result = store.write(|tx| {
            index_add(tx, "/db/t", "c", &indexes(), b"i2", &json!({"email": "a@x"}), false)
        });
        assert!(matches!(result, Err(DbError::ReplicaIntegrity(_))));

        // non-unique paths accept shared values
        let doc = json!({"author": {"name": "ada"}});
        store
            .write(|tx| {
                index_add(tx, "/db/t", "c", &indexes(), b"i1", &doc, true)?;
                index_add(tx, "/db/t", "c", &indexes(), b"i2", &doc, true)
            })
            .unwrap();
        let keys = bucket_keys(&store, "/db/t", "c", "author.name", "ada").unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn missing_path_is_skipped() {
        let store = Datastore::memory().unwrap();
        let doc = json!({"title": "no email"});
        store
            .write(|tx| index_add(tx, "/db/t", "c", &indexes(), b"i1", &doc, true))
            .unwrap();
        assert!(bucket_keys(&store, "/db/t", "c", "email", "a@x")
            .unwrap()
            .is_empty());
    }
}
