//! Database error kinds.

/// Errors surfaced by collections, transactions and the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The instance does not exist in the collection.
    #[error("instance not found")]
    InstanceNotFound,
    /// No collection registered under this name.
    #[error("collection not found")]
    CollectionNotFound,
    /// A collection with this name is already registered.
    #[error("collection already registered")]
    CollectionAlreadyRegistered,
    /// The instance already exists and cannot be created again.
    #[error("instance already exists")]
    InstanceAlreadyExists,
    /// A unique index rejected an overlapping value.
    #[error("unique constraint violation on {path}")]
    UniqueViolation {
        /// The indexed path that collided.
        path: String,
    },
    /// The collection name does not match the allowed pattern.
    #[error("invalid collection name {0:?}")]
    InvalidCollectionName(String),
    /// The schema failed to compile or does not require `_id`.
    #[error("invalid collection schema: {0}")]
    InvalidCollectionSchema(String),
    /// The instance does not conform to the collection schema.
    #[error("instance doesn't correspond to schema: {0}")]
    InvalidSchemaInstance(String),
    /// Custom indexes on `_id` are not allowed; it is always indexed.
    #[error("cannot create custom index on _id")]
    CannotIndexIdField,
    /// A replicated event violated a local integrity constraint. Fatal
    /// for the collection: the authoring peer must enforce uniqueness
    /// pre-commit.
    #[error("replica integrity error: {0}")]
    ReplicaIntegrity(String),
    /// Write attempted through a read transaction.
    #[error("read only transaction")]
    ReadOnlyTransaction,
    /// The transaction was already committed or discarded.
    #[error("transaction already terminated")]
    TransactionAlreadyTerminated,
    /// The database is closed.
    #[error("database closed")]
    Closed,
    /// Underlying datastore failure.
    #[error(transparent)]
    Store(#[from] braid_store::StoreError),
    /// Replication failure while appending to the own log.
    #[error(transparent)]
    Net(#[from] braid_net::NetError),
    /// Instance bytes are not valid JSON.
    #[error("invalid instance JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Stored state failed to decode.
    #[error("decode failed: {0}")]
    Decode(#[from] postcard::Error),
}
