//! Error types shared across the service.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting '{key}'")]
    MissingRequired {
        /// Environment variable name.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// A setting is present but unparseable.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// What went wrong.
        message: String,
    },
}

/// Errors from the embedded store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be opened or a connection created.
    #[error("store unavailable: {0}")]
    Open(String),

    /// A statement failed.
    #[error("query failed: {0}")]
    Query(String),

    /// The store returned data that cannot belong to a healthy database.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

/// Errors from the sandbox executor.
///
/// Limit breaches (timeout, memory) are not errors — they are outcomes
/// reported in [`crate::models::Execution`]. These variants cover the cases
/// where no execution happened at all.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The wait queue for the execution pool is full.
    #[error("sandbox overloaded: {queued} submissions already waiting")]
    Overloaded {
        /// Number of submissions waiting when this one was refused.
        queued: usize,
    },

    /// The child process could not be spawned.
    #[error("failed to spawn sandbox child: {0}")]
    Spawn(String),

    /// Scratch directory or harness I/O failed.
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An active tool with the same content hash already exists.
    #[error("duplicate artifact, already registered as {existing_id}")]
    Duplicate {
        /// Id of the extant tool.
        existing_id: Uuid,
    },

    /// No tool with this id.
    #[error("tool not found: {id}")]
    NotFound {
        /// The id that was looked up.
        id: Uuid,
    },

    /// Fork parent does not exist.
    #[error("parent tool not found: {id}")]
    ParentNotFound {
        /// The requested parent id.
        id: Uuid,
    },

    /// Fork parent has been delisted.
    #[error("parent tool is delisted: {id}")]
    ParentDelisted {
        /// The requested parent id.
        id: Uuid,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
