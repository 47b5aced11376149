use crate::catalogue::NodeId;
use crate::persist::CorruptionError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("unknown catalogue node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown options set: {0}")]
    UnknownOptionsSet(String),

    #[error("a sibling named {name:?} already exists under {parent:?}")]
    DuplicateName { parent: Option<NodeId>, name: String },

    #[error("destination of node {node} resolves back through {target} in a cycle")]
    DestinationCycle { node: NodeId, target: NodeId },

    #[error("invalid catalogue edit: {0}")]
    InvalidEdit(String),

    #[error("catalogue commit failed for {path}: {reason}")]
    PersistenceFailed { path: PathBuf, reason: String },

    #[error(transparent)]
    Corruption(#[from] CorruptionError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("engine is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, EngineError>;
