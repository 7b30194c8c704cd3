//! Error types for the metrics engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Query planning or validation error
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Query execution was cancelled
    #[error("Query cancelled")]
    Cancelled,

    /// An event with the same name is already registered
    #[error("Duplicate event registration: {0}")]
    DuplicateEvent(String),
}

/// Errors raised while planning or validating a query
///
/// A planner error is attached to the query it belongs to and skips that
/// query's execution without aborting sibling queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The queried event is not present in the registry
    #[error("Event is not registered")]
    UnregisteredEvent,

    /// The event does not support the requested resolution
    #[error("Resolution is not supported by the event")]
    InvalidResolution,

    /// A value filter references a label the event does not declare
    #[error("Label is not declared on the event")]
    InvalidEventLabel,

    /// A group-by label is not declared on the event
    #[error("Group label is not declared on the event")]
    InvalidGroupLabel,

    /// The event descriptor failed validation at construction
    #[error("Invalid event descriptor: {0}")]
    InvalidDescriptor(DescError),

    /// The planned unit count exceeded the query's record budget
    #[error("Max records exceeded, results truncated")]
    MaxRecordsExceeded,
}

impl QueryError {
    /// Soft errors truncate output but do not fail the query.
    pub fn is_soft(&self) -> bool {
        matches!(self, QueryError::MaxRecordsExceeded)
    }
}

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connecting to the store failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command or pipeline failed after retries
    #[error("Command error: {0}")]
    Command(String),

    /// A command did not complete within the configured timeout
    #[error("Command timeout")]
    Timeout,

    /// The store returned a reply the client could not interpret
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Descriptor validation errors
///
/// Recorded on the descriptor at construction time; a descriptor carrying
/// one is rejected by the query planner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescError {
    /// The event name is empty
    #[error("Event name is empty")]
    EmptyName,

    /// A label name is empty
    #[error("Label name is empty")]
    EmptyLabel,

    /// The same label is declared twice
    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
