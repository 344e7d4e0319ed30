use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Fetch failed during {strategy} sync: {message}")]
    FetchFailure {
        strategy: String,
        message: String,
        connectivity: bool,
    },

    #[error("Malformed entity: {0}")]
    MalformedEntity(String),

    #[error("Manual resolution required for {entity}")]
    ResolutionAmbiguous { entity: String },

    #[error("No manual resolution pending for {entity}")]
    ResolutionNotPending { entity: String },

    #[error("Queue item {item_id} dropped after {attempts} attempts: {last_error}")]
    QueueExhausted {
        item_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid sync strategy: {0}")]
    InvalidStrategy(String),

    #[error("Invalid sync configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl SyncError {
    /// Whether the failure means the remote could not be reached.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::FetchFailure { connectivity, .. } => *connectivity,
            SyncError::Bridge(err) => err.is_connectivity(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
