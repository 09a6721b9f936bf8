use crate::bottles::domain::BottleId;
use crate::db::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum BottleError {
    #[error("Bottle has no content")]
    EmptyContent,

    #[error("Bottle {0} not found")]
    NotFound(BottleId),

    #[error("Bottle {0} has not been retrieved by this user")]
    NotRetrieved(BottleId),

    #[error("Forbidden")]
    Forbidden,

    #[error("Bottle {0} is hidden")]
    Hidden(BottleId),

    #[error("Bottle {0} is an audio bottle")]
    AudioBottle(BottleId),

    #[error("Bottle {id} is already {state}")]
    AlreadyInState { id: BottleId, state: &'static str },

    #[error("No bottles in the sea")]
    EmptyPool,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BottleError {
    /// Message shown to the user. Faults are logged and replaced by a generic message.
    pub fn user_message(&self) -> String {
        match self {
            BottleError::EmptyContent => "A bottle needs text, an image or audio.".to_string(),
            BottleError::NotFound(id) => format!("Bottle #{} does not exist.", id),
            BottleError::NotRetrieved(id) => {
                format!("You have not retrieved bottle #{} yet, so you cannot open it.", id)
            }
            BottleError::Forbidden => "Only administrators can do that.".to_string(),
            BottleError::Hidden(id) => format!("Bottle #{} has been hidden by an administrator.", id),
            BottleError::AudioBottle(id) => {
                format!("Bottle #{} is an audio bottle and does not accept comments.", id)
            }
            BottleError::AlreadyInState { id, state } => format!("Bottle #{} is already {}.", id, state),
            BottleError::EmptyPool => "The sea is empty, there are no bottles to retrieve.".to_string(),
            BottleError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                "Something went wrong, please try again later.".to_string()
            }
        }
    }

    /// True for faults rather than expected user-facing outcomes
    pub fn is_fault(&self) -> bool {
        matches!(self, BottleError::Storage(_))
    }
}

pub type BottleResult<T> = Result<T, BottleError>;
