use crate::store::Collection;

/// Errors surfaced by repositories, operators and stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required field is missing or invalid before a write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The update/progress target does not exist for this owner.
    #[error("{collection} '{id}' not found")]
    NotFound { collection: Collection, id: String },

    /// The entity is not in a state that allows the operation.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An atomic batch failed to commit; nothing in it was applied.
    #[error("batch commit failed: {0}")]
    Transaction(String),

    /// The store could not be reached or answered with a backend error.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored document no longer matches its entity shape.
    #[error("malformed {collection} document '{id}': {source}")]
    Decode {
        collection: Collection,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn not_found(collection: Collection, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection,
            id: id.into(),
        }
    }

    /// Whether re-invoking the failed operation unchanged is safe and may succeed.
    ///
    /// A failed batch leaves the store exactly as it was, so transaction and
    /// connectivity failures can be retried as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transaction(_) | Self::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Transaction("boom".into()).is_retryable());
        assert!(Error::StoreUnavailable("offline".into()).is_retryable());
        assert!(!Error::Validation("name".into()).is_retryable());
        assert!(!Error::not_found(Collection::Tasks, "t1").is_retryable());
        assert!(!Error::Precondition("archived".into()).is_retryable());
    }

    #[test]
    fn not_found_message_names_collection() {
        let err = Error::not_found(Collection::CommonTexts, "abc");
        assert_eq!(err.to_string(), "commonTexts 'abc' not found");
    }
}
