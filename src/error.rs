use std::sync::Arc;

use crate::model::{ExperimentId, SegmentId, UserId, VariantId};

/// Represents a result type for operations in the engine.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors returned by the assignment and analysis engine.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The requested user does not exist in the store.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// The requested experiment does not exist in the store.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    /// The requested variant does not exist in the given experiment.
    #[error("variant {variant_id} not found in experiment {experiment_id}")]
    VariantNotFound {
        /// Experiment that was searched.
        experiment_id: ExperimentId,
        /// Variant that was requested.
        variant_id: VariantId,
    },

    /// The requested segment does not exist in the store.
    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentId),

    /// Statistics were requested for an experiment that has no variants.
    #[error("no variants found for experiment {0}")]
    NoVariants(ExperimentId),

    /// Request parameters or a mutation are out of the accepted range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A segment rule refers to an attribute that is not in the supported set.
    #[error("unknown segment rule key: {0:?}")]
    UnknownRuleKey(String),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by an [`ExperimentStore`](crate::store::ExperimentStore) implementation.
#[derive(thiserror::Error, Debug, Clone)]
#[error("store error: {message}")]
pub struct StoreError {
    message: String,
    // Backend errors are usually not clonable, so we're wrapping them in an Arc.
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    /// Create a store error with a plain message.
    pub fn new(message: impl Into<String>) -> StoreError {
        StoreError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error wrapping the backend error that caused it.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        StoreError {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Human-readable description of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Error {
    /// Return `true` if the error means the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::UserNotFound(_)
                | Error::ExperimentNotFound(_)
                | Error::VariantNotFound { .. }
                | Error::SegmentNotFound(_)
        )
    }
}
