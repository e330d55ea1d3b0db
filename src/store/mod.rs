//! Access to persisted users, experiments, segments and event aggregates.
//!
//! The engine does not own any data. Everything it reads comes through [`ExperimentStore`], which
//! the surrounding application implements on top of its own persistence.
use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    error::StoreError,
    model::{Experiment, ExperimentId, Segment, SegmentId, User, UserId, Variant, VariantId},
};

mod memory;

pub use memory::InMemoryStore;

/// Read interface the engine requires from the backing store.
///
/// Lookups return `Ok(None)` for missing entities. `Err` is reserved for backend failures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Point lookup of a user.
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, StoreError>;

    /// Point lookup of an experiment.
    async fn get_experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Option<Experiment>, StoreError>;

    /// All variants of an experiment, in any order.
    async fn list_variants(&self, experiment_id: ExperimentId)
        -> Result<Vec<Variant>, StoreError>;

    /// Segments assigned to an experiment, with their rules.
    async fn list_experiment_segments(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Vec<Segment>, StoreError>;

    /// Ids of the segments the user is an explicit member of.
    async fn list_user_segment_ids(&self, user_id: &UserId)
        -> Result<HashSet<SegmentId>, StoreError>;

    /// Number of distinct users with at least one event tagged to the variant.
    async fn count_exposed_users(&self, variant_id: VariantId) -> Result<u64, StoreError>;

    /// Number of distinct users with at least one event of `event_type` tagged to the variant.
    async fn count_converted_users(
        &self,
        variant_id: VariantId,
        event_type: &str,
    ) -> Result<u64, StoreError>;
}
