//! Deterministic variant bucketing.
//!
//! A `(user, experiment)` pair is hashed into a bucket in `[0, 100)`. Variants, ordered by id,
//! claim consecutive bucket ranges proportional to their `percent_allocated`. The result depends
//! only on the inputs, so repeated calls (and restarts) give the same variant as long as variant
//! configuration does not change.
use crate::{
    model::{ExperimentId, UserId, Variant, VariantId},
    sharder::{Sha256Sharder, Sharder},
};

/// Number of buckets users are spread over.
pub const TOTAL_BUCKETS: u64 = 100;

/// Compute the bucket of `user_id` within `experiment_id`.
pub fn bucket(user_id: &UserId, experiment_id: ExperimentId) -> u64 {
    bucket_with_sharder(&Sha256Sharder, user_id, experiment_id)
}

fn bucket_with_sharder<S: Sharder>(
    sharder: &S,
    user_id: &UserId,
    experiment_id: ExperimentId,
) -> u64 {
    sharder.get_shard(format!("{user_id}:{experiment_id}"), TOTAL_BUCKETS)
}

/// Assign `user_id` to one of `variants` of `experiment_id`.
///
/// Returns `None` when `variants` is empty. When the total allocation is below 100% and the bucket
/// falls in the unallocated remainder, the variant with the highest id is returned.
pub fn assign_variant(
    user_id: &UserId,
    experiment_id: ExperimentId,
    variants: &[Variant],
) -> Option<VariantId> {
    assign_variant_with_sharder(&Sha256Sharder, user_id, experiment_id, variants)
}

fn assign_variant_with_sharder<S: Sharder>(
    sharder: &S,
    user_id: &UserId,
    experiment_id: ExperimentId,
    variants: &[Variant],
) -> Option<VariantId> {
    let mut sorted: Vec<&Variant> = variants.iter().collect();
    sorted.sort_by_key(|variant| variant.id);
    let last = sorted.last()?.id;

    let bucket = bucket_with_sharder(sharder, user_id, experiment_id) as f64;

    let mut cumulative = 0.0;
    let selected = sorted.into_iter().find(|variant| {
        cumulative += variant.percent_allocated;
        bucket < cumulative
    });

    let variant_id = selected.map_or(last, |variant| variant.id);
    log::trace!(target: "abtest",
                user_id,
                experiment_id,
                bucket,
                variant_id,
                fallback = selected.is_none();
                "bucketed user into variant");
    Some(variant_id)
}
