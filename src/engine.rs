use std::{collections::BTreeMap, sync::Arc};

use crate::{
    cache::{CacheNamespace, CacheStats, Caches, Dependency, KeyDerivation},
    config::{EngineConfig, StatisticsRequest},
    eligibility::EligibilityResolver,
    model::{ExperimentDetail, ExperimentId, Segment, SegmentId, UserId, VariantId},
    statistics::{analyze, ExperimentReport, VariantCounts},
    store::ExperimentStore,
    Error, Result,
};

/// Assignment and analysis engine.
///
/// Wraps an [`ExperimentStore`] with read-through caches and exposes eligibility resolution,
/// statistics, and cache invalidation. The mutation layer must call the matching `invalidate_*`
/// method after every write to an experiment, a variant, a segment, or their associations.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use abtest_core::{Engine, EngineConfig, store::InMemoryStore, model::User};
/// # tokio_test_runtime(async {
/// let store = Arc::new(InMemoryStore::new());
/// store.insert_user(User::new("alice"));
/// let (experiment, control) = store.create_experiment("checkout", None);
///
/// let engine = Engine::new(store, EngineConfig::default());
/// let eligible = engine
///     .resolve_eligibility(&"alice".into(), &[experiment.id])
///     .await?;
/// assert_eq!(eligible.get(&experiment.id), Some(&control.id));
/// # Ok::<_, abtest_core::Error>(())
/// # }).unwrap();
/// # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct Engine {
    store: Arc<dyn ExperimentStore>,
    caches: Arc<Caches>,
    resolver: EligibilityResolver,
}

impl Engine {
    /// Create an engine over `store`.
    pub fn new(store: Arc<dyn ExperimentStore>, config: EngineConfig) -> Engine {
        Engine::with_caches(store, Caches::new(&config))
    }

    /// Create an engine whose caches derive keys with `key_derivation`.
    pub fn with_key_derivation(
        store: Arc<dyn ExperimentStore>,
        config: EngineConfig,
        key_derivation: Arc<dyn KeyDerivation>,
    ) -> Engine {
        Engine::with_caches(store, Caches::with_key_derivation(&config, key_derivation))
    }

    fn with_caches(store: Arc<dyn ExperimentStore>, caches: Caches) -> Engine {
        let caches = Arc::new(caches);
        Engine {
            resolver: EligibilityResolver::new(store.clone(), caches.clone()),
            store,
            caches,
        }
    }

    /// Resolve which of `experiment_ids` the user is eligible for, and the variant assigned in
    /// each.
    ///
    /// Unknown experiment ids are skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::UserNotFound`] if the user does not exist.
    /// - [`Error::Store`] if the store fails.
    pub async fn resolve_eligibility(
        &self,
        user_id: &UserId,
        experiment_ids: &[ExperimentId],
    ) -> Result<BTreeMap<ExperimentId, VariantId>> {
        let result = self
            .resolver
            .resolve_eligibility(user_id, experiment_ids)
            .await
            .inspect_err(|err| {
                log::warn!(target: "abtest",
                           user_id;
                           "error occurred while resolving eligibility: {err}");
            })?;

        log::trace!(target: "abtest",
                    user_id,
                    requested = experiment_ids.len(),
                    eligible = result.len();
                    "resolved eligibility");
        Ok(result)
    }

    /// Compute conversion statistics of an experiment.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `request` parameters are out of range.
    /// - [`Error::ExperimentNotFound`] if the experiment does not exist.
    /// - [`Error::NoVariants`] if the experiment has no variants.
    /// - [`Error::Store`] if the store fails.
    pub async fn compute_statistics(
        &self,
        experiment_id: ExperimentId,
        request: &StatisticsRequest,
    ) -> Result<ExperimentReport> {
        request.validate()?;

        let detail = self.resolver.experiment(experiment_id).await?;
        if detail.variants.is_empty() {
            return Err(Error::NoVariants(experiment_id));
        }

        let mut counts = Vec::with_capacity(detail.variants.len());
        for variant in &detail.variants {
            let total_users = self
                .store
                .count_exposed_users(variant.id)
                .await
                .inspect_err(|err| {
                    log::warn!(target: "abtest",
                               experiment_id,
                               variant_id = variant.id;
                               "failed to count exposed users: {err}");
                })?;
            let conversions = self
                .store
                .count_converted_users(variant.id, &request.conversion_event_type)
                .await
                .inspect_err(|err| {
                    log::warn!(target: "abtest",
                               experiment_id,
                               variant_id = variant.id;
                               "failed to count converted users: {err}");
                })?;
            counts.push(VariantCounts::new(
                variant.id,
                variant.name.clone(),
                conversions,
                total_users,
            ));
        }

        if counts.iter().all(|variant| variant.total_users == 0) {
            log::warn!(target: "abtest",
                       experiment_id;
                       "computing statistics for an experiment without exposure events");
        }

        let analysis = analyze(
            &counts,
            request.confidence_level,
            request.significance_threshold,
        )?;

        Ok(ExperimentReport {
            experiment_id,
            experiment_name: detail.experiment.name.clone(),
            conversion_event_type: request.conversion_event_type.clone(),
            confidence_level: request.confidence_level,
            significance_threshold: request.significance_threshold,
            analysis,
        })
    }

    /// Experiment with its variants (ordered by id), served from the experiment cache.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentNotFound`] if the experiment does not exist.
    pub async fn get_experiment(&self, experiment_id: ExperimentId) -> Result<Arc<ExperimentDetail>> {
        self.resolver.experiment(experiment_id).await
    }

    /// Segments assigned to an experiment, served from the segment cache. Empty for experiments
    /// without targeting.
    pub async fn experiment_segments(&self, experiment_id: ExperimentId) -> Result<Arc<[Segment]>> {
        self.resolver.experiment_segments(experiment_id).await
    }

    /// Drop everything cached about an experiment: its detail, its targeting, and every assignment
    /// made in it.
    ///
    /// Call after creating or updating a variant, or (dis)associating a segment.
    pub fn invalidate_experiment(&self, experiment_id: ExperimentId) -> usize {
        self.invalidate(Dependency::Experiment(experiment_id))
    }

    /// Drop cached experiment targeting that includes the segment.
    ///
    /// Call after updating the segment or (dis)associating it with an experiment.
    pub fn invalidate_segment(&self, segment_id: SegmentId) -> usize {
        self.invalidate(Dependency::Segment(segment_id))
    }

    /// Drop cached assignments of a user in every experiment.
    pub fn invalidate_user(&self, user_id: &UserId) -> usize {
        self.invalidate(Dependency::User(user_id.clone()))
    }

    /// Drop the cached assignment of one user in one experiment.
    pub fn invalidate_assignment(&self, user_id: &UserId, experiment_id: ExperimentId) -> bool {
        let removed = self.caches.assignments.invalidate_all_of(&[
            Dependency::User(user_id.clone()),
            Dependency::Experiment(experiment_id),
        ]) > 0;
        log::debug!(target: "abtest",
                    user_id,
                    experiment_id,
                    removed;
                    "invalidated cached assignment");
        removed
    }

    /// Drop every cached entry.
    pub fn clear_all_caches(&self) {
        self.caches.clear_all();
    }

    pub fn cache_stats(&self, namespace: CacheNamespace) -> CacheStats {
        self.caches.stats(namespace)
    }

    fn invalidate(&self, dependency: Dependency) -> usize {
        let removed = self.caches.invalidate_all(&dependency);
        log::debug!(target: "abtest",
                    dependency,
                    removed;
                    "invalidated cache entries");
        removed
    }
}
