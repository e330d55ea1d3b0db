//! Segment-based eligibility and variant assignment for a user across experiments.
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use crate::{
    assignment::assign_variant,
    cache::{Caches, KeyMaterial},
    error::Error,
    model::{ExperimentDetail, ExperimentId, Segment, SegmentId, User, UserId, VariantId},
    store::ExperimentStore,
    Result,
};

/// Cache key material for an experiment with its variants.
pub(crate) fn experiment_key(experiment_id: ExperimentId) -> KeyMaterial {
    KeyMaterial::new("get_experiment")
        .arg("experiment_id", experiment_id)
        .depends_on(experiment_id)
}

/// Cache key material for the segments assigned to an experiment.
pub(crate) fn targeting_key(experiment_id: ExperimentId) -> KeyMaterial {
    KeyMaterial::new("experiment_segments")
        .arg("experiment_id", experiment_id)
        .depends_on(experiment_id)
}

/// Cache key material for the variant assigned to a user.
///
/// The key includes the variant allocation, so an assignment computed from an older variant
/// configuration is never served once the configuration changes.
pub(crate) fn assignment_key(user_id: &UserId, detail: &ExperimentDetail) -> KeyMaterial {
    KeyMaterial::new("assign_variant")
        .arg("user_id", user_id)
        .arg("experiment_id", detail.id())
        .arg("allocation", detail.allocation_fingerprint())
        .depends_on(user_id.clone())
        .depends_on(detail.id())
}

/// Decides which experiments a user qualifies for and which variant they get in each.
///
/// An experiment without segments is open to every user. Otherwise the user qualifies if any of
/// the experiment's segments matches, either through explicit membership or because the user
/// satisfies all of the segment's rules.
pub struct EligibilityResolver {
    store: Arc<dyn ExperimentStore>,
    caches: Arc<Caches>,
}

impl EligibilityResolver {
    pub fn new(store: Arc<dyn ExperimentStore>, caches: Arc<Caches>) -> EligibilityResolver {
        EligibilityResolver { store, caches }
    }

    /// Resolve eligibility of `user_id` for each of `experiment_ids`.
    ///
    /// Returns a map from experiment id to the assigned variant. Experiments the user does not
    /// qualify for, unknown experiment ids, and experiments without variants are left out.
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
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::UserNotFound(user_id.clone()))?;

        // Fetched on first use: experiments without targeting do not need memberships.
        let mut memberships: Option<HashSet<SegmentId>> = None;
        let mut result = BTreeMap::new();

        for &experiment_id in experiment_ids {
            let Some(detail) = self.find_experiment(experiment_id).await? else {
                log::trace!(target: "abtest",
                            user_id,
                            experiment_id;
                            "skipping unknown experiment");
                continue;
            };

            let segments = self.experiment_segments(experiment_id).await?;
            let eligible = if segments.is_empty() {
                true
            } else {
                let memberships = match &mut memberships {
                    Some(memberships) => memberships,
                    slot @ None => slot.insert(self.store.list_user_segment_ids(user_id).await?),
                };
                any_segment_matches(&user, memberships, &segments)
            };

            log::trace!(target: "abtest",
                        user_id,
                        experiment_id,
                        eligible,
                        segments = segments.len();
                        "evaluated eligibility");
            if !eligible {
                continue;
            }

            if let Some(variant_id) = self.assignment(user_id, &detail).await {
                result.insert(experiment_id, variant_id);
            }
        }

        Ok(result)
    }

    /// Experiment with its variants, through the experiment cache.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentNotFound`] if the experiment does not exist. Missing experiments are
    /// never cached.
    pub async fn experiment(&self, experiment_id: ExperimentId) -> Result<Arc<ExperimentDetail>> {
        self.caches
            .experiments
            .get_or_try_compute(&experiment_key(experiment_id), || async {
                let experiment = self
                    .store
                    .get_experiment(experiment_id)
                    .await?
                    .ok_or(Error::ExperimentNotFound(experiment_id))?;
                let variants = self.store.list_variants(experiment_id).await?;
                Ok::<_, Error>(Arc::new(ExperimentDetail::new(experiment, variants)))
            })
            .await
    }

    /// Segments assigned to an experiment, through the segment cache.
    pub async fn experiment_segments(&self, experiment_id: ExperimentId) -> Result<Arc<[Segment]>> {
        self.caches
            .segments
            .get_or_try_compute(&targeting_key(experiment_id), || async {
                let segments = self.store.list_experiment_segments(experiment_id).await?;
                Ok::<_, Error>(Arc::from(segments))
            })
            .await
    }

    async fn find_experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Option<Arc<ExperimentDetail>>> {
        match self.experiment(experiment_id).await {
            Ok(detail) => Ok(Some(detail)),
            Err(Error::ExperimentNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn assignment(&self, user_id: &UserId, detail: &ExperimentDetail) -> Option<VariantId> {
        self.caches
            .assignments
            .get_or_compute(&assignment_key(user_id, detail), || async {
                assign_variant(user_id, detail.id(), &detail.variants)
            })
            .await
    }
}

fn any_segment_matches(user: &User, memberships: &HashSet<SegmentId>, segments: &[Segment]) -> bool {
    segments.iter().any(|segment| {
        memberships.contains(&segment.id)
            || segment
                .rules
                .as_ref()
                .is_some_and(|rules| rules.matches(user))
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashSet},
        sync::Arc,
    };

    use super::EligibilityResolver;
    use crate::{
        assignment::assign_variant,
        cache::{Caches, Dependency},
        config::EngineConfig,
        error::StoreError,
        model::{
            Experiment, ExperimentId, Segment, SegmentId, User, UserId, Variant, VariantId,
        },
        rules::SegmentRules,
        store::MockExperimentStore,
        Error,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn resolver(store: MockExperimentStore) -> EligibilityResolver {
        EligibilityResolver::new(
            Arc::new(store),
            Arc::new(Caches::new(&EngineConfig::default())),
        )
    }

    fn half_split(experiment_id: i64) -> Vec<Variant> {
        vec![
            Variant::new(experiment_id * 10, experiment_id, "control", 50.0),
            Variant::new(experiment_id * 10 + 1, experiment_id, "treatment", 50.0),
        ]
    }

    /// Store with user "alice" (premium, US) and experiments 1..=3 using a 50/50 split.
    fn store_with(targeting: Vec<(i64, Vec<Segment>)>, memberships: Vec<i64>) -> MockExperimentStore {
        let mut store = MockExperimentStore::new();
        store.expect_get_user().returning(|user_id| {
            Ok((user_id.as_str() == "alice").then(|| {
                User::new("alice")
                    .with_premium(true)
                    .with_country_code("US")
            }))
        });
        store.expect_get_experiment().returning(|experiment_id| {
            Ok((1..=3)
                .contains(&experiment_id.0)
                .then(|| Experiment::new(experiment_id, format!("exp-{experiment_id}"))))
        });
        store
            .expect_list_variants()
            .returning(|experiment_id| Ok(half_split(experiment_id.0)));

        let targeting: BTreeMap<ExperimentId, Vec<Segment>> = targeting
            .into_iter()
            .map(|(id, segments)| (ExperimentId(id), segments))
            .collect();
        store
            .expect_list_experiment_segments()
            .returning(move |experiment_id| {
                Ok(targeting.get(&experiment_id).cloned().unwrap_or_default())
            });
        let memberships: HashSet<SegmentId> = memberships.into_iter().map(SegmentId).collect();
        store
            .expect_list_user_segment_ids()
            .returning(move |_| Ok(memberships.clone()));
        store
    }

    fn expected(user: &str, experiment_id: i64) -> VariantId {
        assign_variant(
            &UserId::from(user),
            ExperimentId(experiment_id),
            &half_split(experiment_id),
        )
        .unwrap()
    }

    fn premium_rules() -> SegmentRules {
        SegmentRules::new([("is_premium", true)]).unwrap()
    }

    #[tokio::test]
    async fn experiments_without_segments_are_open() {
        init();
        let resolver = resolver(store_with(vec![], vec![]));

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1), ExperimentId(2)])
            .await
            .unwrap();

        assert_eq!(
            result,
            BTreeMap::from([
                (ExperimentId(1), expected("alice", 1)),
                (ExperimentId(2), expected("alice", 2)),
            ])
        );
    }

    #[tokio::test]
    async fn unknown_experiments_are_skipped() {
        init();
        let resolver = resolver(store_with(vec![], vec![]));

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1), ExperimentId(99)])
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert!(result.contains_key(&ExperimentId(1)));
    }

    #[tokio::test]
    async fn unknown_user_is_an_error() {
        init();
        let resolver = resolver(store_with(vec![], vec![]));

        let result = resolver
            .resolve_eligibility(&"mallory".into(), &[ExperimentId(1)])
            .await;

        assert!(matches!(result, Err(Error::UserNotFound(user)) if user.as_str() == "mallory"));
    }

    #[tokio::test]
    async fn rule_match_grants_eligibility() {
        init();
        let premium = Segment::new(5, "premium").with_rules(premium_rules());
        let resolver = resolver(store_with(vec![(1, vec![premium])], vec![]));

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1)])
            .await
            .unwrap();

        assert_eq!(result.get(&ExperimentId(1)), Some(&expected("alice", 1)));
    }

    #[tokio::test]
    async fn explicit_membership_grants_eligibility() {
        init();
        let beta = Segment::new(6, "beta");
        let resolver = resolver(store_with(vec![(1, vec![beta])], vec![6]));

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1)])
            .await
            .unwrap();

        assert!(result.contains_key(&ExperimentId(1)));
    }

    #[tokio::test]
    async fn no_matching_segment_excludes_experiment() {
        init();
        let germany = Segment::new(7, "germany")
            .with_rules(SegmentRules::new([("country_code", "DE")]).unwrap());
        // empty rules never match on their own
        let empty = Segment::new(8, "empty").with_rules(SegmentRules::default());
        let resolver = resolver(store_with(
            vec![(1, vec![germany, empty]), (2, vec![])],
            vec![42],
        ));

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1), ExperimentId(2)])
            .await
            .unwrap();

        assert!(!result.contains_key(&ExperimentId(1)));
        assert!(result.contains_key(&ExperimentId(2)));
    }

    #[tokio::test]
    async fn any_segment_is_enough() {
        init();
        let germany = Segment::new(7, "germany")
            .with_rules(SegmentRules::new([("country_code", "DE")]).unwrap());
        let premium = Segment::new(5, "premium").with_rules(premium_rules());
        let resolver = resolver(store_with(vec![(1, vec![germany, premium])], vec![]));

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1)])
            .await
            .unwrap();

        assert!(result.contains_key(&ExperimentId(1)));
    }

    #[tokio::test]
    async fn experiment_without_variants_is_excluded() {
        init();
        let mut store = MockExperimentStore::new();
        store
            .expect_get_user()
            .returning(|_| Ok(Some(User::new("alice"))));
        store
            .expect_get_experiment()
            .returning(|id| Ok(Some(Experiment::new(id, "empty"))));
        store.expect_list_variants().returning(|_| Ok(Vec::new()));
        store
            .expect_list_experiment_segments()
            .returning(|_| Ok(Vec::new()));
        let resolver = resolver(store);

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1)])
            .await
            .unwrap();

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn memberships_are_not_fetched_without_targeting() {
        init();
        let mut store = MockExperimentStore::new();
        store
            .expect_get_user()
            .returning(|_| Ok(Some(User::new("alice"))));
        store
            .expect_get_experiment()
            .returning(|id| Ok(Some(Experiment::new(id, "open"))));
        store
            .expect_list_variants()
            .returning(|id| Ok(half_split(id.0)));
        store
            .expect_list_experiment_segments()
            .returning(|_| Ok(Vec::new()));
        store.expect_list_user_segment_ids().never();
        let resolver = resolver(store);

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1)])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_propagated() {
        init();
        let mut store = MockExperimentStore::new();
        store
            .expect_get_user()
            .returning(|_| Err(StoreError::new("connection reset")));
        let resolver = resolver(store);

        let result = resolver
            .resolve_eligibility(&"alice".into(), &[ExperimentId(1)])
            .await;

        assert!(matches!(result, Err(Error::Store(err)) if err.message() == "connection reset"));
    }

    #[tokio::test]
    async fn assignment_from_previous_allocation_is_not_served() {
        init();
        let mut store = MockExperimentStore::new();
        store
            .expect_get_user()
            .returning(|_| Ok(Some(User::new("alice"))));
        store
            .expect_get_experiment()
            .returning(|id| Ok(Some(Experiment::new(id, "pricing"))));
        store
            .expect_list_experiment_segments()
            .returning(|_| Ok(Vec::new()));
        let mut seq = mockall::Sequence::new();
        store
            .expect_list_variants()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Ok(vec![Variant::new(10, id, "control", 100.0)]));
        store
            .expect_list_variants()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| {
                Ok(vec![
                    Variant::new(10, id, "control", 0.0),
                    Variant::new(11, id, "treatment", 100.0),
                ])
            });

        let caches = Arc::new(Caches::new(&EngineConfig::default()));
        let resolver = EligibilityResolver::new(Arc::new(store), caches.clone());
        let alice = UserId::from("alice");

        let before = resolver
            .resolve_eligibility(&alice, &[ExperimentId(1)])
            .await
            .unwrap();
        assert_eq!(before[&ExperimentId(1)], VariantId(10));

        // the experiment detail refreshes while the old assignment stays cached
        caches
            .experiments
            .invalidate(&Dependency::Experiment(ExperimentId(1)));
        let after = resolver
            .resolve_eligibility(&alice, &[ExperimentId(1)])
            .await
            .unwrap();
        assert_eq!(after[&ExperimentId(1)], VariantId(11));
        assert_eq!(caches.assignments.len(), 2);
    }

    #[tokio::test]
    async fn missing_experiment_is_not_cached() {
        init();
        let mut store = MockExperimentStore::new();
        let mut calls = 0;
        store.expect_get_experiment().times(2).returning(move |id| {
            calls += 1;
            Ok((calls > 1).then(|| Experiment::new(id, "late")))
        });
        store.expect_list_variants().returning(|id| Ok(half_split(id.0)));
        let resolver = resolver(store);

        assert!(matches!(
            resolver.experiment(ExperimentId(1)).await,
            Err(Error::ExperimentNotFound(_))
        ));
        let detail = resolver.experiment(ExperimentId(1)).await.unwrap();
        assert_eq!(detail.variants.len(), 2);
        // now served from cache
        resolver.experiment(ExperimentId(1)).await.unwrap();
    }
}
