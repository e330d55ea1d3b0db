//! Read-through TTL caches with structured invalidation.
//!
//! The engine keeps three independent caches, one per [`CacheNamespace`]:
//! - experiment lookups (experiment with its variants),
//! - experiment targeting (segments assigned to an experiment),
//! - variant assignments keyed by `(user, experiment)`.
//!
//! The assignment cache is an optimization only. Assignment is a pure function of its inputs, so
//! dropping cached assignments never changes a result.
use std::sync::Arc;

use crate::{
    config::EngineConfig,
    model::{ExperimentDetail, Segment, VariantId},
};

mod key;
mod ttl;

pub use key::{CacheKey, Dependency, KeyDerivation, KeyMaterial, Md5KeyDerivation};
pub use ttl::{CacheStats, CacheValue, TtlCache};

/// Identifies one of the engine caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    Experiments,
    Segments,
    Assignments,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 3] = [
        CacheNamespace::Experiments,
        CacheNamespace::Segments,
        CacheNamespace::Assignments,
    ];
}

impl CacheValue for Arc<ExperimentDetail> {}

impl CacheValue for Arc<[Segment]> {
    fn dependencies(&self) -> Vec<Dependency> {
        self.iter().map(|segment| segment.id.into()).collect()
    }
}

impl CacheValue for Option<VariantId> {}

/// The set of caches used by the engine.
pub struct Caches {
    pub experiments: TtlCache<Arc<ExperimentDetail>>,
    pub segments: TtlCache<Arc<[Segment]>>,
    pub assignments: TtlCache<Option<VariantId>>,
}

impl Caches {
    pub fn new(config: &EngineConfig) -> Caches {
        Caches::with_key_derivation(config, Arc::new(Md5KeyDerivation))
    }

    /// Create caches that derive keys with `key_derivation`.
    pub fn with_key_derivation(
        config: &EngineConfig,
        key_derivation: Arc<dyn KeyDerivation>,
    ) -> Caches {
        Caches {
            experiments: TtlCache::with_key_derivation(
                "experiments",
                config.experiment_cache.clone(),
                key_derivation.clone(),
            ),
            segments: TtlCache::with_key_derivation(
                "segments",
                config.segment_cache.clone(),
                key_derivation.clone(),
            ),
            assignments: TtlCache::with_key_derivation(
                "assignments",
                config.assignment_cache.clone(),
                key_derivation,
            ),
        }
    }

    /// Drop entries of one namespace that depend on `dependency`.
    pub fn invalidate(&self, namespace: CacheNamespace, dependency: &Dependency) -> usize {
        match namespace {
            CacheNamespace::Experiments => self.experiments.invalidate(dependency),
            CacheNamespace::Segments => self.segments.invalidate(dependency),
            CacheNamespace::Assignments => self.assignments.invalidate(dependency),
        }
    }

    /// Drop entries of every namespace that depend on `dependency`.
    pub fn invalidate_all(&self, dependency: &Dependency) -> usize {
        CacheNamespace::ALL
            .into_iter()
            .map(|namespace| self.invalidate(namespace, dependency))
            .sum()
    }

    pub fn clear_all(&self) {
        self.experiments.clear();
        self.segments.clear();
        self.assignments.clear();
        log::debug!(target: "abtest", "cleared all caches");
    }

    pub fn stats(&self, namespace: CacheNamespace) -> CacheStats {
        match namespace {
            CacheNamespace::Experiments => self.experiments.stats(),
            CacheNamespace::Segments => self.segments.stats(),
            CacheNamespace::Assignments => self.assignments.stats(),
        }
    }
}
