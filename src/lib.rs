//! `abtest_core` is the assignment and analysis engine of an A/B testing platform.
//!
//! # Overview
//!
//! The engine does not own any data. Users, experiments, variants, segments and events live in
//! the host application's storage and are read through the [`ExperimentStore`](store::ExperimentStore)
//! trait. [`InMemoryStore`](store::InMemoryStore) is a complete in-process implementation, useful for
//! tests and demos.
//!
//! [`assignment`] deterministically buckets a `(user, experiment)` pair into one of the
//! experiment's variants, proportionally to the variants' allocation. The same pair always lands in
//! the same variant as long as variant configuration does not change, so no per-user state is
//! needed for consistency.
//!
//! [`EligibilityResolver`](eligibility::EligibilityResolver) decides which experiments a user
//! qualifies for. An experiment without segments is open to everyone. Otherwise the user must
//! match at least one of its segments, either through explicit membership or by satisfying all of
//! the segment's [rules](rules::SegmentRules).
//!
//! [`statistics`] compares every variant against control: Wald confidence intervals, a pooled
//! two-proportion z-test, relative uplift, and winner selection. All functions there are pure.
//!
//! [`cache`] provides the read-through TTL caches that sit between the engine and the store.
//! Entries are indexed by the entities they depend on, so invalidation is precise.
//!
//! [`Engine`] ties everything together and is the main entry point: it resolves eligibility,
//! computes statistics reports, and exposes cache invalidation for the mutation layer.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Unknown experiment ids during eligibility
//! resolution are not errors: they are simply missing from the result.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! and the `abtest` target. Install a `log`-compatible logger to see cache, eligibility and
//! bucketing decisions.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod assignment;
pub mod cache;
pub mod eligibility;
pub mod model;
pub mod rules;
pub mod sharder;
pub mod statistics;
pub mod store;

mod attributes;
mod config;
mod engine;
mod error;

pub use attributes::{AttributeValue, Attributes};
pub use config::{CacheConfig, EngineConfig, StatisticsRequest};
pub use engine::Engine;
pub use error::{Error, Result, StoreError};
