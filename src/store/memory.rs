use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;

use super::ExperimentStore;
use crate::{
    error::StoreError,
    model::{
        ensure_allocation_fits, ensure_unique_variant_name, Event, Experiment, ExperimentId,
        ExperimentStatus, Segment, SegmentId, User, UserId, Variant, VariantId,
        CONTROL_VARIANT_NAME,
    },
    rules::SegmentRules,
    Error, Result,
};

/// An [`ExperimentStore`] that keeps everything in process memory.
///
/// Besides the read interface, it offers the mutations a CRUD layer would perform, with the same
/// validation: a new experiment starts with a single "control" variant holding 100% of the traffic,
/// variant names are unique per experiment, and allocations never exceed 100%.
///
/// Mutations do not touch engine caches. Callers are expected to invalidate the affected entities
/// on the [`Engine`](crate::Engine) afterwards.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    experiments: BTreeMap<ExperimentId, Experiment>,
    variants: BTreeMap<VariantId, Variant>,
    segments: BTreeMap<SegmentId, Segment>,
    user_segments: HashSet<(UserId, SegmentId)>,
    experiment_segments: BTreeMap<ExperimentId, Vec<SegmentId>>,
    events: Vec<Event>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn experiment_variants(&self, experiment_id: ExperimentId) -> Vec<Variant> {
        self.variants
            .values()
            .filter(|variant| variant.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    fn ensure_user(&self, user_id: &UserId) -> Result<()> {
        if self.users.contains_key(user_id) {
            Ok(())
        } else {
            Err(Error::UserNotFound(user_id.clone()))
        }
    }

    fn ensure_experiment(&self, experiment_id: ExperimentId) -> Result<()> {
        if self.experiments.contains_key(&experiment_id) {
            Ok(())
        } else {
            Err(Error::ExperimentNotFound(experiment_id))
        }
    }

    fn ensure_segment(&self, segment_id: SegmentId) -> Result<()> {
        if self.segments.contains_key(&segment_id) {
            Ok(())
        } else {
            Err(Error::SegmentNotFound(segment_id))
        }
    }

    fn ensure_unique_segment_name(&self, excluding: Option<SegmentId>, name: &str) -> Result<()> {
        let taken = self
            .segments
            .values()
            .any(|segment| Some(segment.id) != excluding && segment.name == name);
        if taken {
            return Err(Error::InvalidInput(format!(
                "a segment named {name:?} already exists"
            )));
        }
        Ok(())
    }

    fn count_distinct_users(&self, predicate: impl Fn(&Event) -> bool) -> u64 {
        let users: HashSet<&UserId> = self
            .events
            .iter()
            .filter(|event| predicate(*event))
            .map(|event| &event.user_id)
            .collect();
        users.len() as u64
    }
}

impl InMemoryStore {
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }

    /// Insert or replace a user.
    pub fn insert_user(&self, user: User) {
        self.write().users.insert(user.id.clone(), user);
    }

    /// Create a draft experiment with a "control" variant allocated 100% of the traffic.
    pub fn create_experiment(
        &self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> (Experiment, Variant) {
        let mut state = self.write();

        let mut experiment = Experiment::new(state.next_id(), name);
        experiment.description = description;
        let control = Variant::new(state.next_id(), experiment.id, CONTROL_VARIANT_NAME, 100.0);

        state.experiments.insert(experiment.id, experiment.clone());
        state.variants.insert(control.id, control.clone());
        (experiment, control)
    }

    pub fn set_experiment_status(
        &self,
        experiment_id: ExperimentId,
        status: ExperimentStatus,
    ) -> Result<()> {
        let mut state = self.write();
        let experiment = state
            .experiments
            .get_mut(&experiment_id)
            .ok_or(Error::ExperimentNotFound(experiment_id))?;
        experiment.status = status;
        Ok(())
    }

    /// Add a variant to an experiment.
    ///
    /// # Errors
    ///
    /// - [`Error::ExperimentNotFound`] if the experiment does not exist.
    /// - [`Error::InvalidInput`] if the name is taken or the total allocation would exceed 100%.
    pub fn add_variant(
        &self,
        experiment_id: ExperimentId,
        name: impl Into<String>,
        percent_allocated: f64,
    ) -> Result<Variant> {
        let name = name.into();
        let mut state = self.write();
        state.ensure_experiment(experiment_id)?;

        let existing = state.experiment_variants(experiment_id);
        ensure_unique_variant_name(&existing, None, &name)?;
        ensure_allocation_fits(&existing, None, percent_allocated)?;

        let variant = Variant::new(state.next_id(), experiment_id, name, percent_allocated);
        state.variants.insert(variant.id, variant.clone());
        Ok(variant)
    }

    /// Rename a variant and/or change its allocation. `None` leaves the field unchanged.
    pub fn update_variant(
        &self,
        experiment_id: ExperimentId,
        variant_id: VariantId,
        name: Option<String>,
        percent_allocated: Option<f64>,
    ) -> Result<Variant> {
        let mut state = self.write();
        let existing = state.experiment_variants(experiment_id);
        if !existing.iter().any(|variant| variant.id == variant_id) {
            return Err(Error::VariantNotFound {
                experiment_id,
                variant_id,
            });
        }

        if let Some(name) = &name {
            ensure_unique_variant_name(&existing, Some(variant_id), name)?;
        }
        if let Some(percent_allocated) = percent_allocated {
            ensure_allocation_fits(&existing, Some(variant_id), percent_allocated)?;
        }

        let variant = state
            .variants
            .get_mut(&variant_id)
            .ok_or(Error::VariantNotFound {
                experiment_id,
                variant_id,
            })?;
        if let Some(name) = name {
            variant.name = name;
        }
        if let Some(percent_allocated) = percent_allocated {
            variant.percent_allocated = percent_allocated;
        }
        Ok(variant.clone())
    }

    /// Create a segment. Segment names are unique.
    pub fn create_segment(
        &self,
        name: impl Into<String>,
        rules: Option<SegmentRules>,
    ) -> Result<Segment> {
        let name = name.into();
        let mut state = self.write();
        state.ensure_unique_segment_name(None, &name)?;

        let mut segment = Segment::new(state.next_id(), name);
        segment.rules = rules;
        state.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    /// Replace the rules of a segment. `None` turns it into a manual segment.
    pub fn update_segment_rules(
        &self,
        segment_id: SegmentId,
        rules: Option<SegmentRules>,
    ) -> Result<Segment> {
        let mut state = self.write();
        let segment = state
            .segments
            .get_mut(&segment_id)
            .ok_or(Error::SegmentNotFound(segment_id))?;
        segment.rules = rules;
        Ok(segment.clone())
    }

    pub fn assign_user_to_segment(&self, user_id: &UserId, segment_id: SegmentId) -> Result<()> {
        let mut state = self.write();
        state.ensure_user(user_id)?;
        state.ensure_segment(segment_id)?;
        state.user_segments.insert((user_id.clone(), segment_id));
        Ok(())
    }

    pub fn remove_user_from_segment(&self, user_id: &UserId, segment_id: SegmentId) -> Result<()> {
        let removed = self
            .write()
            .user_segments
            .remove(&(user_id.clone(), segment_id));
        if removed {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "user {user_id} is not a member of segment {segment_id}"
            )))
        }
    }

    pub fn assign_segment_to_experiment(
        &self,
        experiment_id: ExperimentId,
        segment_id: SegmentId,
    ) -> Result<()> {
        let mut state = self.write();
        state.ensure_experiment(experiment_id)?;
        state.ensure_segment(segment_id)?;

        let segments = state.experiment_segments.entry(experiment_id).or_default();
        if !segments.contains(&segment_id) {
            segments.push(segment_id);
        }
        Ok(())
    }

    pub fn remove_segment_from_experiment(
        &self,
        experiment_id: ExperimentId,
        segment_id: SegmentId,
    ) -> Result<()> {
        let mut state = self.write();
        let segments = state.experiment_segments.entry(experiment_id).or_default();
        let before = segments.len();
        segments.retain(|id| *id != segment_id);
        if segments.len() == before {
            return Err(Error::InvalidInput(format!(
                "segment {segment_id} is not assigned to experiment {experiment_id}"
            )));
        }
        Ok(())
    }

    /// Append an event. The user must exist.
    pub fn record_event(&self, event: Event) -> Result<()> {
        let mut state = self.write();
        state.ensure_user(&event.user_id)?;
        state.events.push(event);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ExperimentStore for InMemoryStore {
    async fn get_user(&self, user_id: &UserId) -> std::result::Result<Option<User>, StoreError> {
        Ok(self.read().users.get(user_id).cloned())
    }

    async fn get_experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> std::result::Result<Option<Experiment>, StoreError> {
        Ok(self.read().experiments.get(&experiment_id).cloned())
    }

    async fn list_variants(
        &self,
        experiment_id: ExperimentId,
    ) -> std::result::Result<Vec<Variant>, StoreError> {
        Ok(self.read().experiment_variants(experiment_id))
    }

    async fn list_experiment_segments(
        &self,
        experiment_id: ExperimentId,
    ) -> std::result::Result<Vec<Segment>, StoreError> {
        let state = self.read();
        let segments = state
            .experiment_segments
            .get(&experiment_id)
            .into_iter()
            .flatten()
            .filter_map(|segment_id| state.segments.get(segment_id).cloned())
            .collect();
        Ok(segments)
    }

    async fn list_user_segment_ids(
        &self,
        user_id: &UserId,
    ) -> std::result::Result<HashSet<SegmentId>, StoreError> {
        let segment_ids = self
            .read()
            .user_segments
            .iter()
            .filter(|(member, _)| member == user_id)
            .map(|(_, segment_id)| *segment_id)
            .collect();
        Ok(segment_ids)
    }

    async fn count_exposed_users(
        &self,
        variant_id: VariantId,
    ) -> std::result::Result<u64, StoreError> {
        Ok(self
            .read()
            .count_distinct_users(|event| event.variant_id == Some(variant_id)))
    }

    async fn count_converted_users(
        &self,
        variant_id: VariantId,
        event_type: &str,
    ) -> std::result::Result<u64, StoreError> {
        Ok(self.read().count_distinct_users(|event| {
            event.variant_id == Some(variant_id) && event.event_type == event_type
        }))
    }
}
