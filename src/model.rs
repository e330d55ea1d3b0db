//! Entities read by the engine. They are owned and persisted by an external store; the engine
//! treats them as read-only inputs.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::{
    rules::SegmentRules,
    AttributeValue, Attributes, Error, Result,
};

#[allow(missing_docs)]
pub type Timestamp = DateTime<Utc>;

/// Name of the variant treated as control in statistics reports (compared case-insensitively).
pub const CONTROL_VARIANT_NAME: &str = "control";

/// Opaque, stable user identifier. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct UserId(Arc<str>);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Arc<str>> for UserId {
    fn from(value: Arc<str>) -> UserId {
        UserId(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> UserId {
        UserId(value.into())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> UserId {
        UserId(value.into())
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl log::kv::ToValue for UserId {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            Display,
            From,
            Into,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(pub i64);

        impl log::kv::ToValue for $name {
            fn to_value(&self) -> log::kv::Value {
                log::kv::Value::from(self.0)
            }
        }
    };
}

numeric_id!(
    /// Experiment identifier.
    ExperimentId
);
numeric_id!(
    /// Variant identifier. Variants are ordered by id for bucketing and reporting.
    VariantId
);
numeric_id!(
    /// Segment identifier.
    SegmentId
);

/// A user that can be targeted by segments and bucketed into variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub country_code: Option<String>,
    /// Free-form attributes, addressable from segment rules as `attributes.<name>`.
    #[serde(default)]
    pub attributes: Attributes,
}

impl User {
    /// Create a user with the given id and empty profile.
    pub fn new(id: impl Into<UserId>) -> User {
        User {
            id: id.into(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            is_premium: false,
            country_code: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_name(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> User {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> User {
        self.email = email.into();
        self
    }

    pub fn with_premium(mut self, is_premium: bool) -> User {
        self.is_premium = is_premium;
        self
    }

    pub fn with_country_code(mut self, country_code: impl Into<String>) -> User {
        self.country_code = Some(country_code.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> User {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Lifecycle state of an experiment. Carried for the surrounding layer; eligibility does not
/// depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub status: ExperimentStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
}

impl Experiment {
    /// Create a draft experiment.
    pub fn new(id: impl Into<ExperimentId>, name: impl Into<String>) -> Experiment {
        Experiment {
            id: id.into(),
            name: name.into(),
            description: None,
            status: ExperimentStatus::Draft,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Experiment {
        self.description = Some(description.into());
        self
    }
}

/// One arm of an experiment with a configured traffic share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub experiment_id: ExperimentId,
    /// Unique within the experiment.
    pub name: String,
    /// Traffic share in `[0, 100]`.
    pub percent_allocated: f64,
}

impl Variant {
    pub fn new(
        id: impl Into<VariantId>,
        experiment_id: impl Into<ExperimentId>,
        name: impl Into<String>,
        percent_allocated: f64,
    ) -> Variant {
        Variant {
            id: id.into(),
            experiment_id: experiment_id.into(),
            name: name.into(),
            percent_allocated,
        }
    }

    /// Return `true` if the variant is literally named "control" (any case).
    pub fn is_named_control(&self) -> bool {
        self.name.eq_ignore_ascii_case(CONTROL_VARIANT_NAME)
    }
}

/// A named cohort of users, defined by explicit membership and/or attribute rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub name: String,
    pub description: Option<String>,
    /// `None` for purely manual segments.
    #[serde(default)]
    pub rules: Option<SegmentRules>,
}

impl Segment {
    /// Create a manual segment (membership only, no rules).
    pub fn new(id: impl Into<SegmentId>, name: impl Into<String>) -> Segment {
        Segment {
            id: id.into(),
            name: name.into(),
            description: None,
            rules: None,
        }
    }

    pub fn with_rules(mut self, rules: SegmentRules) -> Segment {
        self.rules = Some(rules);
        self
    }
}

/// Append-only fact produced by a user. The engine only reads aggregates over events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: UserId,
    pub experiment_id: Option<ExperimentId>,
    pub variant_id: Option<VariantId>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

impl Event {
    /// Create an event tagged to a variant, timestamped now.
    pub fn new(
        user_id: impl Into<UserId>,
        experiment_id: ExperimentId,
        variant_id: VariantId,
        event_type: impl Into<String>,
    ) -> Event {
        Event {
            user_id: user_id.into(),
            experiment_id: Some(experiment_id),
            variant_id: Some(variant_id),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            properties: None,
        }
    }
}

/// An experiment together with its variants, ordered by variant id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentDetail {
    pub experiment: Experiment,
    pub variants: Vec<Variant>,
}

impl ExperimentDetail {
    pub fn new(experiment: Experiment, mut variants: Vec<Variant>) -> ExperimentDetail {
        variants.sort_by_key(|variant| variant.id);
        ExperimentDetail {
            experiment,
            variants,
        }
    }

    pub fn id(&self) -> ExperimentId {
        self.experiment.id
    }

    pub fn total_allocated(&self) -> f64 {
        total_allocated(&self.variants, None)
    }

    /// Variant ids with their allocations, in id order. Changes whenever bucketing would.
    pub fn allocation_fingerprint(&self) -> String {
        self.variants
            .iter()
            .map(|variant| format!("{}@{}", variant.id, variant.percent_allocated))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn total_allocated(variants: &[Variant], excluding: Option<VariantId>) -> f64 {
    variants
        .iter()
        .filter(|variant| Some(variant.id) != excluding)
        .map(|variant| variant.percent_allocated)
        .sum()
}

/// Check that giving `percent_allocated` to a variant keeps the experiment total within 100%.
///
/// `excluding` names the variant being updated, whose current share is not counted.
pub fn ensure_allocation_fits(
    variants: &[Variant],
    excluding: Option<VariantId>,
    percent_allocated: f64,
) -> Result<()> {
    if !(0.0..=100.0).contains(&percent_allocated) {
        return Err(Error::InvalidInput(format!(
            "percent_allocated must be within [0, 100], got {percent_allocated}"
        )));
    }

    let current = total_allocated(variants, excluding);
    if current + percent_allocated > 100.0 {
        return Err(Error::InvalidInput(format!(
            "total allocation would exceed 100%: current {current}%, attempting to add {percent_allocated}%"
        )));
    }
    Ok(())
}

/// Check that no other variant of the experiment already uses `name`.
pub fn ensure_unique_variant_name(
    variants: &[Variant],
    excluding: Option<VariantId>,
    name: &str,
) -> Result<()> {
    let taken = variants
        .iter()
        .any(|variant| Some(variant.id) != excluding && variant.name == name);
    if taken {
        return Err(Error::InvalidInput(format!(
            "a variant named {name:?} already exists in this experiment"
        )));
    }
    Ok(())
}
