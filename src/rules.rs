//! Segment rules: a conjunction of `attribute == value` conditions over a [`User`].
//!
//! Rule keys form a closed set mapped to typed accessors. Unknown keys are rejected when the rules
//! are built (or deserialized), so a misspelled key is a configuration error instead of a rule that
//! silently never matches.
use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{model::User, AttributeValue, Error};

const ATTRIBUTES_PREFIX: &str = "attributes.";

/// A user attribute that segment rules can refer to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKey {
    Id,
    Email,
    FirstName,
    LastName,
    IsPremium,
    CountryCode,
    /// Free-form attribute from [`User::attributes`], written as `attributes.<name>`.
    Attribute(String),
}

impl RuleKey {
    /// Read the value of this attribute from `user`. Returns `None` when the user does not have
    /// it.
    pub fn value_of(&self, user: &User) -> Option<AttributeValue> {
        match self {
            RuleKey::Id => Some(user.id.as_str().into()),
            RuleKey::Email => Some(user.email.as_str().into()),
            RuleKey::FirstName => Some(user.first_name.as_str().into()),
            RuleKey::LastName => Some(user.last_name.as_str().into()),
            RuleKey::IsPremium => Some(user.is_premium.into()),
            RuleKey::CountryCode => user.country_code.as_deref().map(Into::into),
            RuleKey::Attribute(name) => user.attributes.get(name).cloned(),
        }
    }
}

impl FromStr for RuleKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<RuleKey, Error> {
        Ok(match s {
            "id" => RuleKey::Id,
            "email" => RuleKey::Email,
            "first_name" => RuleKey::FirstName,
            "last_name" => RuleKey::LastName,
            "is_premium" => RuleKey::IsPremium,
            "country_code" => RuleKey::CountryCode,
            _ => match s.strip_prefix(ATTRIBUTES_PREFIX) {
                Some(name) if !name.is_empty() => RuleKey::Attribute(name.to_owned()),
                _ => return Err(Error::UnknownRuleKey(s.to_owned())),
            },
        })
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKey::Id => f.write_str("id"),
            RuleKey::Email => f.write_str("email"),
            RuleKey::FirstName => f.write_str("first_name"),
            RuleKey::LastName => f.write_str("last_name"),
            RuleKey::IsPremium => f.write_str("is_premium"),
            RuleKey::CountryCode => f.write_str("country_code"),
            RuleKey::Attribute(name) => write!(f, "{ATTRIBUTES_PREFIX}{name}"),
        }
    }
}

/// Attribute conditions of a segment. A user matches when every condition holds.
///
/// Serialized as a JSON object mapping rule keys to required values, e.g.
/// `{"is_premium": true, "country_code": "US"}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, AttributeValue>",
    into = "BTreeMap<String, AttributeValue>"
)]
pub struct SegmentRules {
    conditions: BTreeMap<RuleKey, AttributeValue>,
}

impl SegmentRules {
    /// Build rules from a name → required value map, rejecting unknown keys.
    pub fn new<K, V>(rules: impl IntoIterator<Item = (K, V)>) -> Result<SegmentRules, Error>
    where
        K: AsRef<str>,
        V: Into<AttributeValue>,
    {
        let conditions = rules
            .into_iter()
            .map(|(key, value)| -> Result<(RuleKey, AttributeValue), Error> {
                Ok((key.as_ref().parse()?, value.into()))
            })
            .collect::<Result<BTreeMap<_, _>, Error>>()?;
        Ok(SegmentRules { conditions })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Return `true` if `user` satisfies every condition.
    ///
    /// Empty rules never match: a segment without conditions can only be joined through explicit
    /// membership.
    pub fn matches(&self, user: &User) -> bool {
        !self.conditions.is_empty()
            && self.conditions.iter().all(|(key, required)| {
                key.value_of(user)
                    .is_some_and(|actual| actual.satisfies(required))
            })
    }
}

impl TryFrom<BTreeMap<String, AttributeValue>> for SegmentRules {
    type Error = Error;

    fn try_from(value: BTreeMap<String, AttributeValue>) -> Result<SegmentRules, Error> {
        SegmentRules::new(value)
    }
}

impl From<SegmentRules> for BTreeMap<String, AttributeValue> {
    fn from(value: SegmentRules) -> Self {
        value
            .conditions
            .into_iter()
            .map(|(key, required)| (key.to_string(), required))
            .collect()
    }
}
