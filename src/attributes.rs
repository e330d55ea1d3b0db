use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing free-form user attributes.
///
/// Keys are attribute names. Segment rules can refer to them as `attributes.<name>`.
///
/// # Examples
/// ```
/// # use abtest_core::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("beta_tester".to_owned(), true.into()),
///     ("plan".to_owned(), "team".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of a user attribute or of a segment rule.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Return `true` if this attribute satisfies a rule requiring `required`.
    ///
    /// Values of the same type compare by equality. Booleans also match the numbers `1` and `0`,
    /// so rules written as `{"is_premium": 1}` keep working. `Null` never satisfies a rule.
    pub fn satisfies(&self, required: &AttributeValue) -> bool {
        match (self, required) {
            (AttributeValue::Null, _) | (_, AttributeValue::Null) => false,
            (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
            (AttributeValue::Number(a), AttributeValue::Number(b)) => a == b,
            (AttributeValue::Boolean(a), AttributeValue::Boolean(b)) => a == b,
            (AttributeValue::Boolean(b), AttributeValue::Number(n))
            | (AttributeValue::Number(n), AttributeValue::Boolean(b)) => {
                *n == if *b { 1.0 } else { 0.0 }
            }
            _ => false,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<Option<String>> for AttributeValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(AttributeValue::Null, AttributeValue::String)
    }
}
