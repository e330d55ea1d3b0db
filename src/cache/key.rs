use std::{collections::BTreeMap, fmt};

use derive_more::From;

use crate::model::{ExperimentId, SegmentId, UserId};

/// Key of a cache entry, derived from a [`KeyMaterial`] by a [`KeyDerivation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> CacheKey {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entity a cached value was derived from. Invalidating a dependency drops every entry that
/// declared it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From)]
pub enum Dependency {
    Experiment(ExperimentId),
    Segment(SegmentId),
    User(UserId),
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Experiment(id) => write!(f, "experiment:{id}"),
            Dependency::Segment(id) => write!(f, "segment:{id}"),
            Dependency::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl log::kv::ToValue for Dependency {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

/// Everything that identifies a cached call: the operation name, its named arguments, and the
/// entities the result depends on.
///
/// Arguments are kept sorted by name, so the order in which they are added does not affect the
/// derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    operation: &'static str,
    args: BTreeMap<&'static str, String>,
    dependencies: Vec<Dependency>,
}

impl KeyMaterial {
    pub fn new(operation: &'static str) -> KeyMaterial {
        KeyMaterial {
            operation,
            args: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    /// Add a named argument. Values are captured through their `Display` form.
    pub fn arg(mut self, name: &'static str, value: impl fmt::Display) -> KeyMaterial {
        self.args.insert(name, value.to_string());
        self
    }

    /// Declare an entity the cached value depends on.
    pub fn depends_on(mut self, dependency: impl Into<Dependency>) -> KeyMaterial {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Arguments in name order.
    pub fn args(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.args.iter().map(|(name, value)| (*name, value.as_str()))
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Stable serialization of the arguments: a JSON object with keys in name order.
    pub fn serialized_args(&self) -> String {
        let args = self
            .args()
            .map(|(name, value)| (name.to_owned(), serde_json::Value::from(value)))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(args).to_string()
    }
}

/// Turns [`KeyMaterial`] into a [`CacheKey`].
///
/// Injected into caches so that key stability is an explicit contract rather than a side effect
/// of how the calling code happens to be written.
pub trait KeyDerivation: Send + Sync {
    fn derive_key(&self, material: &KeyMaterial) -> CacheKey;
}

/// The default key derivation: `<operation>:<md5 of serialized arguments>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5KeyDerivation;

impl KeyDerivation for Md5KeyDerivation {
    fn derive_key(&self, material: &KeyMaterial) -> CacheKey {
        let digest = md5::compute(material.serialized_args());
        CacheKey(format!("{}:{:x}", material.operation(), digest))
    }
}

impl<T: Fn(&KeyMaterial) -> CacheKey + Send + Sync> KeyDerivation for T {
    fn derive_key(&self, material: &KeyMaterial) -> CacheKey {
        self(material)
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheKey, Dependency, KeyDerivation, KeyMaterial, Md5KeyDerivation};
    use crate::model::{ExperimentId, SegmentId};

    #[test]
    fn argument_order_does_not_matter() {
        let a = KeyMaterial::new("get_experiment")
            .arg("experiment_id", 7)
            .arg("include_variants", true);
        let b = KeyMaterial::new("get_experiment")
            .arg("include_variants", true)
            .arg("experiment_id", 7);
        assert_eq!(
            a.serialized_args(),
            r#"{"experiment_id":"7","include_variants":"true"}"#
        );
        assert_eq!(
            Md5KeyDerivation.derive_key(&a),
            Md5KeyDerivation.derive_key(&b)
        );
    }

    #[test]
    fn md5_key_is_stable() {
        let material = KeyMaterial::new("get_experiment").arg("experiment_id", 7);
        let key = Md5KeyDerivation.derive_key(&material);
        assert_eq!(
            key.as_str(),
            format!("get_experiment:{:x}", md5::compute(r#"{"experiment_id":"7"}"#))
        );
    }

    #[test]
    fn operation_is_part_of_the_key() {
        let a = KeyMaterial::new("get_experiment").arg("id", 1);
        let b = KeyMaterial::new("get_segment").arg("id", 1);
        assert_ne!(
            Md5KeyDerivation.derive_key(&a),
            Md5KeyDerivation.derive_key(&b)
        );
    }

    #[test]
    fn closures_derive_keys() {
        let plain = |material: &KeyMaterial| {
            CacheKey::new(format!("{}|{}", material.operation(), material.serialized_args()))
        };
        let material = KeyMaterial::new("op").arg("b", 2).arg("a", 1);
        assert_eq!(plain.derive_key(&material).as_str(), r#"op|{"a":"1","b":"2"}"#);
    }

    #[test]
    fn separators_inside_values_do_not_collide() {
        let nested = KeyMaterial::new("op").arg("a", "x:b=y");
        let split = KeyMaterial::new("op").arg("a", "x").arg("b", "y");
        assert_ne!(nested.serialized_args(), split.serialized_args());
        assert_ne!(
            Md5KeyDerivation.derive_key(&nested),
            Md5KeyDerivation.derive_key(&split)
        );

        let quoted = KeyMaterial::new("op").arg("a", r#"x","b":"y"#);
        assert_ne!(quoted.serialized_args(), split.serialized_args());
    }

    #[test]
    fn dependencies_are_deduplicated() {
        let material = KeyMaterial::new("op")
            .depends_on(ExperimentId(1))
            .depends_on(SegmentId(1))
            .depends_on(ExperimentId(1));
        assert_eq!(
            material.dependencies(),
            &[
                Dependency::Experiment(ExperimentId(1)),
                Dependency::Segment(SegmentId(1))
            ]
        );
    }
}
