use super::HyperparameterError;
use super::hyperparameter::Hyperparameter;
use super::value::HyperValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An insertion-ordered mapping from names to [`Hyperparameter`]s.
///
/// Assigning a raw value to an existing key updates that hyperparameter in place, so its
/// dtype, bounds and optimization space are preserved. Assigning a whole
/// [`Hyperparameter`] to an existing key merges its fields into the stored one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Hyperparameter>", into = "Vec<Hyperparameter>")]
pub struct HyperparameterSet {
    entries: Vec<Hyperparameter>,
    index: HashMap<String, usize>,
}

impl HyperparameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|h| h.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Hyperparameter> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Hyperparameter> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Hyperparameter> {
        self.index.get(name).map(|&i| &mut self.entries[i])
    }

    /// Looks up a hyperparameter, failing with [`HyperparameterError::UnknownKey`].
    pub fn require(&self, name: &str) -> Result<&Hyperparameter, HyperparameterError> {
        self.get(name)
            .ok_or_else(|| HyperparameterError::UnknownKey(name.to_string()))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Hyperparameter, HyperparameterError> {
        self.get_mut(name)
            .ok_or_else(|| HyperparameterError::UnknownKey(name.to_string()))
    }

    /// Inserts `hyperparameter` under `name`, merging into an existing entry.
    pub fn insert(&mut self, name: &str, mut hyperparameter: Hyperparameter) {
        if hyperparameter.name.is_empty() {
            hyperparameter.name = name.to_string();
        }
        match self.index.get(name) {
            Some(&i) => self.entries[i].update(&hyperparameter),
            None => {
                self.index.insert(name.to_string(), self.entries.len());
                self.entries.push(hyperparameter);
            }
        }
    }

    /// Assigns a raw value under `name`.
    ///
    /// Existing hyperparameters are updated in place (with dtype coercion); unknown names
    /// get a fresh hyperparameter whose dtype is inferred from the value.
    pub fn insert_value(
        &mut self,
        name: &str,
        value: impl Into<HyperValue>,
    ) -> Result<(), HyperparameterError> {
        match self.index.get(name) {
            Some(&i) => self.entries[i].set_value(value),
            None => {
                self.insert(name, Hyperparameter::new(name, value));
                Ok(())
            }
        }
    }

    pub fn value(&self, name: &str) -> Option<&HyperValue> {
        self.get(name).and_then(Hyperparameter::value)
    }

    pub fn f64(&self, name: &str) -> Result<f64, HyperparameterError> {
        self.require(name)?.as_f64()
    }

    pub fn i64(&self, name: &str) -> Result<i64, HyperparameterError> {
        self.require(name)?.as_i64()
    }

    pub fn bool(&self, name: &str) -> Result<bool, HyperparameterError> {
        self.require(name)?.as_bool()
    }

    pub fn f64_list(&self, name: &str) -> Result<Vec<f64>, HyperparameterError> {
        let h = self.require(name)?;
        h.value()
            .and_then(HyperValue::as_f64_list)
            .ok_or_else(|| HyperparameterError::WrongType {
                name: name.to_string(),
                expected: super::value::DType::List,
            })
    }

    /// Returns a deep copy of the selected keys, or of every key when `keys` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`HyperparameterError::UnknownKey`] for the first key that is not present.
    pub fn copy(&self, keys: Option<&[&str]>) -> Result<HyperparameterSet, HyperparameterError> {
        let mut out = HyperparameterSet::new();
        match keys {
            None => {
                for h in &self.entries {
                    out.insert(&h.name, h.copy());
                }
            }
            Some(keys) => {
                for key in keys {
                    out.insert(key, self.require(key)?.copy());
                }
            }
        }
        Ok(out)
    }

    /// Merges every hyperparameter of `other` into this set.
    pub fn update(&mut self, other: &HyperparameterSet) {
        for h in other.iter() {
            self.insert(&h.name, h.copy());
        }
    }
}

impl From<Vec<Hyperparameter>> for HyperparameterSet {
    fn from(entries: Vec<Hyperparameter>) -> Self {
        let mut set = HyperparameterSet::new();
        for h in entries {
            let name = h.name.clone();
            set.insert(&name, h);
        }
        set
    }
}

impl From<HyperparameterSet> for Vec<Hyperparameter> {
    fn from(set: HyperparameterSet) -> Self {
        set.entries
    }
}

impl FromIterator<Hyperparameter> for HyperparameterSet {
    fn from_iter<T: IntoIterator<Item = Hyperparameter>>(iter: T) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}
