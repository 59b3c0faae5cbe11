use super::{LwwRegister, ScalarValue};
use crate::Stamp;
use std::{collections::BTreeMap, fmt};

/// A string-keyed map with last-writer-wins entries.
///
/// Each key is an independent [`LwwRegister`]; concurrent writes to the same
/// key resolve by the shared rule (the greater [`Stamp`] holds the
/// register). Removal is a register write of "absent" rather
/// than a structural delete, so a removal can lose to a concurrent write the
/// same way any stale write does, and replicas never disagree about whether
/// a key exists.
#[derive(Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct LwwMap {
    entries: BTreeMap<String, LwwRegister<Option<ScalarValue>>>,
}

impl fmt::Debug for LwwMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{}}{:?}", self.entries)
    }
}

impl LwwMap {
    /// The current value under `key`, if the key is present.
    pub fn get(&self, key: &str) -> Option<&ScalarValue> {
        self.entries.get(key)?.value().as_ref()
    }

    /// Returns whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The number of present keys.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|reg| reg.value().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over present `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> + '_ {
        self.entries
            .iter()
            .filter_map(|(key, reg)| Some((key.as_str(), reg.value().as_ref()?)))
    }

    pub(crate) fn apply_set(&mut self, stamp: Stamp, key: &str, value: Option<ScalarValue>) {
        match self.entries.get_mut(key) {
            Some(reg) => {
                reg.write(value, stamp);
            }
            None => {
                self.entries
                    .insert(key.to_string(), LwwRegister::new(value, stamp));
            }
        }
    }
}
