use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One-to-one map between keys and values.
///
/// Inserting a pair evicts any previous pair that owned either side, so
/// neither a key nor a value is ever claimed twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiMap<K, V> {
    forward: BTreeMap<K, V>,
    backward: BTreeMap<V, K>,
}

impl<K, V> Default for BiMap<K, V> {
    fn default() -> Self {
        Self {
            forward: BTreeMap::new(),
            backward: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Ord + Clone> BiMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `key` and `value`, returning `true` if the map changed.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.forward.get(&key) == Some(&value) {
            return false;
        }
        if let Some(old_value) = self.forward.remove(&key) {
            self.backward.remove(&old_value);
        }
        if let Some(old_key) = self.backward.remove(&value) {
            self.forward.remove(&old_key);
        }
        self.forward.insert(key.clone(), value.clone());
        self.backward.insert(value, key);
        true
    }

    pub fn get_by_key(&self, key: &K) -> Option<&V> {
        self.forward.get(key)
    }

    pub fn get_by_value(&self, value: &V) -> Option<&K> {
        self.backward.get(value)
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.backward.contains_key(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.forward.iter()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl<K, V> Serialize for BiMap<K, V>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.forward.iter())
    }
}

impl<'de, K, V> Deserialize<'de> for BiMap<K, V>
where
    K: Deserialize<'de> + Ord + Clone,
    V: Deserialize<'de> + Ord + Clone,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        let mut map = BiMap::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        Ok(map)
    }
}
