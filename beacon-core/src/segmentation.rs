//! Ordered string key/value dimensions
//!
//! [`Segmentation`] is attached to events for server-side breakdowns and is
//! reused as the `custom` map of user details and exception reports.
//!
//! Mutations report whether they changed anything instead of firing a
//! callback: setting a key to the value it already holds, or removing an
//! absent key, returns `false`. Owners that track dirtiness (see
//! [`crate::types::UserDetails`]) act on that return value.
//!
//! Insertion order is kept for display, but the wire form is a JSON object and
//! consumers must not rely on ordering.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Insertion-ordered map of string dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segmentation {
    items: Vec<(String, String)>,
}

impl Segmentation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`. Returns `true` if the map changed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();

        match self.position(&key) {
            Some(idx) if self.items[idx].1 == value => false,
            Some(idx) => {
                self.items[idx].1 = value;
                true
            }
            None => {
                self.items.push((key, value));
                true
            }
        }
    }

    /// Indexer-style assignment: `None` removes the key.
    pub fn set_opt(&mut self, key: impl Into<String>, value: Option<String>) -> bool {
        let key = key.into();
        match value {
            Some(value) => self.set(key, value),
            None => self.remove(&key),
        }
    }

    /// Remove `key`. Returns `true` if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(idx) => {
                self.items.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remove every entry. Returns `true` if anything was removed.
    pub fn clear(&mut self) -> bool {
        let changed = !self.items.is_empty();
        self.items.clear();
        changed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|idx| self.items[idx].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|(k, _)| k == key)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Segmentation {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut seg = Segmentation::new();
        for (k, v) in iter {
            seg.set(k, v);
        }
        seg
    }
}

impl Serialize for Segmentation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.items.len()))?;
        for (k, v) in &self.items {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Segmentation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SegmentationVisitor;

        impl<'de> Visitor<'de> for SegmentationVisitor {
            type Value = Segmentation;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut seg = Segmentation::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    seg.set(k, v);
                }
                Ok(seg)
            }
        }

        deserializer.deserialize_map(SegmentationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut seg = Segmentation::new();
        assert!(seg.set("Test", "B"));
        assert_eq!(seg.get("Test"), Some("B"));
    }

    #[test]
    fn test_set_same_value_is_not_a_change() {
        let mut seg = Segmentation::new();
        seg.set("Test", "B");
        assert!(!seg.set("Test", "B"));
        assert!(!seg.set_opt("Test", Some("B".to_string())));
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn test_set_new_value_is_a_change() {
        let mut seg = Segmentation::new();
        seg.set("Test", "B");
        assert!(seg.set("Test", "C"));
        assert_eq!(seg.get("Test"), Some("C"));
    }

    #[test]
    fn test_remove() {
        let mut seg = Segmentation::new();
        seg.set("Test", "B");
        assert!(seg.remove("Test"));
        assert!(seg.is_empty());
        assert!(!seg.remove("Test"));
    }

    #[test]
    fn test_set_none_removes() {
        let mut seg = Segmentation::new();
        seg.set("Test", "B");
        assert!(seg.set_opt("Test", None));
        assert_eq!(seg.len(), 0);
        assert!(!seg.set_opt("Missing", None));
    }

    #[test]
    fn test_clear() {
        let mut seg: Segmentation = [("a", "1"), ("b", "2")].into_iter().collect();
        assert!(seg.clear());
        assert!(!seg.clear());
    }

    #[test]
    fn test_insertion_order() {
        let seg: Segmentation = [("z", "1"), ("a", "2"), ("m", "3")].into_iter().collect();
        let keys: Vec<_> = seg.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_serializes_as_object() {
        let seg: Segmentation = [("name", "Home"), ("visit", "1")].into_iter().collect();
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json, serde_json::json!({"name": "Home", "visit": "1"}));

        let back: Segmentation = serde_json::from_value(json).unwrap();
        assert_eq!(back.get("name"), Some("Home"));
    }
}
