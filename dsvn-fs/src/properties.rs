//! Property lists
//!
//! Used for revision properties and for per-node properties. Values are raw
//! bytes; names are ordered so the serialized form is deterministic.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property value
pub type PropertyValue = Vec<u8>;

/// Name → value mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    properties: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Value of `name`, if it is valid UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Insert or replace `name`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Property names in sorted order
    pub fn list(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = PropertySet::new();
        for (name, value) in iter {
            set.set(name, value);
        }
        set
    }
}

/// Well-known property names
pub mod svn_props {
    /// Who committed the revision
    pub const AUTHOR: &str = "svn:author";

    /// Commit message
    pub const LOG: &str = "svn:log";

    /// Commit time, RFC 3339 UTC; added at commit when absent
    pub const DATE: &str = "svn:date";

    pub const EXECUTABLE: &str = "svn:executable";

    /// Conventional value of [`EXECUTABLE`]
    pub const EXECUTABLE_VALUE: &str = "*";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_set_basic_operations() {
        let mut prop_set = PropertySet::new();

        assert!(prop_set.get("test").is_none());
        assert!(!prop_set.contains("test"));

        prop_set.set("test", "value");
        assert_eq!(prop_set.get_str("test"), Some("value"));
        assert!(prop_set.contains("test"));

        let removed = prop_set.remove("test");
        assert_eq!(removed, Some(b"value".to_vec()));
        assert!(prop_set.is_empty());
    }

    #[test]
    fn test_property_set_list_is_sorted() {
        let props: PropertySet = [("zeta", "1"), ("alpha", "2"), ("mid", "3")]
            .into_iter()
            .collect();
        assert_eq!(props.list(), vec!["alpha", "mid", "zeta"]);
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn test_binary_and_empty_values() {
        let mut props = PropertySet::new();
        props.set("empty", Vec::new());
        props.set("binary", vec![0u8, 159, 146, 150]);

        assert_eq!(props.get_str("empty"), Some(""));
        assert_eq!(props.get_str("binary"), None);
        assert_eq!(props.get("binary").map(|v| v.len()), Some(4));
    }

    #[test]
    fn test_property_set_bytes_roundtrip() {
        let mut props = PropertySet::new();
        props.set(svn_props::AUTHOR, "harry");
        props.set(svn_props::LOG, "x".repeat(4096));
        let decoded = PropertySet::from_bytes(&props.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, props);
        assert!(PropertySet::from_bytes(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_svn_standard_properties() {
        use svn_props::*;

        assert_eq!(DATE, "svn:date");
        assert_eq!(EXECUTABLE, "svn:executable");
        assert_eq!(EXECUTABLE_VALUE, "*");
    }
}
