//! Case-insensitive header map.
//!
//! Names are folded to lowercase on the way in, so `Content-Type` and
//! `content-type` address the same entry and the last write wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header map with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any value stored under the same name.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(name.as_ref().to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(lowercase name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Headers> for BTreeMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.entries
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Headers
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.set(name, value);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.contains("Content-type"));
    }

    #[test]
    fn test_last_write_wins() {
        let mut headers = Headers::from([("Header-One", "1"), ("Header-Two", "222")]);
        headers.set("header-two", "2");
        headers.set("header-three", "3");

        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(
            pairs,
            vec![("header-one", "1"), ("header-three", "3"), ("header-two", "2")]
        );
    }

    #[test]
    fn test_merge_overwrites_same_names() {
        let mut base = Headers::from([("X-Test", "old"), ("Keep", "yes")]);
        base.merge(&Headers::from([("x-test", "new")]));
        assert_eq!(base.get("x-test"), Some("new"));
        assert_eq!(base.get("keep"), Some("yes"));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn test_deserialize_folds_case() {
        let headers: Headers = serde_yaml::from_str("X-Mock: \"1\"\nAccept: text/html\n").unwrap();
        assert_eq!(headers.get("x-mock"), Some("1"));
        assert_eq!(headers.get("accept"), Some("text/html"));
    }
}
