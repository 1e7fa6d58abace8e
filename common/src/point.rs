use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::time::UnixNano;
use crate::value::FieldValue;

/// Tag key/value pairs for a series. A BTreeMap keeps iteration order
/// canonical so equal tag sets always produce equal keys.
pub type Tags = BTreeMap<String, String>;

/// A single sample to be written: measurement name, tag set, timestamp
/// and one or more field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    pub timestamp: UnixNano,
    pub values: HashMap<String, FieldValue>,
}

/// Canonical string key for a tag set. Two tag maps compare equal iff
/// their keys are equal.
pub fn tag_set_key(tags: &Tags) -> String {
    let mut key = String::new();
    for (k, v) in tags {
        key.push_str(k);
        key.push('\u{0}');
        key.push_str(v);
        key.push('\u{0}');
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_set_key_is_order_independent() {
        let mut a = Tags::new();
        a.insert("host".into(), "a".into());
        a.insert("region".into(), "west".into());

        let mut b = Tags::new();
        b.insert("region".into(), "west".into());
        b.insert("host".into(), "a".into());

        assert_eq!(tag_set_key(&a), tag_set_key(&b));
    }

    #[test]
    fn distinct_tag_sets_have_distinct_keys() {
        let mut a = Tags::new();
        a.insert("host".into(), "a".into());
        let mut b = Tags::new();
        b.insert("host".into(), "b".into());
        assert_ne!(tag_set_key(&a), tag_set_key(&b));
    }
}
