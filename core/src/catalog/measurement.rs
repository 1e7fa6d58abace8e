//! Measurements, fields and the series index.
//!
//! A measurement owns an ordered list of typed fields (the field id is
//! the on-disk key) and the series that have been written to it. The
//! tag-set and tag-value indexes are derived state, rebuilt after a
//! catalog load rather than persisted.

use std::collections::{BTreeSet, HashMap};

use common::point::{tag_set_key, Tags};
use common::FieldType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named, typed column of a measurement. The id is stable for the
/// lifetime of the measurement and is the encoded field key on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: u8,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// A measurement + tag-set combination with a stable 32-bit id.
/// Tag sets never change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: u32,
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(rename = "series")]
    pub series_by_id: HashMap<u32, Series>,

    #[serde(skip)]
    series_ids_by_tag_set: HashMap<String, u32>,
    #[serde(skip)]
    series_ids_by_tag_value: HashMap<String, HashMap<String, BTreeSet<u32>>>,
}

impl Measurement {
    pub fn new(name: &str) -> Measurement {
        Measurement {
            name: name.to_string(),
            ..Measurement::default()
        }
    }

    pub fn field(&self, id: u8) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Creates a field with the next free id. A field already present
    /// with another type is a conflict; ids are a single byte so a
    /// measurement holds at most 255 fields.
    pub fn create_field_if_not_exists(&mut self, name: &str, field_type: FieldType) -> Result<()> {
        if let Some(f) = self.field_by_name(name) {
            if f.field_type != field_type {
                return Err(Error::FieldTypeConflict {
                    field: name.to_string(),
                    existing: f.field_type,
                    given: field_type,
                });
            }
            return Ok(());
        }
        if self.fields.len() >= u8::MAX as usize {
            return Err(Error::FieldOverflow);
        }
        self.fields.push(Field {
            id: self.fields.len() as u8 + 1,
            name: name.to_string(),
            field_type,
        });
        Ok(())
    }

    /// Registers a series and indexes its tag set.
    pub fn add_series(&mut self, series: Series) {
        self.series_ids_by_tag_set
            .insert(tag_set_key(&series.tags), series.id);
        for (key, value) in &series.tags {
            self.series_ids_by_tag_value
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(series.id);
        }
        self.series_by_id.insert(series.id, series);
    }

    pub fn series_by_tags(&self, tags: &Tags) -> Option<&Series> {
        self.series_ids_by_tag_set
            .get(&tag_set_key(tags))
            .and_then(|id| self.series_by_id.get(id))
    }

    /// All series ids, ascending.
    pub fn series_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.series_by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Series ids whose tag set contains every `key = value` pair of the
    /// filter. An empty filter matches every series.
    pub fn series_ids_by_tags(&self, filter: &Tags) -> Vec<u32> {
        if filter.is_empty() {
            return self.series_ids();
        }
        let mut ids: Option<BTreeSet<u32>> = None;
        for (key, value) in filter {
            let matched = self
                .series_ids_by_tag_value
                .get(key)
                .and_then(|values| values.get(value))
                .cloned()
                .unwrap_or_default();
            ids = Some(match ids {
                None => matched,
                Some(prev) => prev.intersection(&matched).copied().collect(),
            });
            if ids.as_ref().map(|s| s.is_empty()).unwrap_or(false) {
                break;
            }
        }
        ids.unwrap_or_default().into_iter().collect()
    }

    /// Sorted tag keys across all series of this measurement.
    pub fn tag_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.series_ids_by_tag_value.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sorted distinct values for a tag key, restricted to the given
    /// series ids.
    pub fn tag_values(&self, key: &str, ids: &[u32]) -> Vec<String> {
        let Some(values) = self.series_ids_by_tag_value.get(key) else {
            return Vec::new();
        };
        let mut out: Vec<String> = values
            .iter()
            .filter(|(_, series)| ids.iter().any(|id| series.contains(id)))
            .map(|(value, _)| value.clone())
            .collect();
        out.sort();
        out
    }

    /// Sorted field names.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.iter().map(|f| f.name.clone()).collect();
        names.sort();
        names
    }

    /// Rebuilds the derived tag indexes from the persisted series map.
    pub fn rebuild_index(&mut self) {
        self.series_ids_by_tag_set.clear();
        self.series_ids_by_tag_value.clear();
        let series: Vec<Series> = self.series_by_id.values().cloned().collect();
        for s in series {
            self.series_ids_by_tag_set.insert(tag_set_key(&s.tags), s.id);
            for (key, value) in &s.tags {
                self.series_ids_by_tag_value
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(s.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn series(id: u32, pairs: &[(&str, &str)]) -> Series {
        Series {
            id,
            tags: tags(pairs),
        }
    }

    #[test]
    fn field_ids_are_stable_and_conflicts_detected() {
        let mut m = Measurement::new("cpu");
        m.create_field_if_not_exists("value", FieldType::Integer)
            .unwrap();
        m.create_field_if_not_exists("value", FieldType::Integer)
            .unwrap();
        assert_eq!(m.fields.len(), 1);
        assert_eq!(m.fields[0].id, 1);

        let err = m
            .create_field_if_not_exists("value", FieldType::Float)
            .unwrap_err();
        assert!(matches!(err, Error::FieldTypeConflict { .. }));

        m.create_field_if_not_exists("idle", FieldType::Float).unwrap();
        assert_eq!(m.field_by_name("idle").unwrap().id, 2);
    }

    #[test]
    fn field_overflow_after_255_fields() {
        let mut m = Measurement::new("wide");
        for i in 0..255 {
            m.create_field_if_not_exists(&format!("f{i}"), FieldType::Float)
                .unwrap();
        }
        let err = m
            .create_field_if_not_exists("one-more", FieldType::Float)
            .unwrap_err();
        assert!(matches!(err, Error::FieldOverflow));
    }

    #[test]
    fn series_lookup_by_tag_set() {
        let mut m = Measurement::new("cpu");
        m.add_series(series(1, &[("host", "a")]));
        m.add_series(series(2, &[("host", "b")]));

        assert_eq!(m.series_by_tags(&tags(&[("host", "a")])).unwrap().id, 1);
        assert!(m.series_by_tags(&tags(&[("host", "c")])).is_none());
        assert_eq!(m.series_ids(), vec![1, 2]);
    }

    #[test]
    fn tag_filter_intersects_pairs() {
        let mut m = Measurement::new("cpu");
        m.add_series(series(1, &[("host", "a"), ("region", "west")]));
        m.add_series(series(2, &[("host", "b"), ("region", "west")]));
        m.add_series(series(3, &[("host", "a"), ("region", "east")]));

        assert_eq!(m.series_ids_by_tags(&tags(&[("region", "west")])), vec![1, 2]);
        assert_eq!(
            m.series_ids_by_tags(&tags(&[("host", "a"), ("region", "west")])),
            vec![1]
        );
        assert!(m.series_ids_by_tags(&tags(&[("host", "z")])).is_empty());
    }

    #[test]
    fn rebuild_restores_derived_indexes() {
        let mut m = Measurement::new("cpu");
        m.add_series(series(7, &[("host", "a")]));

        let json = serde_json::to_string(&m).unwrap();
        let mut loaded: Measurement = serde_json::from_str(&json).unwrap();
        assert!(loaded.series_by_tags(&tags(&[("host", "a")])).is_none());

        loaded.rebuild_index();
        assert_eq!(loaded.series_by_tags(&tags(&[("host", "a")])).unwrap().id, 7);
        assert_eq!(loaded.tag_keys(), vec!["host".to_string()]);
    }
}
