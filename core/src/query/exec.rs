//! Local SELECT execution.
//!
//! The coordinator plans a statement under its read lock: it resolves
//! the measurement, snapshots the field codec, and collects one source
//! per (owned shard, matching series). The plan then executes without
//! the lock, reading from the shard stores directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common::point::Tags;
use common::time::{truncate, UnixNano};
use common::FieldValue;
use serde::Serialize;

use super::ast::{Aggregate, SelectField, SelectStatement};
use crate::codec::FieldCodec;
use crate::error::{Error, Result};
use crate::shard::ShardStore;

/// One result cell; `None` marks a column with no value.
pub type RowValue = Option<FieldValue>;

/// A result row set: one measurement and tag set with tabular values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub name: String,
    pub tags: Tags,
    pub columns: Vec<String>,
    pub values: Vec<Vec<RowValue>>,
}

/// A series to read during execution: its id, tags, and the store of
/// the shard holding it.
pub struct SeriesSource {
    pub series_id: u32,
    pub tags: Tags,
    pub store: Arc<ShardStore>,
}

/// An executable SELECT bound to local shard stores.
pub struct SelectPlan {
    pub statement: SelectStatement,
    pub measurement: String,
    pub codec: FieldCodec,
    pub sources: Vec<SeriesSource>,
}

impl SelectPlan {
    /// Runs the plan and returns its rows.
    pub fn execute(&self) -> Result<Vec<Row>> {
        if self
            .statement
            .fields
            .iter()
            .any(|f| matches!(f, SelectField::Wildcard))
        {
            return Err(Error::Query(
                "wildcard must be expanded before execution".to_string(),
            ));
        }
        if self.statement.is_aggregated() {
            self.execute_aggregate()
        } else {
            self.execute_raw()
        }
    }

    fn time_bounds(&self) -> (UnixNano, UnixNano) {
        (
            self.statement.time_start.unwrap_or(i64::MIN + 1),
            self.statement.time_end.unwrap_or(i64::MAX),
        )
    }

    /// Raw select: one row per series, one value line per stored point.
    fn execute_raw(&self) -> Result<Vec<Row>> {
        let (start, end) = self.time_bounds();
        let field_names: Vec<String> = self
            .statement
            .fields
            .iter()
            .filter_map(|f| match f {
                SelectField::Field { name, .. } => Some(name.clone()),
                SelectField::Wildcard => None,
            })
            .collect();

        // Merge points per series across shards.
        let mut by_series: BTreeMap<u32, (Tags, BTreeMap<UnixNano, HashMap<String, FieldValue>>)> =
            BTreeMap::new();
        for source in &self.sources {
            let points = source.store.read_range(source.series_id, start, end)?;
            let entry = by_series
                .entry(source.series_id)
                .or_insert_with(|| (source.tags.clone(), BTreeMap::new()));
            for (ts, data) in points {
                entry.1.insert(ts, self.codec.decode_fields_by_name(&data)?);
            }
        }

        let mut rows = Vec::new();
        for (_, (tags, points)) in by_series {
            if points.is_empty() {
                continue;
            }
            let mut columns = vec!["time".to_string()];
            columns.extend(field_names.iter().cloned());
            let values = points
                .into_iter()
                .map(|(ts, fields)| {
                    let mut line: Vec<RowValue> = vec![Some(FieldValue::Integer(ts))];
                    for name in &field_names {
                        line.push(fields.get(name).cloned());
                    }
                    line
                })
                .collect();
            rows.push(Row {
                name: self.measurement.clone(),
                tags,
                columns,
                values,
            });
        }
        Ok(rows)
    }

    /// Aggregated select: buckets keyed by group tags and the GROUP BY
    /// time window.
    fn execute_aggregate(&self) -> Result<Vec<Row>> {
        let (start, end) = self.time_bounds();
        let interval = self.statement.group_by_interval;

        type Samples = Vec<(UnixNano, FieldValue)>;
        // group tags -> bucket time -> field -> samples
        let mut buckets: BTreeMap<Vec<String>, BTreeMap<UnixNano, HashMap<String, Samples>>> =
            BTreeMap::new();

        for source in &self.sources {
            let group_key: Vec<String> = self
                .statement
                .group_by_tags
                .iter()
                .map(|key| source.tags.get(key).cloned().unwrap_or_default())
                .collect();
            let points = source.store.read_range(source.series_id, start, end)?;
            for (ts, data) in points {
                let bucket = match interval {
                    Some(i) => truncate(ts, i),
                    None => self.statement.time_start.unwrap_or(0),
                };
                let fields = self.codec.decode_fields_by_name(&data)?;
                let slot = buckets
                    .entry(group_key.clone())
                    .or_default()
                    .entry(bucket)
                    .or_default();
                for (name, value) in fields {
                    slot.entry(name).or_default().push((ts, value));
                }
            }
        }

        let mut columns = vec!["time".to_string()];
        for field in &self.statement.fields {
            columns.push(field.column_name());
        }

        let mut rows = Vec::new();
        for (group_key, windows) in buckets {
            let tags: Tags = self
                .statement
                .group_by_tags
                .iter()
                .cloned()
                .zip(group_key)
                .collect();
            let mut values = Vec::new();
            for (bucket, mut fields) in windows {
                let mut line: Vec<RowValue> = vec![Some(FieldValue::Integer(bucket))];
                for field in &self.statement.fields {
                    let SelectField::Field {
                        function: Some(function),
                        name,
                        ..
                    } = field
                    else {
                        continue;
                    };
                    let samples = fields.remove(name).unwrap_or_default();
                    line.push(apply_aggregate(*function, samples));
                }
                values.push(line);
            }
            rows.push(Row {
                name: self.measurement.clone(),
                tags,
                columns: columns.clone(),
                values,
            });
        }
        Ok(rows)
    }
}

fn apply_aggregate(function: Aggregate, mut samples: Vec<(UnixNano, FieldValue)>) -> RowValue {
    if samples.is_empty() {
        return match function {
            Aggregate::Count => Some(FieldValue::Integer(0)),
            _ => None,
        };
    }
    samples.sort_by_key(|(ts, _)| *ts);
    match function {
        Aggregate::Count => Some(FieldValue::Integer(samples.len() as i64)),
        Aggregate::First => samples.first().map(|(_, v)| v.clone()),
        Aggregate::Last => samples.last().map(|(_, v)| v.clone()),
        Aggregate::Sum => {
            if samples
                .iter()
                .all(|(_, v)| matches!(v, FieldValue::Integer(_)))
            {
                let sum = samples
                    .iter()
                    .filter_map(|(_, v)| match v {
                        FieldValue::Integer(n) => Some(*n),
                        _ => None,
                    })
                    .sum::<i64>();
                Some(FieldValue::Integer(sum))
            } else {
                let sum: f64 = samples.iter().filter_map(|(_, v)| v.as_f64()).sum();
                Some(FieldValue::Float(sum))
            }
        }
        Aggregate::Mean => {
            let numeric: Vec<f64> = samples.iter().filter_map(|(_, v)| v.as_f64()).collect();
            if numeric.is_empty() {
                None
            } else {
                Some(FieldValue::Float(
                    numeric.iter().sum::<f64>() / numeric.len() as f64,
                ))
            }
        }
        Aggregate::Min => samples
            .iter()
            .filter(|(_, v)| v.as_f64().is_some())
            .min_by(|(_, a), (_, b)| {
                a.as_f64()
                    .partial_cmp(&b.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, v)| v.clone()),
        Aggregate::Max => samples
            .iter()
            .filter(|(_, v)| v.as_f64().is_some())
            .max_by(|(_, a), (_, b)| {
                a.as_f64()
                    .partial_cmp(&b.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, v)| v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Measurement;
    use common::FieldType;
    use tempfile::TempDir;

    fn plan_for(
        statement: SelectStatement,
        samples: &[(u32, UnixNano, f64)],
        tags_for: impl Fn(u32) -> Tags,
    ) -> (TempDir, SelectPlan) {
        let tmp = TempDir::new().unwrap();
        let mut m = Measurement::new("cpu");
        m.create_field_if_not_exists("value", FieldType::Float)
            .unwrap();
        let codec = FieldCodec::new(&m);

        let store = Arc::new(ShardStore::open(tmp.path().join("1")).unwrap());
        let mut seen = std::collections::BTreeSet::new();
        for (series, ts, v) in samples {
            let mut values = HashMap::new();
            values.insert("value".to_string(), FieldValue::Float(*v));
            let encoded = codec.encode_fields(&values).unwrap();
            store.write_series(*series, *ts, &encoded, true).unwrap();
            seen.insert(*series);
        }

        let sources = seen
            .into_iter()
            .map(|series_id| SeriesSource {
                series_id,
                tags: tags_for(series_id),
                store: Arc::clone(&store),
            })
            .collect();

        let plan = SelectPlan {
            statement,
            measurement: "cpu".to_string(),
            codec,
            sources,
        };
        (tmp, plan)
    }

    fn host_tags(series: u32) -> Tags {
        let mut tags = Tags::new();
        tags.insert("host".into(), format!("h{series}"));
        tags
    }

    #[test]
    fn raw_select_returns_points_per_series() {
        let statement = SelectStatement {
            fields: vec![SelectField::Field {
                function: None,
                name: "value".into(),
                alias: None,
            }],
            ..SelectStatement::default()
        };
        let (_tmp, plan) = plan_for(
            statement,
            &[(1, 10, 1.0), (1, 20, 2.0), (2, 15, 9.0)],
            host_tags,
        );

        let rows = plan.execute().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns, vec!["time", "value"]);
        assert_eq!(rows[0].values.len(), 2);
        assert_eq!(rows[0].values[0][0], Some(FieldValue::Integer(10)));
        assert_eq!(rows[0].values[0][1], Some(FieldValue::Float(1.0)));
    }

    #[test]
    fn aggregate_buckets_by_time_window() {
        let statement = SelectStatement {
            fields: vec![
                SelectField::Field {
                    function: Some(Aggregate::Mean),
                    name: "value".into(),
                    alias: None,
                },
                SelectField::Field {
                    function: Some(Aggregate::Count),
                    name: "value".into(),
                    alias: None,
                },
            ],
            time_start: Some(0),
            time_end: Some(200),
            group_by_interval: Some(100),
            ..SelectStatement::default()
        };
        let (_tmp, plan) = plan_for(
            statement,
            &[(1, 10, 1.0), (1, 60, 3.0), (1, 150, 10.0)],
            |_| Tags::new(),
        );

        let rows = plan.execute().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec!["time", "mean", "count"]);
        assert_eq!(
            rows[0].values,
            vec![
                vec![
                    Some(FieldValue::Integer(0)),
                    Some(FieldValue::Float(2.0)),
                    Some(FieldValue::Integer(2)),
                ],
                vec![
                    Some(FieldValue::Integer(100)),
                    Some(FieldValue::Float(10.0)),
                    Some(FieldValue::Integer(1)),
                ],
            ]
        );
    }

    #[test]
    fn aggregate_groups_by_tag() {
        let statement = SelectStatement {
            fields: vec![SelectField::Field {
                function: Some(Aggregate::Sum),
                name: "value".into(),
                alias: None,
            }],
            time_start: Some(0),
            time_end: Some(100),
            group_by_interval: Some(100),
            group_by_tags: vec!["host".into()],
            ..SelectStatement::default()
        };
        let (_tmp, plan) = plan_for(
            statement,
            &[(1, 10, 1.5), (2, 20, 4.0), (2, 30, 1.0)],
            host_tags,
        );

        let rows = plan.execute().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tags.get("host").map(String::as_str), Some("h1"));
        assert_eq!(rows[0].values[0][1], Some(FieldValue::Float(1.5)));
        assert_eq!(rows[1].tags.get("host").map(String::as_str), Some("h2"));
        assert_eq!(rows[1].values[0][1], Some(FieldValue::Float(5.0)));
    }

    #[test]
    fn time_bounds_filter_points() {
        let statement = SelectStatement {
            fields: vec![SelectField::Field {
                function: None,
                name: "value".into(),
                alias: None,
            }],
            time_start: Some(15),
            time_end: Some(25),
            ..SelectStatement::default()
        };
        let (_tmp, plan) = plan_for(
            statement,
            &[(1, 10, 1.0), (1, 20, 2.0), (1, 30, 3.0)],
            host_tags,
        );

        let rows = plan.execute().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values.len(), 1);
        assert_eq!(rows[0].values[0][0], Some(FieldValue::Integer(20)));
    }
}
