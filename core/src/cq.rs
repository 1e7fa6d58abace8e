//! Continuous-query scheduling and execution.
//!
//! At every tick the scheduler claims each eligible continuous query
//! (aggregated SELECT with a GROUP BY time interval whose cadence has
//! elapsed), stamps its last-run time under the write lock, then runs
//! it off-lock: execute the current aligned window, write the rows back
//! as points, and recompute a bounded number of earlier windows.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use common::point::Point;
use common::time::{now_unix_nano, round, UnixNano};
use common::FieldValue;

use crate::catalog::ContinuousQuery;
use crate::error::{Error, Result};
use crate::node::{normalize_measurement, Node, Worker};
use crate::query::Row;

impl Node {
    /// Launches the continuous-query scheduler, waking every
    /// `check_interval`.
    pub fn start_continuous_queries(self: &Arc<Self>, check_interval: Duration) -> Result<()> {
        if check_interval.is_zero() {
            return Err(Error::Query(
                "continuous query check interval must be non-zero".to_string(),
            ));
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let node = Arc::clone(self);
        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(check_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Err(err) = node.run_continuous_queries() {
                        log::warn!("continuous query tick failed: {err}");
                    }
                }
                _ => return,
            }
        });

        self.write()?.cq_worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Runs every continuous query that is due.
    pub fn run_continuous_queries(&self) -> Result<()> {
        let now = now_unix_nano();

        let due: Vec<ContinuousQuery> = {
            let mut state = self.write()?;
            let mut due = Vec::new();
            let defaults: HashMap<String, String> = state
                .databases
                .iter()
                .map(|(name, db)| (name.clone(), db.default_retention_policy.clone()))
                .collect();
            for db in state.databases.values_mut() {
                let default_rp = defaults.get(&db.name).cloned().unwrap_or_default();
                for cq in db.continuous_queries.iter_mut() {
                    if !self.should_run_continuous_query(cq, now) {
                        continue;
                    }
                    cq.last_run = now;
                    let mut claimed = cq.clone();
                    // Resolve the write-back policy against what is now
                    // the database default.
                    if claimed.into_rp.is_empty() {
                        claimed.into_rp = default_rp.clone();
                    }
                    due.push(claimed);
                }
            }
            due
        };

        for cq in due {
            self.run_continuous_query(&cq);
        }
        Ok(())
    }

    /// True if the query's cadence has elapsed. Eligible queries are
    /// aggregated and grouped by a time interval; the cadence is the
    /// interval divided by the runs-per-interval setting, floored at the
    /// configured minimum.
    fn should_run_continuous_query(&self, cq: &ContinuousQuery, now: UnixNano) -> bool {
        let Some(statement) = cq.statement.as_ref() else {
            return false;
        };
        if !statement.select.is_aggregated() {
            return false;
        }
        let Some(interval) = statement.select.group_by_interval else {
            return false;
        };
        if interval <= 0 {
            return false;
        }

        let mut every = interval / self.cq_config.compute_runs_per_interval.max(1);
        if every < self.cq_config.compute_no_more_than {
            every = self.cq_config.compute_no_more_than;
        }
        cq.last_run + every <= now
    }

    /// Executes one continuous query over its current window and then
    /// recomputes up to `recompute_previous_n` earlier windows, stopping
    /// once a window is older than `recompute_no_older_than`.
    /// Execution per query is serialized by a dedicated lock.
    fn run_continuous_query(&self, cq: &ContinuousQuery) {
        let Some(statement) = cq.statement.as_ref() else {
            return;
        };
        let Some(interval) = statement.select.group_by_interval.filter(|i| *i > 0) else {
            return;
        };

        let lock = self.continuous_query_lock(&format!("{}.{}", statement.database, cq.name()));
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let mut select = statement.select.clone();
        {
            let state = match self.read() {
                Ok(state) => state,
                Err(err) => {
                    log::error!("cq {}: {err}", cq.name());
                    return;
                }
            };
            if let Err(err) =
                normalize_measurement(&state, &mut select.source, &statement.database)
            {
                log::warn!("cq {}: {err}", cq.name());
                return;
            }
        }

        let now = now_unix_nano();
        let mut start = round(now, interval);
        if start > now {
            start -= interval;
        }

        select.set_time_range(start, start + interval);
        if let Err(err) = self.run_query_and_write_back(&select, cq) {
            log::warn!("cq error: {err}; running: {}", cq.query);
        }

        for _ in 0..self.cq_config.recompute_previous_n {
            if now - start > self.cq_config.recompute_no_older_than {
                return;
            }
            let previous = start - interval;
            select.set_time_range(previous, start);
            if let Err(err) = self.run_query_and_write_back(&select, cq) {
                log::warn!("cq error: {err}; running: {}", cq.query);
            }
            start = previous;
        }
    }

    fn continuous_query_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.cq_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn run_query_and_write_back(
        &self,
        select: &crate::query::SelectStatement,
        cq: &ContinuousQuery,
    ) -> Result<()> {
        let plan = self.plan_select(select)?;
        let rows = plan.execute()?;

        for row in rows {
            let points = match convert_row_to_points(&cq.into_measurement, &row) {
                Ok(points) => points,
                Err(err) => {
                    log::warn!("cq {}: {err}", cq.name());
                    continue;
                }
            };
            if points.is_empty() {
                continue;
            }
            if let Err(err) = self.write_series(&cq.into_db, &cq.into_rp, &points) {
                log::warn!("cq {} write: {err}", cq.name());
            }
        }
        Ok(())
    }
}

/// Converts a result row back into points: the `time` column becomes
/// the timestamp, the row's tags become tags, and every other column
/// becomes a field value.
fn convert_row_to_points(measurement: &str, row: &Row) -> Result<Vec<Point>> {
    let Some(time_index) = row.columns.iter().position(|c| c == "time") else {
        return Err(Error::Query("no time column in result".to_string()));
    };

    let mut points = Vec::with_capacity(row.values.len());
    for line in &row.values {
        let Some(Some(FieldValue::Integer(timestamp))) = line.get(time_index) else {
            continue;
        };
        let mut values = HashMap::new();
        for (i, column) in row.columns.iter().enumerate() {
            if i == time_index {
                continue;
            }
            if let Some(Some(value)) = line.get(i) {
                values.insert(column.clone(), value.clone());
            }
        }
        if values.is_empty() {
            continue;
        }
        points.push(Point {
            name: measurement.to_string(),
            tags: row.tags.clone(),
            timestamp: *timestamp,
            values,
        });
    }
    Ok(points)
}
