//! Retention enforcement: periodically drops shard groups whose data
//! has aged past their policy.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::time::now_unix_nano;

use crate::error::{Error, Result};
use crate::node::{Node, Worker};

impl Node {
    /// Launches the retention worker, waking every `check_interval`.
    pub fn start_retention_enforcement(self: &Arc<Self>, check_interval: Duration) -> Result<()> {
        if check_interval.is_zero() {
            return Err(Error::Query(
                "retention check interval must be non-zero".to_string(),
            ));
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let node = Arc::clone(self);
        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(check_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => node.enforce_retention_policies(),
                _ => return,
            }
        });

        self.write()?.retention = Some(Worker { stop, handle });
        Ok(())
    }

    /// One retention sweep: broadcast a deletion for every shard group
    /// whose end time plus the policy duration has passed. Errors are
    /// logged; the sweep continues.
    pub fn enforce_retention_policies(&self) {
        log::debug!("retention policy enforcement check commencing");

        let now = now_unix_nano();
        let due = match self.read() {
            Ok(state) => {
                let mut due = Vec::new();
                for db in state.databases.values() {
                    for rp in db.policies.values() {
                        for group in &rp.shard_groups {
                            if group.end_time + rp.duration < now {
                                log::info!(
                                    "shard group {} (policy {}, database {}) due for deletion",
                                    group.id,
                                    rp.name,
                                    db.name
                                );
                                due.push((db.name.clone(), rp.name.clone(), group.id));
                            }
                        }
                    }
                }
                due
            }
            Err(err) => {
                log::error!("retention sweep aborted: {err}");
                return;
            }
        };

        for (database, policy, group_id) in due {
            if let Err(err) = self.delete_shard_group(&database, &policy, group_id) {
                log::warn!("failed to request deletion of shard group {group_id}: {err}");
            }
        }
    }
}
