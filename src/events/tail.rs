use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Event, EventBus, EventLog};
use crate::errors::PersistenceError;

/// Follows the durable log by polling.
///
/// Lets a process that is not running a workflow observe it: `anvil events
/// --follow` prints from it and `anvil serve` pumps it into a local bus.
pub struct LogTailer {
    log: Arc<dyn EventLog>,
    interval: Duration,
    /// Next seq to read, per workflow
    cursors: HashMap<String, u64>,
}

impl LogTailer {
    pub fn new(log: Arc<dyn EventLog>, interval: Duration) -> Self {
        Self {
            log,
            interval,
            cursors: HashMap::new(),
        }
    }

    /// Start following `workflow_id` at `from_seq`.
    pub fn follow(&mut self, workflow_id: &str, from_seq: u64) {
        self.cursors.insert(workflow_id.to_string(), from_seq.max(1));
    }

    /// Events of one workflow appended since the last poll.
    pub async fn poll(&mut self, workflow_id: &str) -> Result<Vec<Event>, PersistenceError> {
        let from = self.cursors.get(workflow_id).copied().unwrap_or(1);
        let events = self.log.read(workflow_id, from).await?;
        if let Some(last) = events.last() {
            self.cursors.insert(workflow_id.to_string(), last.seq + 1);
        }
        Ok(events)
    }

    /// New events of every workflow in the log, discovering workflows as
    /// they appear. Workflows already known start at their cursor; new ones
    /// start after their current last event unless `from_start` is set.
    pub async fn poll_all(&mut self, from_start: bool) -> Result<Vec<Event>, PersistenceError> {
        let mut out = Vec::new();
        for record in self.log.workflows().await? {
            let cursor = match self.cursors.get(&record.id) {
                Some(cursor) => *cursor,
                None => {
                    let start = if from_start { 1 } else { record.last_seq + 1 };
                    self.cursors.insert(record.id.clone(), start);
                    start
                }
            };
            if record.last_seq >= cursor {
                out.extend(self.poll(&record.id).await?);
            }
        }
        Ok(out)
    }

    /// Publish new log events into `bus` until `cancel` fires.
    pub async fn pump(mut self, bus: EventBus, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_all(false).await {
                        Ok(events) => {
                            if !events.is_empty() {
                                debug!(count = events.len(), "tailer publishing events");
                            }
                            for event in events {
                                bus.publish(event);
                            }
                        }
                        Err(e) => warn!(error = %e, "log tail failed"),
                    }
                }
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
