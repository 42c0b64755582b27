//! At-least-once delivery of new knowledge records to the sheet sink.
//!
//! The durable store's null synced-marker is the only record of what still
//! needs delivery. A run appends every unsynced record as one batch, retries
//! transient sink failures under the configured [`RetryPolicy`], and stamps
//! the batch synced only after the sink accepted it. A crash between the two
//! steps redelivers the batch on the next run.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collab::{SharedSink, SharedStore};
use crate::error::ServiceError;
use crate::retry::RetryPolicy;
use crate::tasks::{self, TaskHandle};
use crate::types::KnowledgeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced(usize),
    NothingToSync,
    /// No sink is configured.
    Disabled,
    /// Another run is in progress.
    Busy,
    /// The sink kept failing; records stay unsynced for the next run.
    Failed { attempts: u32 },
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Synced(n) => write!(f, "synced {n} record(s)"),
            SyncOutcome::NothingToSync => f.write_str("no new records"),
            SyncOutcome::Disabled => f.write_str("sync disabled"),
            SyncOutcome::Busy => f.write_str("sync already running"),
            SyncOutcome::Failed { attempts } => write!(f, "failed after {attempts} attempt(s)"),
        }
    }
}

pub struct SyncCoordinator {
    store: SharedStore,
    sink: Option<SharedSink>,
    policy: RetryPolicy,
    running: Mutex<()>,
}

impl SyncCoordinator {
    /// `sink = None` disables delivery (missing credentials); runs then report
    /// [`SyncOutcome::Disabled`] instead of failing.
    pub fn new(store: SharedStore, sink: Option<SharedSink>, policy: RetryPolicy) -> Self {
        if sink.is_none() {
            warn!(target: "skb::sync", "sheet sink not configured; sync disabled");
        }
        Self {
            store,
            sink,
            policy,
            running: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// One sync pass. Overlapping calls return [`SyncOutcome::Busy`].
    pub async fn sync_pending(&self) -> Result<SyncOutcome> {
        let Some(sink) = self.sink.as_ref() else {
            return Ok(SyncOutcome::Disabled);
        };
        let Ok(_running) = self.running.try_lock() else {
            info!(target: "skb::sync", "sync already in progress; skipping");
            return Ok(SyncOutcome::Busy);
        };
        let run = Uuid::new_v4();
        self.deliver(sink)
            .instrument(info_span!(target: "skb::sync", "sync_run", %run))
            .await
    }

    async fn deliver(&self, sink: &SharedSink) -> Result<SyncOutcome> {
        let records = self
            .store
            .query_unsynced()
            .await
            .context("query unsynced records")?;
        if records.is_empty() {
            info!(target: "skb::sync", "no new records");
            return Ok(SyncOutcome::NothingToSync);
        }

        let rows: Vec<Vec<String>> = records.iter().map(sheet_row).collect();
        let delivered = self
            .policy
            .run("sheet append", |attempt| {
                let sink = Arc::clone(sink);
                let rows = &rows;
                async move {
                    info!(
                        target: "skb::sync",
                        sink = sink.name(),
                        attempt,
                        rows = rows.len(),
                        "appending rows"
                    );
                    sink.append_rows(rows).await
                }
            })
            .await;

        if let Err(exhausted) = delivered {
            if matches!(exhausted.last, ServiceError::NotConfigured(_)) {
                warn!(target: "skb::sync", error = %exhausted.last, "sheet sink disabled itself");
                return Ok(SyncOutcome::Disabled);
            }
            error!(
                target: "skb::sync",
                attempts = exhausted.attempts,
                pending = records.len(),
                error = %exhausted.last,
                "sheet sync gave up; records stay pending"
            );
            return Ok(SyncOutcome::Failed {
                attempts: exhausted.attempts,
            });
        }

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        self.store
            .mark_synced(&ids)
            .await
            .context("mark records synced")?;
        info!(target: "skb::sync", count = ids.len(), "records synced");
        Ok(SyncOutcome::Synced(ids.len()))
    }
}

/// Sheet layout: id, created, category, problem, solution, message link.
pub fn sheet_row(record: &KnowledgeRecord) -> Vec<String> {
    vec![
        record.id.to_string(),
        record
            .created_at
            .format("%d.%m.%Y, %H:%M:%S")
            .to_string(),
        record.category.clone(),
        record.problem.clone(),
        record.solution.clone(),
        record
            .source_message_id
            .map(|id| format!("tg://msg?id={id}"))
            .unwrap_or_default(),
    ]
}

/// Drive [`SyncCoordinator::sync_pending`] every `interval` under supervision.
pub fn spawn_schedule(coordinator: Arc<SyncCoordinator>, interval: Duration) -> TaskHandle {
    tasks::spawn_periodic("sync.sheets", interval, move || {
        let coordinator = Arc::clone(&coordinator);
        async move {
            match coordinator.sync_pending().await {
                Ok(outcome) => info!(target: "skb::sync", %outcome, "scheduled sync finished"),
                Err(err) => warn!(target: "skb::sync", error = %err, "scheduled sync failed"),
            }
        }
    })
}
