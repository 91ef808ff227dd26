//! Liveness sweeper: reclaims work abandoned by a killed invocation.
//!
//! Runs at the top of every invocation. A `running` run whose heartbeat is
//! missing or older than the stale threshold, and a `running` output whose
//! last activity is older than it, are reset to `queued`. The reset is a
//! guarded status write, so sweeping twice changes nothing the second time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::storage::{BatchStore, StoreError};

/// What one sweep reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub runs_reclaimed: u64,
    pub outputs_reclaimed: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.runs_reclaimed == 0 && self.outputs_reclaimed == 0
    }
}

pub struct LivenessSweeper {
    store: Arc<dyn BatchStore>,
    stale_threshold: chrono::Duration,
    metrics: MetricsCollector,
}

impl LivenessSweeper {
    pub fn new(store: Arc<dyn BatchStore>, stale_threshold: chrono::Duration) -> Self {
        Self {
            store,
            stale_threshold,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn sweep(&self, batch_id: Uuid) -> Result<SweepReport, StoreError> {
        self.sweep_at(batch_id, Utc::now()).await
    }

    /// Sweeps as of `now`; records last active before `now - threshold` are stale.
    pub async fn sweep_at(
        &self,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, StoreError> {
        let stale_before = now - self.stale_threshold;

        let runs_reclaimed = self.store.reclaim_stale_runs(batch_id, stale_before).await?;
        let outputs_reclaimed = self
            .store
            .reclaim_stale_outputs(batch_id, stale_before)
            .await?;

        self.metrics.record_reclaimed("run", runs_reclaimed);
        self.metrics.record_reclaimed("output", outputs_reclaimed);

        let report = SweepReport {
            runs_reclaimed,
            outputs_reclaimed,
        };
        if report.is_empty() {
            debug!(batch_id = %batch_id, "Sweep found nothing stale");
        } else {
            info!(
                batch_id = %batch_id,
                runs = runs_reclaimed,
                outputs = outputs_reclaimed,
                "Reclaimed stale work"
            );
        }
        Ok(report)
    }
}
