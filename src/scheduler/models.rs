//! Persisted records the batch processor reads and writes.
//!
//! This module defines the durable contract between the processor and the
//! rest of the system:
//!
//! - `Batch`: a scheduled collection of runs
//! - `Run`: one look's worth of work within a batch
//! - `Output`: one concrete pose + shot-type + attempt generation unit
//! - `PipelineJob`: aggregate progress surfaced to the UI
//!
//! plus the read-only collaborators the expander consumes (`BatchItem`,
//! `Pose`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::shot_type::{PoseSlot, ShotType};

/// Error returned when a persisted status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status '{value}'")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Returns the persisted representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum! {
    /// Lifecycle of a batch.
    BatchStatus, "batch" {
        Running => "RUNNING",
        Complete => "COMPLETE",
        Failed => "FAILED",
    }
}

status_enum! {
    /// Lifecycle of a run: `queued` -> `running` -> `complete` | `failed`.
    RunStatus, "run" {
        Queued => "queued",
        Running => "running",
        Complete => "complete",
        Failed => "failed",
    }
}

status_enum! {
    /// Lifecycle of an output: `queued` -> `running` -> `complete` | `failed`.
    OutputStatus, "output" {
        Queued => "queued",
        Running => "running",
        Complete => "complete",
        Failed => "failed",
    }
}

status_enum! {
    /// Status of the externally owned pipeline job.
    PipelineJobStatus, "pipeline job" {
        Running => "RUNNING",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Canceled => "CANCELED",
        Paused => "PAUSED",
    }
}

status_enum! {
    /// Curation state of a pose in a brand library.
    CurationStatus, "curation" {
        Approved => "approved",
        Pending => "pending",
        Rejected => "rejected",
        Archived => "archived",
    }
}

impl RunStatus {
    /// Whether no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed)
    }
}

impl OutputStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputStatus::Complete | OutputStatus::Failed)
    }
}

impl PipelineJobStatus {
    /// Whether the job asks processors to stop picking up new work.
    pub fn halts_processing(&self) -> bool {
        matches!(self, PipelineJobStatus::Canceled | PipelineJobStatus::Paused)
    }
}

impl CurationStatus {
    /// Poses a processor may generate against.
    pub fn is_usable(&self) -> bool {
        matches!(self, CurationStatus::Approved | CurationStatus::Pending)
    }
}

/// Garment family a look belongs to; decides the product-type pose filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    Top,
    Trousers,
}

impl ProductType {
    /// Recognizes a product type tag; other garments yield `None`.
    pub fn parse_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "trousers" | "bottoms" | "pants" => Some(ProductType::Trousers),
            "top" | "tops" | "shirt" | "blouse" => Some(ProductType::Top),
            _ => None,
        }
    }

    /// Filter family for a look: anything that is not a trousers look is
    /// matched against top poses.
    pub fn from_tag(tag: Option<&str>) -> Self {
        tag.and_then(Self::parse_tag).unwrap_or(ProductType::Top)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Top => "top",
            ProductType::Trousers => "trousers",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of scheduled work spanning one or more looks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub status: BatchStatus,
    pub pipeline_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Configuration snapshot captured when the run was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Poses sampled per (item, shot type) pair.
    #[serde(default)]
    pub poses_per_shot_type: Option<usize>,
    /// Overrides the look's product type for pose filtering.
    #[serde(default)]
    pub product_type: Option<String>,
}

impl RunConfig {
    /// Resolves the per-shot pose count against the processor default.
    pub fn poses_per_shot_type_or(&self, default: usize) -> usize {
        self.poses_per_shot_type.unwrap_or(default)
    }
}

/// One look's worth of work within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub look_id: Uuid,
    pub brand_id: Uuid,
    /// Product type of the look, as tagged upstream.
    pub product_type: Option<String>,
    pub config: RunConfig,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub output_count: i32,
    pub error_message: Option<String>,
}

impl Run {
    /// Product type used for pose filtering; the config snapshot wins.
    pub fn effective_product_type(&self) -> ProductType {
        ProductType::from_tag(
            self.config
                .product_type
                .as_deref()
                .or(self.product_type.as_deref()),
        )
    }

    /// Whether a `running` run has not beaten since `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        if self.status != RunStatus::Running {
            return false;
        }
        match self.heartbeat_at {
            Some(beat) => beat < stale_before,
            None => true,
        }
    }
}

/// One concrete generation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub run_id: Uuid,
    pub batch_item_id: Uuid,
    pub pose_id: Uuid,
    pub pose_url: String,
    pub shot_type: ShotType,
    pub attempt_index: i32,
    pub status: OutputStatus,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Output {
    /// Last time this output showed progress.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }

    /// Whether a `running` output has shown no activity since `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == OutputStatus::Running && self.last_activity() < stale_before
    }
}

/// An output the expander wants created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewOutput {
    pub batch_id: Uuid,
    pub run_id: Uuid,
    pub batch_item_id: Uuid,
    pub pose_id: Uuid,
    pub pose_url: String,
    pub shot_type: ShotType,
    pub attempt_index: i32,
}

/// Look-to-shot mapping resolved for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Direct look reference, when the item was created from a look.
    pub look_id: Option<Uuid>,
    /// Look reached through the item's source output and its job.
    pub linked_look_id: Option<Uuid>,
    /// View tag such as "front", "back", "detail".
    pub view: Option<String>,
    pub source_url: String,
}

impl BatchItem {
    /// Whether this item belongs to the given look, directly or indirectly.
    pub fn belongs_to_look(&self, look_id: Uuid) -> bool {
        self.look_id == Some(look_id) || self.linked_look_id == Some(look_id)
    }

    /// Text the shot-type classifier inspects: the view tag, else the URL.
    pub fn classification_text(&self) -> &str {
        match self.view.as_deref() {
            Some(view) if !view.trim().is_empty() => view,
            _ => &self.source_url,
        }
    }
}

/// A clay pose in a brand's library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pose {
    pub id: Uuid,
    pub brand_id: Uuid,
    pub image_url: String,
    pub slot: Option<PoseSlot>,
    pub product_type: Option<String>,
    pub curation_status: CurationStatus,
}

impl Pose {
    /// Whether the pose is tagged with the given product family.
    pub fn matches_product(&self, product: ProductType) -> bool {
        self.product_type
            .as_deref()
            .and_then(ProductType::parse_tag)
            == Some(product)
    }
}

/// Aggregate progress record owned by the UI side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub status: PipelineJobStatus,
    pub progress_done: i32,
    pub progress_failed: i32,
    pub progress_total: i32,
    pub progress_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Progress fields written back to the pipeline job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobProgress {
    pub done: i32,
    pub failed: i32,
    pub total: i32,
    pub message: String,
}

impl JobProgress {
    pub fn from_counts(counts: &OutputCounts, message: impl Into<String>) -> Self {
        Self {
            done: counts.complete as i32,
            failed: counts.failed as i32,
            total: counts.total() as i32,
            message: message.into(),
        }
    }
}

/// Output tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCounts {
    pub queued: u64,
    pub running: u64,
    pub complete: u64,
    pub failed: u64,
}

impl OutputCounts {
    /// Adds one output in the given status.
    pub fn record(&mut self, status: OutputStatus) {
        match status {
            OutputStatus::Queued => self.queued += 1,
            OutputStatus::Running => self.running += 1,
            OutputStatus::Complete => self.complete += 1,
            OutputStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.complete + self.failed
    }

    /// Outputs that have not reached a terminal state.
    pub fn pending(&self) -> u64 {
        self.queued + self.running
    }

    pub fn terminal(&self) -> u64 {
        self.complete + self.failed
    }
}

/// Terminal write for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output_count: i32,
    pub error_message: Option<String>,
}

impl RunOutcome {
    /// A run with nothing to generate.
    pub fn empty() -> Self {
        Self {
            status: RunStatus::Complete,
            output_count: 0,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            output_count: 0,
            error_message: Some(message.into()),
        }
    }

    /// Derives the terminal state of a run whose outputs are all terminal.
    ///
    /// The run fails only when every output failed; partial success is
    /// `complete` with the failure count recorded.
    pub fn from_counts(counts: &OutputCounts) -> Self {
        let status = if counts.complete == 0 && counts.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Complete
        };
        let error_message = match counts.failed {
            0 => None,
            1 => Some("1 output failed".to_string()),
            n => Some(format!("{} outputs failed", n)),
        };
        Self {
            status,
            output_count: counts.complete as i32,
            error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(queued: u64, running: u64, complete: u64, failed: u64) -> OutputCounts {
        OutputCounts {
            queued,
            running,
            complete,
            failed,
        }
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!("queued".parse::<RunStatus>().unwrap(), RunStatus::Queued);
        assert_eq!(RunStatus::Running.to_string(), "running");
        assert_eq!(
            "CANCELED".parse::<PipelineJobStatus>().unwrap(),
            PipelineJobStatus::Canceled
        );
        assert_eq!(BatchStatus::Complete.as_str(), "COMPLETE");

        let err = "paused".parse::<OutputStatus>().unwrap_err();
        assert_eq!(err.kind, "output");
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(OutputStatus::Complete.is_terminal());
        assert!(OutputStatus::Failed.is_terminal());
        assert!(!OutputStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(PipelineJobStatus::Paused.halts_processing());
        assert!(!PipelineJobStatus::Running.halts_processing());
    }

    #[test]
    fn test_curation_usable() {
        assert!(CurationStatus::Approved.is_usable());
        assert!(CurationStatus::Pending.is_usable());
        assert!(!CurationStatus::Rejected.is_usable());
    }

    #[test]
    fn test_product_type_from_tag() {
        assert_eq!(ProductType::from_tag(Some("Trousers")), ProductType::Trousers);
        assert_eq!(ProductType::from_tag(Some("dress")), ProductType::Top);
        assert_eq!(ProductType::from_tag(None), ProductType::Top);
        assert_eq!(ProductType::parse_tag(" Tops "), Some(ProductType::Top));
        assert_eq!(ProductType::parse_tag("dress"), None);
    }

    #[test]
    fn test_pose_matches_only_its_tagged_family() {
        let mut pose = Pose {
            id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            image_url: "https://poses/1.png".to_string(),
            slot: Some(PoseSlot::B),
            product_type: Some("top".to_string()),
            curation_status: CurationStatus::Approved,
        };
        assert!(pose.matches_product(ProductType::Top));
        assert!(!pose.matches_product(ProductType::Trousers));

        pose.product_type = Some("shoes".to_string());
        assert!(!pose.matches_product(ProductType::Top));
        assert!(!pose.matches_product(ProductType::Trousers));

        pose.product_type = None;
        assert!(!pose.matches_product(ProductType::Top));
    }

    #[test]
    fn test_run_outcome_partial_success() {
        let outcome = RunOutcome::from_counts(&counts(0, 0, 2, 1));
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(outcome.output_count, 2);
        assert_eq!(outcome.error_message.as_deref(), Some("1 output failed"));
    }

    #[test]
    fn test_run_outcome_all_failed() {
        let outcome = RunOutcome::from_counts(&counts(0, 0, 0, 3));
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.output_count, 0);
        assert!(outcome.error_message.unwrap().contains('3'));
    }

    #[test]
    fn test_run_outcome_all_complete() {
        let outcome = RunOutcome::from_counts(&counts(0, 0, 4, 0));
        assert_eq!(outcome.status, RunStatus::Complete);
        assert!(outcome.error_message.is_none());
    }

    #[test]
    fn test_output_counts() {
        let mut c = OutputCounts::default();
        c.record(OutputStatus::Queued);
        c.record(OutputStatus::Running);
        c.record(OutputStatus::Complete);
        c.record(OutputStatus::Failed);
        c.record(OutputStatus::Failed);
        assert_eq!(c.total(), 5);
        assert_eq!(c.pending(), 2);
        assert_eq!(c.terminal(), 3);
    }

    #[test]
    fn test_run_staleness() {
        let now = Utc::now();
        let stale_before = now - chrono::Duration::minutes(2);
        let mut run = Run {
            id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            look_id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            product_type: None,
            config: RunConfig::default(),
            status: RunStatus::Running,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            heartbeat_at: None,
            output_count: 0,
            error_message: None,
        };
        // Running without a heartbeat counts as crashed before the first beat.
        assert!(run.is_stale(stale_before));

        run.heartbeat_at = Some(now - chrono::Duration::seconds(30));
        assert!(!run.is_stale(stale_before));

        run.heartbeat_at = Some(now - chrono::Duration::minutes(3));
        assert!(run.is_stale(stale_before));

        run.status = RunStatus::Queued;
        assert!(!run.is_stale(stale_before));
    }

    #[test]
    fn test_batch_item_classification_text() {
        let mut item = BatchItem {
            id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            look_id: None,
            linked_look_id: None,
            view: Some("back".to_string()),
            source_url: "https://cdn/x_f.jpg".to_string(),
        };
        assert_eq!(item.classification_text(), "back");
        item.view = Some("  ".to_string());
        assert_eq!(item.classification_text(), "https://cdn/x_f.jpg");
    }

    #[test]
    fn test_run_config_snapshot_camel_case() {
        let config: RunConfig =
            serde_json::from_str(r#"{"posesPerShotType": 3, "productType": "trousers"}"#)
                .expect("config should parse");
        assert_eq!(config.poses_per_shot_type_or(2), 3);
        assert_eq!(config.product_type.as_deref(), Some("trousers"));
        assert_eq!(RunConfig::default().poses_per_shot_type_or(2), 2);
    }
}
