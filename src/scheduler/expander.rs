//! Run expander: turns one claimed run into its queued outputs.
//!
//! For each batch item of the run's look the view is classified into shot
//! types; for each shot type, candidate poses are drawn from the brand's
//! library slot and a random sample of `posesPerShotType` becomes outputs.

use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::error::ExpansionError;
use crate::metrics::MetricsCollector;
use crate::scheduler::models::{
    BatchItem, NewOutput, Pose, ProductType, Run, RunOutcome,
};
use crate::scheduler::shot_type::{classify_view, ShotType};
use crate::storage::{BatchStore, StoreError};

/// Result of expanding one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// No batch items resolved; the run was completed with zero outputs.
    Empty,
    /// The run could not be expanded and was marked failed.
    Failed(String),
    /// Outputs were inserted; `created` excludes ones that already existed.
    Planned { created: usize },
}

pub struct RunExpander {
    store: Arc<dyn BatchStore>,
    default_poses_per_shot_type: usize,
    seed: Option<u64>,
    metrics: MetricsCollector,
}

impl RunExpander {
    pub fn new(store: Arc<dyn BatchStore>, default_poses_per_shot_type: usize) -> Self {
        Self {
            store,
            default_poses_per_shot_type,
            seed: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Fixes the sampling seed; every expansion then draws the same sample.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn create_rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }

    /// Expands a run that the caller has already claimed (`running`).
    ///
    /// Empty and unexpandable runs are settled here, including runs whose
    /// pose library cannot be read. Failed writes are returned to the caller.
    pub async fn expand(&self, run: &Run) -> Result<Expansion, StoreError> {
        let items = self.store.batch_items_for_run(run).await?;
        if items.is_empty() {
            info!(run_id = %run.id, look_id = %run.look_id, "No batch items for run, completing empty");
            self.store
                .finish_run(run.id, &RunOutcome::empty(), Utc::now())
                .await?;
            self.metrics.record_run("complete");
            return Ok(Expansion::Empty);
        }

        let plan = match self.store.pose_library(run.brand_id).await {
            Ok(library) => self.plan_outputs(run, &items, &library),
            Err(e) => Err(ExpansionError::LibraryUnavailable {
                brand_id: run.brand_id,
                reason: e.to_string(),
            }),
        };

        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                let message = e.to_string();
                warn!(run_id = %run.id, error = %message, "Run expansion failed");
                self.store
                    .finish_run(run.id, &RunOutcome::failed(&message), Utc::now())
                    .await?;
                self.metrics.record_run("failed");
                return Ok(Expansion::Failed(message));
            }
        };

        let inserted = self.store.insert_outputs(&plan).await?;
        info!(
            run_id = %run.id,
            items = items.len(),
            planned = plan.len(),
            created = inserted.len(),
            "Expanded run into outputs"
        );
        Ok(Expansion::Planned {
            created: inserted.len(),
        })
    }

    /// Chooses the outputs for a run without touching the store.
    pub fn plan_outputs(
        &self,
        run: &Run,
        items: &[BatchItem],
        library: &[Pose],
    ) -> Result<Vec<NewOutput>, ExpansionError> {
        let usable: Vec<&Pose> = library
            .iter()
            .filter(|p| p.curation_status.is_usable())
            .collect();
        if usable.is_empty() {
            return Err(ExpansionError::NoPoses(run.brand_id));
        }

        let per_shot = run
            .config
            .poses_per_shot_type_or(self.default_poses_per_shot_type);
        let product = run.effective_product_type();
        let mut rng = self.create_rng();
        let mut plan = Vec::new();

        for item in items {
            let view = classify_view(item.classification_text());
            for &shot_type in view.shot_types() {
                let mut candidates = eligible_poses(&usable, shot_type, product);
                if candidates.is_empty() {
                    warn!(
                        run_id = %run.id,
                        item_id = %item.id,
                        shot_type = %shot_type,
                        slot = %shot_type.slot(),
                        "No poses in slot, skipping shot type"
                    );
                    continue;
                }

                candidates.shuffle(&mut rng);
                candidates.truncate(per_shot);

                plan.extend(candidates.into_iter().map(|pose| NewOutput {
                    batch_id: run.batch_id,
                    run_id: run.id,
                    batch_item_id: item.id,
                    pose_id: pose.id,
                    pose_url: pose.image_url.clone(),
                    shot_type,
                    attempt_index: 0,
                }));
            }
        }

        if plan.is_empty() {
            return Err(ExpansionError::NoEligiblePoses(run.brand_id));
        }
        Ok(plan)
    }
}

/// Poses eligible for a shot type.
///
/// Slot must match. Cropped and detail shots also prefer poses tagged with
/// the look's product type, widening to the whole slot when none are.
pub fn eligible_poses<'a>(
    usable: &[&'a Pose],
    shot_type: ShotType,
    product: ProductType,
) -> Vec<&'a Pose> {
    let slot = shot_type.slot();
    let in_slot: Vec<&Pose> = usable
        .iter()
        .copied()
        .filter(|p| p.slot == Some(slot))
        .collect();

    if !shot_type.filters_by_product() {
        return in_slot;
    }

    let matching: Vec<&Pose> = in_slot
        .iter()
        .copied()
        .filter(|p| p.matches_product(product))
        .collect();
    if matching.is_empty() && !in_slot.is_empty() {
        debug!(
            shot_type = %shot_type,
            product = %product,
            candidates = in_slot.len(),
            "No product-tagged poses, widening to whole slot"
        );
        return in_slot;
    }
    matching
}
