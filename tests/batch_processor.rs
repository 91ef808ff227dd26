//! End-to-end invocations of the batch processor against the in-memory
//! store, a scripted generator and a recording continuation sink.
//!
//! Time is paused: generator latency and the invocation budget advance the
//! tokio clock deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use repose_forge::config::ProcessorConfig;
use repose_forge::error::{GenerationError, ProcessorError};
use repose_forge::generation::{GeneratedOutput, OutputGenerator};
use repose_forge::scheduler::{
    Batch, BatchItem, BatchProcessor, BatchStatus, ContinuationSink, CurationStatus,
    InvocationOutcome, NewOutput, Output, OutputStatus, PipelineJob, PipelineJobStatus, Pose,
    PoseSlot, ProcessRequest, QueueError, Run, RunConfig, RunStatus, ShotType,
};
use repose_forge::storage::{BatchStore, InMemoryBatchStore};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Behavior {
    FailPermanent,
    FailTransient,
}

/// Generator with fixed latency and per-pose scripted failures.
struct ScriptedGenerator {
    latency: Duration,
    behaviors: Mutex<HashMap<Uuid, Behavior>>,
    calls: Mutex<HashMap<Uuid, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    on_call: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl ScriptedGenerator {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            on_call: Mutex::new(None),
        }
    }

    fn script(&self, pose_id: Uuid, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(pose_id, behavior);
    }

    fn on_call(&self, hook: impl Fn() + Send + 'static) {
        *self.on_call.lock().unwrap() = Some(Box::new(hook));
    }

    fn calls_for(&self, output_id: Uuid) -> usize {
        self.calls.lock().unwrap().get(&output_id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        output: &Output,
        _model: &str,
    ) -> Result<GeneratedOutput, GenerationError> {
        *self.calls.lock().unwrap().entry(output.id).or_insert(0) += 1;
        if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
            hook();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = self.behaviors.lock().unwrap().get(&output.pose_id).copied();
        match behavior {
            None => Ok(GeneratedOutput::stored_at(format!(
                "https://results/{}.png",
                output.id
            ))),
            Some(Behavior::FailPermanent) => {
                Err(GenerationError::Rejected("pose rejected by model".to_string()))
            }
            Some(Behavior::FailTransient) => Err(GenerationError::Http {
                status: 503,
                message: "Service Unavailable".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    requests: Mutex<Vec<ProcessRequest>>,
}

impl RecordingSink {
    fn dispatched(&self) -> Vec<ProcessRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContinuationSink for RecordingSink {
    async fn dispatch(&self, request: ProcessRequest) -> Result<(), QueueError> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    store: Arc<InMemoryBatchStore>,
    batch_id: Uuid,
    job_id: Uuid,
    brand_id: Uuid,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(InMemoryBatchStore::new());
        let batch_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        let now = Utc::now();

        store.insert_pipeline_job(PipelineJob {
            id: job_id,
            status: PipelineJobStatus::Running,
            progress_done: 0,
            progress_failed: 0,
            progress_total: 0,
            progress_message: None,
            updated_at: now,
        });
        store.insert_batch(Batch {
            id: batch_id,
            status: BatchStatus::Running,
            pipeline_job_id: Some(job_id),
            created_at: now,
        });

        Self {
            store,
            batch_id,
            job_id,
            brand_id: Uuid::new_v4(),
        }
    }

    /// Seeds `per_slot` approved poses in every slot, half top, half trousers.
    fn seed_library(&self, per_slot: usize) -> Vec<Pose> {
        let mut poses = Vec::new();
        for slot in [PoseSlot::A, PoseSlot::B, PoseSlot::C, PoseSlot::D] {
            for i in 0..per_slot {
                poses.push(pose(self.brand_id, slot, if i % 2 == 0 { "top" } else { "trousers" }));
            }
        }
        self.store.insert_library(self.brand_id, poses.clone());
        poses
    }

    fn add_run(&self, view: &str) -> Run {
        self.add_run_for_brand(view, self.brand_id)
    }

    fn add_run_for_brand(&self, view: &str, brand_id: Uuid) -> Run {
        let run = Run {
            id: Uuid::new_v4(),
            batch_id: self.batch_id,
            look_id: Uuid::new_v4(),
            brand_id,
            product_type: Some("top".to_string()),
            config: RunConfig::default(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            output_count: 0,
            error_message: None,
        };
        self.store.insert_run(run.clone());
        self.store.insert_batch_item(BatchItem {
            id: Uuid::new_v4(),
            batch_id: self.batch_id,
            look_id: Some(run.look_id),
            linked_look_id: None,
            view: Some(view.to_string()),
            source_url: format!("https://cdn/{}.jpg", run.look_id),
        });
        run
    }

    fn request(&self) -> ProcessRequest {
        ProcessRequest::new(self.batch_id, self.job_id, "nano-banana")
    }

    fn processor(
        &self,
        generator: &Arc<ScriptedGenerator>,
        sink: &Arc<RecordingSink>,
        config: ProcessorConfig,
    ) -> BatchProcessor {
        BatchProcessor::new(self.store.clone(), generator.clone(), sink.clone(), config)
            .with_seed(42)
    }

    fn job(&self) -> PipelineJob {
        self.store.pipeline_job(self.job_id).unwrap()
    }
}

fn pose(brand_id: Uuid, slot: PoseSlot, product: &str) -> Pose {
    Pose {
        id: Uuid::new_v4(),
        brand_id,
        image_url: format!("https://poses/{}.png", Uuid::new_v4()),
        slot: Some(slot),
        product_type: Some(product.to_string()),
        curation_status: CurationStatus::Approved,
    }
}

fn config() -> ProcessorConfig {
    ProcessorConfig::default()
        .with_time_budget(Duration::from_secs(50))
        .with_output_concurrency(4)
        .with_run_slice_size(3)
        .with_poses_per_shot_type(2)
        .with_max_retries(2)
        .with_retry_base_delay(Duration::from_millis(10))
        .with_inter_batch_delay(Duration::from_millis(5))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_batch_runs_to_completion() {
    let fx = Fixture::new();
    let library = fx.seed_library(4);
    let runs = [fx.add_run("front"), fx.add_run("back"), fx.add_run("detail")];

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(100)));
    let sink = Arc::new(RecordingSink::default());
    let processor = fx.processor(&generator, &sink, config());

    let outcome = processor.process(&fx.request()).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));
    assert!(sink.dispatched().is_empty());

    // front: 3 shot types, back: 1, detail: 1; two poses each.
    let outputs = fx.store.outputs_for_batch(fx.batch_id);
    assert_eq!(outputs.len(), 10);
    assert!(outputs.iter().all(|o| o.status == OutputStatus::Complete));

    for output in &outputs {
        let pose = library.iter().find(|p| p.id == output.pose_id).unwrap();
        assert_eq!(pose.slot, Some(output.shot_type.slot()));
        assert_eq!(output.attempt_index, 0);
    }
    for run in &runs {
        let run = fx.store.run(run.id).unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        assert!(run.error_message.is_none());
    }

    let job = fx.job();
    assert_eq!(job.status, PipelineJobStatus::Completed);
    assert_eq!(job.progress_done, 10);
    assert_eq!(job.progress_total, 10);
    assert_eq!(fx.store.batch(fx.batch_id).unwrap().status, BatchStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_cropped_trousers_outputs_use_trousers_poses() {
    let fx = Fixture::new();
    let library = fx.seed_library(4);
    let run = fx.add_run("front");
    fx.store.update_run(run.id, |r| r.product_type = Some("trousers".to_string()));

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    fx.processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    let cropped: Vec<Output> = fx
        .store
        .outputs_for_run(run.id)
        .into_iter()
        .filter(|o| o.shot_type == ShotType::FrontCropped)
        .collect();
    assert_eq!(cropped.len(), 2);
    for output in cropped {
        let pose = library.iter().find(|p| p.id == output.pose_id).unwrap();
        assert_eq!(pose.slot, Some(PoseSlot::B));
        assert_eq!(pose.product_type.as_deref(), Some("trousers"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_partial_success_finalizes_completed_with_failure_count() {
    let fx = Fixture::new();
    let poses: Vec<Pose> = (0..3)
        .map(|_| pose(fx.brand_id, PoseSlot::C, "top"))
        .collect();
    fx.store.insert_library(fx.brand_id, poses.clone());
    let run = fx.add_run("back");

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(50)));
    generator.script(poses[1].id, Behavior::FailPermanent);
    let sink = Arc::new(RecordingSink::default());
    let processor = fx.processor(&generator, &sink, config().with_poses_per_shot_type(3));

    let outcome = processor.process(&fx.request()).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));

    let run = fx.store.run(run.id).unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.output_count, 2);
    assert!(run.error_message.unwrap().contains("1 output failed"));

    let job = fx.job();
    assert_eq!(job.progress_failed, 1);
    assert!(job.progress_message.unwrap().contains("1 failed"));
}

#[tokio::test(start_paused = true)]
async fn test_all_outputs_failed_fails_job_and_batch() {
    let fx = Fixture::new();
    let poses = vec![pose(fx.brand_id, PoseSlot::C, "top")];
    fx.store.insert_library(fx.brand_id, poses.clone());
    fx.add_run("back");

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    generator.script(poses[0].id, Behavior::FailPermanent);
    let sink = Arc::new(RecordingSink::default());

    let outcome = fx
        .processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Failed));
    assert_eq!(fx.job().status, PipelineJobStatus::Failed);
    assert_eq!(fx.store.batch(fx.batch_id).unwrap().status, BatchStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_attempted_exactly_one_plus_max_retries() {
    let fx = Fixture::new();
    let poses = vec![pose(fx.brand_id, PoseSlot::C, "top")];
    fx.store.insert_library(fx.brand_id, poses.clone());
    let run = fx.add_run("back");

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    generator.script(poses[0].id, Behavior::FailTransient);
    let sink = Arc::new(RecordingSink::default());

    fx.processor(&generator, &sink, config().with_max_retries(2))
        .process(&fx.request())
        .await
        .unwrap();

    let outputs = fx.store.outputs_for_run(run.id);
    assert_eq!(outputs.len(), 1);
    assert_eq!(generator.calls_for(outputs[0].id), 3);
    assert_eq!(outputs[0].status, OutputStatus::Failed);
    assert!(outputs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("Service Unavailable"));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_calls_never_exceed_concurrency() {
    let fx = Fixture::new();
    fx.seed_library(4);
    for _ in 0..3 {
        fx.add_run("front");
    }

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(100)));
    let sink = Arc::new(RecordingSink::default());
    // Three runs dispatched together share two permits.
    let processor = fx.processor(&generator, &sink, config().with_output_concurrency(2));

    processor.process(&fx.request()).await.unwrap();

    assert_eq!(generator.total_calls(), 18);
    assert!(generator.peak() <= 2, "peak was {}", generator.peak());
    assert!(processor.executor().peak_in_flight() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_self_continuation_carries_processed_runs() {
    let fx = Fixture::new();
    fx.seed_library(4);
    let runs: Vec<Run> = (0..8).map(|_| fx.add_run("back")).collect();

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(200)));
    let sink = Arc::new(RecordingSink::default());
    // Each run is one 200ms slice; a 1s budget cannot cover eight of them.
    let cfg = config()
        .with_time_budget(Duration::from_secs(1))
        .with_run_slice_size(1);
    let processor = fx.processor(&generator, &sink, cfg);

    let first = processor.process(&fx.request()).await.unwrap();
    let InvocationOutcome::Continued {
        processed_runs,
        continuation_depth,
    } = first
    else {
        panic!("expected a continuation, got {:?}", first);
    };
    assert_eq!(continuation_depth, 1);
    assert!(processed_runs > 0 && processed_runs < runs.len());

    let dispatched = sink.dispatched();
    assert_eq!(dispatched.len(), 1);
    let next = dispatched[0].clone();
    for run_id in &next.resume_context.processed_run_ids {
        assert!(fx.store.run(*run_id).unwrap().status.is_terminal());
    }

    // Keep following continuations until the batch finalizes.
    let mut request = next;
    let mut invocations = 1;
    loop {
        invocations += 1;
        let before = sink.dispatched().len();
        let outcome = processor.process(&request).await.unwrap();
        match outcome {
            InvocationOutcome::Continued { .. } => {
                assert_eq!(sink.dispatched().len(), before + 1);
                request = sink.dispatched().last().unwrap().clone();
            }
            InvocationOutcome::Finished(status) => {
                assert_eq!(status, PipelineJobStatus::Completed);
                break;
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(invocations < 10, "continuation chain did not converge");
    }

    // Nothing was generated twice across invocations.
    let outputs = fx.store.outputs_for_batch(fx.batch_id);
    assert_eq!(outputs.len(), runs.len() * 2);
    for output in &outputs {
        assert_eq!(output.status, OutputStatus::Complete);
        assert_eq!(generator.calls_for(output.id), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_continuation_limit_fails_job() {
    let fx = Fixture::new();
    fx.seed_library(2);
    fx.add_run("back");
    fx.add_run("back");

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(200)));
    let sink = Arc::new(RecordingSink::default());
    let cfg = config()
        .with_time_budget(Duration::from_millis(100))
        .with_run_slice_size(1)
        .with_max_continuations(0);

    let err = fx
        .processor(&generator, &sink, cfg)
        .process(&fx.request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::ContinuationLimit(0)));
    assert!(sink.dispatched().is_empty());
    let job = fx.job();
    assert_eq!(job.status, PipelineJobStatus::Failed);
    assert!(job.progress_message.unwrap().contains("Continuation limit"));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_invocation_is_recovered_without_reexpansion() {
    let fx = Fixture::new();
    let library = fx.seed_library(2);
    let run = fx.add_run("back");
    let slot_c: Vec<&Pose> = library.iter().filter(|p| p.slot == Some(PoseSlot::C)).collect();

    // A previous invocation claimed the run, expanded it, started one
    // output and died.
    let long_ago = Utc::now() - chrono::Duration::minutes(5);
    fx.store.claim_run(run.id, long_ago).await.unwrap();
    let item_id = Uuid::new_v4();
    let new: Vec<NewOutput> = slot_c
        .iter()
        .map(|p| NewOutput {
            batch_id: fx.batch_id,
            run_id: run.id,
            batch_item_id: item_id,
            pose_id: p.id,
            pose_url: p.image_url.clone(),
            shot_type: ShotType::BackFull,
            attempt_index: 0,
        })
        .collect();
    let outputs = fx.store.insert_outputs(&new).await.unwrap();
    fx.store.claim_output(outputs[0].id, long_ago).await.unwrap();

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(50)));
    let sink = Arc::new(RecordingSink::default());
    let outcome = fx
        .processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));
    let after = fx.store.outputs_for_run(run.id);
    assert_eq!(after.len(), outputs.len());
    assert!(after.iter().all(|o| o.status == OutputStatus::Complete));
    assert_eq!(fx.store.run(run.id).unwrap().status, RunStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_halts_without_finalizing() {
    let fx = Fixture::new();
    fx.seed_library(2);
    let runs = [fx.add_run("back"), fx.add_run("back"), fx.add_run("back")];

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(50)));
    let store = fx.store.clone();
    let job_id = fx.job_id;
    generator.on_call(move || store.force_job_status(job_id, PipelineJobStatus::Canceled));
    let sink = Arc::new(RecordingSink::default());

    let outcome = fx
        .processor(&generator, &sink, config().with_run_slice_size(1))
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Halted(PipelineJobStatus::Canceled));
    assert!(sink.dispatched().is_empty());
    assert_eq!(fx.job().status, PipelineJobStatus::Canceled);
    assert_eq!(fx.store.batch(fx.batch_id).unwrap().status, BatchStatus::Running);

    let terminal = runs
        .iter()
        .filter(|r| fx.store.run(r.id).unwrap().status.is_terminal())
        .count();
    assert_eq!(terminal, 1);
}

#[tokio::test(start_paused = true)]
async fn test_paused_job_is_not_touched() {
    let fx = Fixture::new();
    fx.seed_library(2);
    let run = fx.add_run("back");
    fx.store.force_job_status(fx.job_id, PipelineJobStatus::Paused);

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    let outcome = fx
        .processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Halted(PipelineJobStatus::Paused));
    assert_eq!(generator.total_calls(), 0);
    assert_eq!(fx.store.run(run.id).unwrap().status, RunStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_unexpandable_run_fails_but_batch_continues() {
    let fx = Fixture::new();
    fx.seed_library(2);
    let good = fx.add_run("back");
    let orphan_brand = fx.add_run_for_brand("back", Uuid::new_v4());

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    let outcome = fx
        .processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));
    assert_eq!(fx.store.run(good.id).unwrap().status, RunStatus::Complete);
    let failed = fx.store.run(orphan_brand.id).unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error_message.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_pose_library_query_error_fails_only_that_run() {
    let fx = Fixture::new();
    fx.seed_library(2);
    let good = fx.add_run("back");
    let broken_brand = Uuid::new_v4();
    fx.store.fail_library(broken_brand, "relation \"poses\" is locked");
    let broken = fx.add_run_for_brand("back", broken_brand);

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    let outcome = fx
        .processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));
    assert_eq!(fx.job().status, PipelineJobStatus::Completed);
    assert_eq!(fx.store.run(good.id).unwrap().status, RunStatus::Complete);
    let failed = fx.store.run(broken.id).unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error_message.unwrap().contains("Pose library"));
    assert!(fx.store.outputs_for_run(broken.id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_without_items_completes_empty() {
    let fx = Fixture::new();
    fx.seed_library(2);
    let run = Run {
        id: Uuid::new_v4(),
        batch_id: fx.batch_id,
        look_id: Uuid::new_v4(),
        brand_id: fx.brand_id,
        product_type: None,
        config: RunConfig::default(),
        status: RunStatus::Queued,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        heartbeat_at: None,
        output_count: 0,
        error_message: None,
    };
    fx.store.insert_run(run.clone());

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    fx.processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    let run = fx.store.run(run.id).unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.output_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_outputs_drained_and_run_resettled() {
    let fx = Fixture::new();
    let library = fx.seed_library(2);
    let run = fx.add_run("back");
    let slot_c: Vec<&Pose> = library.iter().filter(|p| p.slot == Some(PoseSlot::C)).collect();

    // The run was settled while one output was still queued.
    fx.store.claim_run(run.id, Utc::now()).await.unwrap();
    let item_id = Uuid::new_v4();
    let new: Vec<NewOutput> = slot_c
        .iter()
        .map(|p| NewOutput {
            batch_id: fx.batch_id,
            run_id: run.id,
            batch_item_id: item_id,
            pose_id: p.id,
            pose_url: p.image_url.clone(),
            shot_type: ShotType::BackFull,
            attempt_index: 0,
        })
        .collect();
    let outputs = fx.store.insert_outputs(&new).await.unwrap();
    fx.store.claim_output(outputs[0].id, Utc::now()).await.unwrap();
    fx.store
        .complete_output(outputs[0].id, None, Utc::now())
        .await
        .unwrap();
    fx.store.update_run(run.id, |r| {
        r.status = RunStatus::Complete;
        r.output_count = 1;
    });

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    let outcome = fx
        .processor(&generator, &sink, config())
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));
    assert_eq!(generator.calls_for(outputs[1].id), 1);
    let run = fx.store.run(run.id).unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.output_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_orphan_drain_pages_past_its_limit() {
    let fx = Fixture::new();
    let library = fx.seed_library(4);
    let run = fx.add_run("back");
    let slot_c: Vec<&Pose> = library.iter().filter(|p| p.slot == Some(PoseSlot::C)).collect();

    // Settled run whose four outputs were never executed.
    let item_id = Uuid::new_v4();
    let new: Vec<NewOutput> = slot_c
        .iter()
        .map(|p| NewOutput {
            batch_id: fx.batch_id,
            run_id: run.id,
            batch_item_id: item_id,
            pose_id: p.id,
            pose_url: p.image_url.clone(),
            shot_type: ShotType::BackFull,
            attempt_index: 0,
        })
        .collect();
    let outputs = fx.store.insert_outputs(&new).await.unwrap();
    assert_eq!(outputs.len(), 4);
    fx.store.update_run(run.id, |r| r.status = RunStatus::Complete);

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    let outcome = fx
        .processor(&generator, &sink, config().with_orphan_drain_limit(2))
        .process(&fx.request())
        .await
        .unwrap();

    assert_eq!(outcome, InvocationOutcome::Finished(PipelineJobStatus::Completed));
    assert!(sink.dispatched().is_empty());
    for output in &outputs {
        assert_eq!(generator.calls_for(output.id), 1);
        assert_eq!(fx.store.output(output.id).unwrap().status, OutputStatus::Complete);
    }
    assert_eq!(fx.store.run(run.id).unwrap().output_count, 4);
    assert_eq!(fx.job().status, PipelineJobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_orphan_drain_continues_when_time_runs_out() {
    let fx = Fixture::new();
    let library = fx.seed_library(4);
    let run = fx.add_run("back");
    let item_id = Uuid::new_v4();
    let new: Vec<NewOutput> = library
        .iter()
        .filter(|p| p.slot == Some(PoseSlot::C))
        .map(|p| NewOutput {
            batch_id: fx.batch_id,
            run_id: run.id,
            batch_item_id: item_id,
            pose_id: p.id,
            pose_url: p.image_url.clone(),
            shot_type: ShotType::BackFull,
            attempt_index: 0,
        })
        .collect();
    fx.store.insert_outputs(&new).await.unwrap();
    fx.store.update_run(run.id, |r| r.status = RunStatus::Complete);

    // The first page of two outputs alone outlasts the 500ms budget.
    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(600)));
    let sink = Arc::new(RecordingSink::default());
    let config = config()
        .with_orphan_drain_limit(2)
        .with_time_budget(Duration::from_millis(500));
    let outcome = fx
        .processor(&generator, &sink, config)
        .process(&fx.request())
        .await
        .unwrap();

    assert!(matches!(outcome, InvocationOutcome::Continued { .. }));
    assert_eq!(sink.dispatched().len(), 1);
    let counts = fx.store.count_batch_outputs(fx.batch_id).await.unwrap();
    assert_eq!(counts.complete, 2);
    assert_eq!(counts.queued, 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_output_is_lost_across_invocations() {
    let fx = Fixture::new();
    fx.seed_library(4);
    for view in ["front", "back", "detail", "front", "back"] {
        fx.add_run(view);
    }

    let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(150)));
    let sink = Arc::new(RecordingSink::default());
    let cfg = config()
        .with_time_budget(Duration::from_millis(400))
        .with_run_slice_size(2)
        .with_output_concurrency(2);
    let processor = fx.processor(&generator, &sink, cfg);

    let mut request = fx.request();
    for _ in 0..30 {
        let outcome = processor.process(&request).await.unwrap();

        let counts = fx.store.count_batch_outputs(fx.batch_id).await.unwrap();
        let created = fx.store.outputs_for_batch(fx.batch_id).len() as u64;
        assert_eq!(counts.terminal() + counts.pending(), created);

        match outcome {
            InvocationOutcome::Continued { .. } => {
                request = sink.dispatched().last().unwrap().clone();
            }
            InvocationOutcome::Finished(_) => break,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    let counts = fx.store.count_batch_outputs(fx.batch_id).await.unwrap();
    assert_eq!(counts.pending(), 0);
    assert_eq!(counts.complete, 18);
    assert_eq!(fx.job().status, PipelineJobStatus::Completed);
}
