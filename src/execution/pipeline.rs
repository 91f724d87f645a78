//! Saga step pipeline - ordered execution with reverse-order rollback

use crate::core::{
    context::RunContext,
    error::{CompensationFailure, RunReport, WorkflowError},
    state::{StepStatus, WorkflowState},
    step::SagaStep,
};
use crate::execution::orchestrator::{WorkflowArgs, WorkflowOrchestrator, WorkflowResult};
use crate::progress::{ProgressReporter, ProgressStatus, ProgressUpdate};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ordered list of saga steps executed as one unit.
///
/// Steps run strictly in insertion order. When one fails, every step that
/// already succeeded is compensated in reverse order, at most once, before
/// the error is returned. Steps can be added until the first run starts.
pub struct StepPipeline {
    name: String,
    steps: RwLock<Vec<Arc<dyn SagaStep>>>,
    sealed: AtomicBool,
    progress: ProgressReporter,
}

impl StepPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            progress: ProgressReporter::new(),
        }
    }

    /// Builder form of [`StepPipeline::add_step`]. A step offered to a sealed
    /// pipeline is dropped with a warning.
    pub fn with_step(self, step: Arc<dyn SagaStep>) -> Self {
        let name = step.name().to_string();
        if let Err(e) = self.add_step(step) {
            warn!(pipeline = %self.name, step = %name, error = %e, "Step not added");
        }
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Append a step. Fails once the pipeline has started executing.
    pub fn add_step(&self, step: Arc<dyn SagaStep>) -> Result<(), WorkflowError> {
        let mut steps = self.steps.write().unwrap_or_else(PoisonError::into_inner);
        if self.sealed.load(Ordering::SeqCst) {
            return Err(WorkflowError::PipelineSealed(self.name.clone()));
        }
        debug!(pipeline = %self.name, step = step.name(), "Step added");
        steps.push(step);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Freeze the step list and take a snapshot of it
    fn seal(&self) -> Vec<Arc<dyn SagaStep>> {
        let steps = self.steps.write().unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::SeqCst);
        steps.clone()
    }

    async fn report_progress(&self, ctx: &RunContext, update: ProgressUpdate) {
        if let Err(e) = self.progress.publish(ctx, update).await {
            warn!(pipeline = %self.name, error = %e, "Progress update not delivered");
        }
    }

    async fn run(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError> {
        let started = Instant::now();
        let steps = self.seal();
        if steps.is_empty() {
            return Err(WorkflowError::EmptyPipeline(self.name.clone()));
        }

        let names: Vec<String> = steps.iter().map(|s| s.name().to_string()).collect();
        let mut state = WorkflowState::new(ctx.workflow_id(), &names, args.input);
        let total = steps.len();
        let attempt = ctx.effective_attempt();
        let mut durations: Vec<Duration> = Vec::with_capacity(total);

        info!(
            pipeline = %self.name,
            workflow_id = ctx.workflow_id(),
            run_id = %state.run_id,
            total_steps = total,
            attempt,
            "Starting pipeline run"
        );

        for (index, step) in steps.iter().enumerate() {
            let name = step.name().to_string();

            if let Some(end) = ctx.end_cause() {
                warn!(step = %name, ?end, "Run context ended before step");
                return Err(WorkflowError::from_context_end(
                    end,
                    Some(RunReport::from_state(&state, attempt)),
                ));
            }

            state.begin_step(index);
            let mut update = ProgressUpdate::new(index + 1, total, format!("Running {}", name), ProgressStatus::Running)
                .with_metadata("step", name.as_str())
                .with_metadata("attempt", attempt.to_string());
            if let Some(eta) = estimate_remaining(&durations, total - index) {
                update = update.with_eta(eta);
            }
            self.report_progress(ctx, update).await;

            info!(step = %name, index, "Executing step");
            let step_started = Instant::now();
            let stop_heartbeat = ctx.cancellation_token().child_token();
            let work = async {
                let result = tokio::select! {
                    result = step.execute(ctx, &mut state) => Ok(result),
                    end = ctx.done() => Err(end),
                };
                stop_heartbeat.cancel();
                result
            };
            let heartbeat = self
                .progress
                .heartbeat(ctx, index + 1, total, &name, stop_heartbeat.clone());
            let (result, ()) = tokio::join!(work, heartbeat);

            match result {
                Err(end) => {
                    warn!(step = %name, ?end, "Run context ended during step");
                    state.finish_step(index, Some(format!("interrupted: {:?}", end)));
                    return Err(WorkflowError::from_context_end(
                        end,
                        Some(RunReport::from_state(&state, attempt)),
                    ));
                }
                Ok(Ok(())) => {
                    state.finish_step(index, None);
                    durations.push(step_started.elapsed());
                    ctx.tracker().record_success(&name);
                    info!(step = %name, duration_ms = step_started.elapsed().as_millis() as u64, "Step succeeded");
                    self.report_progress(
                        ctx,
                        ProgressUpdate::new(index + 1, total, format!("{} succeeded", name), ProgressStatus::Succeeded)
                            .with_metadata("step", name.as_str()),
                    )
                    .await;
                }
                Ok(Err(err)) => {
                    error!(step = %name, error = %err, retryable = err.retryable, "Step failed");
                    state.finish_step(index, Some(err.message.clone()));
                    ctx.tracker()
                        .add_error(&name, &err.message, attempt, err.context.clone());
                    self.report_progress(
                        ctx,
                        ProgressUpdate::new(index + 1, total, format!("{} failed: {}", name, err), ProgressStatus::Failed)
                            .with_metadata("step", name.as_str()),
                    )
                    .await;

                    let (compensation_failures, rollback_interrupted) =
                        self.compensate(ctx, &steps[..index], &mut state).await;

                    return Err(WorkflowError::StepFailed {
                        step: name,
                        source: err,
                        compensation_failures,
                        rollback_interrupted,
                        report: Box::new(RunReport::from_state(&state, attempt)),
                    });
                }
            }
        }

        let report = RunReport::from_state(&state, attempt);
        let duration = started.elapsed();
        info!(
            pipeline = %self.name,
            steps = total,
            duration_ms = duration.as_millis() as u64,
            "Pipeline run completed"
        );

        Ok(WorkflowResult {
            workflow_id: ctx.workflow_id().to_string(),
            output: state.payload,
            report,
            duration,
        })
    }

    /// Roll back `completed` in reverse order.
    ///
    /// Compensation errors are collected and the rollback carries on. If the
    /// run context ends, no further compensation is started and the second
    /// element of the result is true.
    async fn compensate(
        &self,
        ctx: &RunContext,
        completed: &[Arc<dyn SagaStep>],
        state: &mut WorkflowState,
    ) -> (Vec<CompensationFailure>, bool) {
        let mut failures = Vec::new();
        info!(pipeline = %self.name, steps = completed.len(), "Starting rollback");

        for (index, step) in completed.iter().enumerate().rev() {
            if state.outcomes()[index].status != StepStatus::Succeeded {
                continue;
            }
            if !step.is_compensatable() {
                debug!(step = step.name(), "Step is not compensatable, skipping");
                continue;
            }
            if let Some(end) = ctx.end_cause() {
                warn!(step = step.name(), ?end, "Rollback interrupted by run context");
                return (failures, true);
            }

            state.begin_compensation(index);
            match step.compensate(ctx, state).await {
                Ok(()) => {
                    state.finish_compensation(index);
                    info!(step = step.name(), "Step compensated");
                }
                Err(e) => {
                    error!(step = step.name(), error = %e, "Compensation failed");
                    state.set_compensation_error(index, e.message.clone());
                    failures.push(CompensationFailure {
                        step: step.name().to_string(),
                        message: e.message,
                    });
                }
            }
        }

        (failures, false)
    }
}

/// Remaining time based on the average duration of finished steps
fn estimate_remaining(durations: &[Duration], remaining_steps: usize) -> Option<Duration> {
    if durations.is_empty() {
        return None;
    }
    let total: Duration = durations.iter().sum();
    let average = total / durations.len() as u32;
    Some(average * remaining_steps as u32)
}

#[async_trait]
impl WorkflowOrchestrator for StepPipeline {
    fn step_count(&self) -> usize {
        self.steps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn execute(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError> {
        self.run(ctx, args).await
    }
}
