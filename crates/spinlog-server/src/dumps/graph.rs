//! Generic topological step executor
//!
//! Runs a set of [`ProcessingStep`]s honoring their prerequisite edges:
//! every step whose prerequisites are completed is scheduled concurrently,
//! completions unlock dependents, and the first failure stops scheduling
//! while in-flight siblings drain (fail-fast). Seeding the executor with an
//! already-completed set makes reruns and restart resumption skip finished
//! work.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::steps::ProcessingStep;
use super::{DumpError, Result};

/// Executes a single processing step
///
/// Implementations persist their own completion state before returning, so
/// a dependent step is only ever scheduled after its prerequisite is
/// durably recorded as completed.
#[async_trait]
pub trait StepRunner: Send + Sync + 'static {
    /// Run one step, returning the number of records written
    async fn run_step(&self, step: ProcessingStep) -> Result<i64>;
}

/// Result of one completed step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: ProcessingStep,
    pub records_count: i64,
    pub duration: Duration,
}

/// Structural problems in a step set
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("step {step} requires {prerequisite}, which is not part of the graph")]
    UnknownPrerequisite {
        step: ProcessingStep,
        prerequisite: ProcessingStep,
    },

    #[error("dependency cycle involving steps: {0:?}")]
    Cycle(Vec<ProcessingStep>),
}

/// A set of steps plus the prerequisite edges between them
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<ProcessingStep>,
}

impl StepGraph {
    /// The full 13-step pipeline graph
    pub fn full() -> Self {
        Self {
            steps: ProcessingStep::ALL.to_vec(),
        }
    }

    /// A graph over an explicit subset of steps (used by tests)
    pub fn with_steps(steps: Vec<ProcessingStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[ProcessingStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps that are not completed and whose prerequisites all are
    pub fn ready(&self, completed: &HashSet<ProcessingStep>) -> Vec<ProcessingStep> {
        self.steps
            .iter()
            .copied()
            .filter(|step| !completed.contains(step))
            .filter(|step| step.prerequisites().iter().all(|p| completed.contains(p)))
            .collect()
    }

    /// Check that every prerequisite is a member and that no cycle exists
    pub fn validate(&self) -> std::result::Result<(), GraphError> {
        let members: HashSet<_> = self.steps.iter().copied().collect();
        for step in &self.steps {
            for prerequisite in step.prerequisites() {
                if !members.contains(prerequisite) {
                    return Err(GraphError::UnknownPrerequisite {
                        step: *step,
                        prerequisite: *prerequisite,
                    });
                }
            }
        }

        // Kahn-style peeling: if no progress can be made the remainder is a cycle
        let mut settled: HashSet<ProcessingStep> = HashSet::new();
        while settled.len() < self.steps.len() {
            let ready = self.ready(&settled);
            if ready.is_empty() {
                let mut remaining: Vec<_> = self
                    .steps
                    .iter()
                    .copied()
                    .filter(|s| !settled.contains(s))
                    .collect();
                remaining.sort();
                return Err(GraphError::Cycle(remaining));
            }
            settled.extend(ready);
        }

        Ok(())
    }
}

/// Concurrent executor over a [`StepGraph`]
pub struct StepExecutor<R: StepRunner> {
    graph: StepGraph,
    runner: Arc<R>,
    cancel: CancellationToken,
}

impl<R: StepRunner> StepExecutor<R> {
    pub fn new(graph: StepGraph, runner: Arc<R>, cancel: CancellationToken) -> Self {
        Self {
            graph,
            runner,
            cancel,
        }
    }

    /// Run all steps not in `already_completed`
    ///
    /// Returns the outcomes of the steps executed in this run. Fails with
    /// the first step error, after in-flight siblings have drained, and
    /// with `Cancelled` when the batch's token fires mid-run.
    pub async fn run(&self, already_completed: HashSet<ProcessingStep>) -> Result<Vec<StepOutcome>> {
        if let Err(e) = self.graph.validate() {
            // A malformed graph is a bug in the step table, not an
            // operational condition.
            error!("Invalid step graph: {}", e);
            let step = match e {
                GraphError::UnknownPrerequisite { step, .. } => step,
                GraphError::Cycle(ref steps) => steps[0],
            };
            return Err(DumpError::DependencyNotMet(step));
        }

        let members: HashSet<_> = self.graph.steps().iter().copied().collect();
        let mut completed: HashSet<ProcessingStep> =
            already_completed.intersection(&members).copied().collect();
        let mut scheduled = completed.clone();
        let mut in_flight: JoinSet<(ProcessingStep, Result<i64>, Duration)> = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut failure: Option<DumpError> = None;

        loop {
            if failure.is_none() && !self.cancel.is_cancelled() {
                for step in self.graph.ready(&completed) {
                    if scheduled.contains(&step) {
                        continue;
                    }
                    scheduled.insert(step);
                    debug!(step = %step, "Scheduling processing step");

                    let runner = Arc::clone(&self.runner);
                    in_flight.spawn(async move {
                        let started = Instant::now();
                        let result = runner.run_step(step).await;
                        (step, result, started.elapsed())
                    });
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            let (step, result, duration) = joined
                .map_err(|e| DumpError::Storage(format!("step task failed to join: {e}")))?;

            match result {
                Ok(records_count) => {
                    debug!(step = %step, records_count, "Step completed");
                    completed.insert(step);
                    outcomes.push(StepOutcome {
                        step,
                        records_count,
                        duration,
                    });
                },
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    } else {
                        warn!(step = %step, "Additional step failure after fail-fast: {}", e);
                    }
                },
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        if completed.len() < self.graph.len() {
            if self.cancel.is_cancelled() {
                return Err(DumpError::Cancelled);
            }
            // ready() returned nothing while work remained; validate()
            // should have caught this, so treat it as a bug.
            let stuck = self
                .graph
                .steps()
                .iter()
                .copied()
                .find(|s| !completed.contains(s))
                .unwrap_or(ProcessingStep::LabelsProcessing);
            error!(step = %stuck, "Step could not be scheduled despite acyclic graph");
            return Err(DumpError::DependencyNotMet(stuck));
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ProcessingStep::*;

    /// Event log entry: (step, started|finished)
    type Event = (ProcessingStep, &'static str);

    struct RecordingRunner {
        events: Mutex<Vec<Event>>,
        fail_on: Option<ProcessingStep>,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing_on(step: ProcessingStep) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                fail_on: Some(step),
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn ran(&self, step: ProcessingStep) -> bool {
            self.events()
                .iter()
                .any(|(s, phase)| *s == step && *phase == "started")
        }
    }

    #[async_trait]
    impl StepRunner for RecordingRunner {
        async fn run_step(&self, step: ProcessingStep) -> Result<i64> {
            self.events.lock().unwrap().push((step, "started"));
            // Yield so concurrently scheduled siblings interleave
            tokio::time::sleep(Duration::from_millis(2)).await;

            if self.fail_on == Some(step) {
                return Err(DumpError::Parse(format!("boom in {step}")));
            }

            self.events.lock().unwrap().push((step, "finished"));
            Ok(1)
        }
    }

    fn executor(runner: Arc<RecordingRunner>) -> StepExecutor<RecordingRunner> {
        StepExecutor::new(StepGraph::full(), runner, CancellationToken::new())
    }

    fn position(events: &[Event], step: ProcessingStep, phase: &str) -> usize {
        events
            .iter()
            .position(|(s, p)| *s == step && *p == phase)
            .unwrap_or_else(|| panic!("no {phase} event for {step}"))
    }

    #[test]
    fn test_full_graph_is_valid() {
        assert!(StepGraph::full().validate().is_ok());
    }

    #[test]
    fn test_subset_with_missing_prerequisite_is_invalid() {
        let graph = StepGraph::with_steps(vec![MasterGenresUpsert]);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownPrerequisite {
                step: MasterGenresUpsert,
                prerequisite: MasterGenresCollection,
            })
        );
    }

    #[test]
    fn test_ready_respects_prerequisites() {
        let graph = StepGraph::full();

        let ready = graph.ready(&HashSet::new());
        assert_eq!(
            ready,
            vec![
                LabelsProcessing,
                ArtistsProcessing,
                MastersProcessing,
                ReleasesProcessing
            ]
        );

        let completed: HashSet<_> = [MastersProcessing].into_iter().collect();
        let ready = graph.ready(&completed);
        assert!(ready.contains(&MasterGenresCollection));
        assert!(!ready.contains(&MasterGenresUpsert));
        assert!(!ready.contains(&MasterArtistAssociations));
    }

    #[tokio::test]
    async fn test_executes_all_thirteen_steps() {
        let runner = Arc::new(RecordingRunner::new());
        let outcomes = executor(runner.clone()).run(HashSet::new()).await.unwrap();

        assert_eq!(outcomes.len(), 13);
        for step in ProcessingStep::ALL {
            assert!(runner.ran(step), "{step} never ran");
        }
    }

    #[tokio::test]
    async fn test_dependents_never_start_before_prerequisites_finish() {
        let runner = Arc::new(RecordingRunner::new());
        executor(runner.clone()).run(HashSet::new()).await.unwrap();

        let events = runner.events();
        for step in ProcessingStep::ALL {
            for prerequisite in step.prerequisites() {
                let prereq_finished = position(&events, *prerequisite, "finished");
                let step_started = position(&events, step, "started");
                assert!(
                    prereq_finished < step_started,
                    "{step} started before {prerequisite} finished"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_failure_halts_downstream_steps() {
        let runner = Arc::new(RecordingRunner::failing_on(MastersProcessing));
        let err = executor(runner.clone()).run(HashSet::new()).await.unwrap_err();

        assert!(matches!(err, DumpError::Parse(_)));
        // Nothing downstream of the failed step may have started
        assert!(!runner.ran(MasterGenresCollection));
        assert!(!runner.ran(MasterGenresUpsert));
        assert!(!runner.ran(MasterGenreAssociations));
        assert!(!runner.ran(MasterArtistAssociations));
    }

    #[tokio::test]
    async fn test_already_completed_steps_are_skipped() {
        let runner = Arc::new(RecordingRunner::new());
        let completed: HashSet<_> = [LabelsProcessing, ArtistsProcessing].into_iter().collect();

        let outcomes = executor(runner.clone()).run(completed).await.unwrap();

        assert_eq!(outcomes.len(), 11);
        assert!(!runner.ran(LabelsProcessing));
        assert!(!runner.ran(ArtistsProcessing));
        assert!(runner.ran(ReleaseLabelAssociations));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_scheduling() {
        let runner = Arc::new(RecordingRunner::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let executor = StepExecutor::new(StepGraph::full(), runner.clone(), cancel);
        let err = executor.run(HashSet::new()).await.unwrap_err();

        assert!(matches!(err, DumpError::Cancelled));
        assert!(runner.events().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_after_partial_completion_finishes_the_rest() {
        // First run fails on releases; entity siblings complete.
        let failing = Arc::new(RecordingRunner::failing_on(ReleasesProcessing));
        let err = executor(failing.clone()).run(HashSet::new()).await.unwrap_err();
        assert!(matches!(err, DumpError::Parse(_)));

        let completed: HashSet<_> = failing
            .events()
            .iter()
            .filter(|(_, phase)| *phase == "finished")
            .map(|(step, _)| *step)
            .collect();
        assert!(completed.contains(&LabelsProcessing));
        assert!(!completed.contains(&ReleasesProcessing));

        // Second run (reprocess semantics) executes only the remainder.
        let runner = Arc::new(RecordingRunner::new());
        let outcomes = executor(runner.clone()).run(completed.clone()).await.unwrap();
        assert_eq!(outcomes.len(), 13 - completed.len());
        assert!(runner.ran(ReleasesProcessing));
        assert!(!runner.ran(LabelsProcessing));
    }
}
