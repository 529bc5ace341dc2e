//! # Parallel member execution
//!
//! Every member of the ensemble is trained and evaluated as an independent task on rayon's
//! pool. A task reads only shared immutable inputs and writes only its own outcome; the
//! collect at the end of the parallel iterator is the join barrier, so no object is combined
//! before every member has either reported or been skipped.
//!
//! The same [`ExecutionControl`] carries the run deadline and the abort flag for every
//! long-running stage of the crate.

use crate::configs::Configuration;
use crate::engine::{EngineError, ModelEngine, PredictionTable, TrainingSample, predict};
use crate::error::RunError;
use crate::progress::{ProgressObserver, RunStage};
use crate::types::Catalog;
use ndarray::ArrayView1;
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Shared flag that cancels a run from another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a stage stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Aborted,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ExecutionControl {
    deadline: Option<Instant>,
    abort: AbortHandle,
    /// Fewest completed members a timed-out run may continue with.
    pub min_partial_members: usize,
    /// Largest tolerated fraction of failed members among those that ran.
    pub max_failure_rate: f64,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self {
            deadline: None,
            abort: AbortHandle::new(),
            min_partial_members: 1,
            max_failure_rate: 0.5,
        }
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort = handle;
        self
    }

    pub fn with_min_partial_members(mut self, members: usize) -> Self {
        self.min_partial_members = members;
        self
    }

    pub fn with_max_failure_rate(mut self, rate: f64) -> Self {
        self.max_failure_rate = rate;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Abort wins over a passed deadline.
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.abort.is_aborted() {
            Some(Interrupt::Aborted)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Interrupt::TimedOut)
        } else {
            None
        }
    }
}

/// A member that trained and predicted successfully.
#[derive(Debug, Clone)]
pub struct TrainedMember<M> {
    pub configuration: Configuration,
    pub model: M,
}

/// Per-configuration soft failures of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureSummary {
    pub requested: usize,
    pub completed: usize,
    pub failed: Vec<(usize, String)>,
    /// Members never started because the deadline passed.
    pub timed_out: usize,
}

impl FailureSummary {
    pub fn failure_rate(&self) -> f64 {
        let ran = self.completed + self.failed.len();
        if ran == 0 {
            0.0
        } else {
            self.failed.len() as f64 / ran as f64
        }
    }

    pub fn is_partial(&self) -> bool {
        self.completed < self.requested
    }
}

/// Outcome of running every member.
#[derive(Debug, Clone)]
pub struct MemberRun<M> {
    pub members: Vec<TrainedMember<M>>,
    /// One table per catalog passed to [`run_members`], in the same order.
    pub tables: Vec<PredictionTable>,
    pub failures: FailureSummary,
}

enum MemberOutcome<M> {
    Completed(TrainedMember<M>, Vec<Vec<f64>>),
    Failed(usize, EngineError),
    Skipped,
}

/// Trains every configuration on `training` and predicts every catalog in `predict_on`.
pub fn run_members<E: ModelEngine>(
    engine: &E,
    configurations: &[Configuration],
    training: &Catalog,
    training_weights: ArrayView1<f64>,
    predict_on: &[&Catalog],
    control: &ExecutionControl,
    observer: &dyn ProgressObserver,
) -> Result<MemberRun<E::Model>, RunError> {
    log::info!(
        "Training {} ensemble members on '{}' ({} objects)",
        configurations.len(),
        training.name(),
        training.len()
    );
    observer.on_stage_start(RunStage::Members, configurations.len());
    let processed = AtomicUsize::new(0);

    let outcomes: Vec<MemberOutcome<E::Model>> = configurations
        .par_iter()
        .map(|configuration| {
            if control.interrupted().is_some() {
                return MemberOutcome::Skipped;
            }
            let outcome = match run_one(engine, configuration, training, training_weights, predict_on)
            {
                Ok((model, columns)) => MemberOutcome::Completed(
                    TrainedMember {
                        configuration: configuration.clone(),
                        model,
                    },
                    columns,
                ),
                Err(error) => MemberOutcome::Failed(configuration.id, error),
            };
            let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
            observer.on_stage_advance(RunStage::Members, done);
            outcome
        })
        .collect();
    observer.on_stage_finish(RunStage::Members);

    if control.interrupted() == Some(Interrupt::Aborted) {
        return Err(RunError::Aborted {
            component: "member execution",
        });
    }

    let mut failures = FailureSummary {
        requested: configurations.len(),
        ..FailureSummary::default()
    };
    let mut members = Vec::new();
    let mut columns_per_catalog: Vec<Vec<(usize, Vec<f64>)>> = vec![Vec::new(); predict_on.len()];
    for outcome in outcomes {
        match outcome {
            MemberOutcome::Completed(member, columns) => {
                for (table, column) in columns_per_catalog.iter_mut().zip(columns) {
                    table.push((member.configuration.id, column));
                }
                members.push(member);
            }
            MemberOutcome::Failed(id, error) => {
                log::warn!("Member {id} excluded from the ensemble: {error}");
                failures.failed.push((id, error.to_string()));
            }
            MemberOutcome::Skipped => failures.timed_out += 1,
        }
    }
    failures.completed = members.len();

    if failures.timed_out > 0 {
        if failures.completed < control.min_partial_members.max(1) {
            return Err(RunError::Timeout {
                component: "member execution",
                completed: failures.completed,
                required: control.min_partial_members.max(1),
            });
        }
        log::warn!(
            "Deadline passed with {} of {} members complete; continuing with a partial ensemble",
            failures.completed,
            failures.requested
        );
    }
    if failures.completed == 0 || failures.failure_rate() > control.max_failure_rate {
        return Err(RunError::ExcessiveFailures {
            failed: failures.failed.len(),
            attempted: failures.completed + failures.failed.len(),
            threshold: control.max_failure_rate,
        });
    }

    let tables = predict_on
        .iter()
        .zip(columns_per_catalog)
        .map(|(catalog, columns)| PredictionTable::from_columns(catalog.len(), columns))
        .collect();

    log::info!(
        "{} of {} members completed ({} failed, {} timed out)",
        failures.completed,
        failures.requested,
        failures.failed.len(),
        failures.timed_out
    );
    Ok(MemberRun {
        members,
        tables,
        failures,
    })
}

fn run_one<E: ModelEngine>(
    engine: &E,
    configuration: &Configuration,
    training: &Catalog,
    training_weights: ArrayView1<f64>,
    predict_on: &[&Catalog],
) -> Result<(E::Model, Vec<Vec<f64>>), EngineError> {
    let sample = TrainingSample::gather(configuration, training, training_weights)?;
    let model = engine.train(configuration, &sample)?;
    let columns = predict_on
        .iter()
        .map(|catalog| predict(engine, configuration, &model, catalog.features()))
        .collect::<Result<Vec<_>, _>>()?;
    log::debug!(
        "Member {} trained on {} rows with {} features",
        configuration.id,
        sample.len(),
        configuration.features.len()
    );
    Ok((model, columns))
}
