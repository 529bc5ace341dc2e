use std::fmt;

/// Stages reported during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStage {
    DensityWeights,
    Members,
    Combination,
    Errors,
}

impl RunStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::DensityWeights => "density-ratio weights",
            Self::Members => "ensemble member training",
            Self::Combination => "PDF combination",
            Self::Errors => "error estimation",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress. Methods are called from worker threads, so
/// implementations keep their own synchronization.
pub trait ProgressObserver: Sync {
    fn on_stage_start(&self, stage: RunStage, total_items: usize) {
        let _ = (stage, total_items);
    }
    fn on_stage_advance(&self, stage: RunStage, processed_items: usize) {
        let _ = (stage, processed_items);
    }
    fn on_stage_finish(&self, stage: RunStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
