//! # Slice-level execution
//!
//! A slice is the unit of work: load its store, regress every location, write its result
//! files. Slices share nothing, so the same closure runs either in a plain loop or on a
//! dedicated rayon pool and produces identical files. A failing slice is recorded and
//! its siblings carry on; a later run picks up exactly the slices without a counts file.

use crate::design::DesignError;
use crate::engine::{LocationOutcome, LocationRegressionEngine, SkipReason};
use crate::progress::{RunProgressObserver, RunStage};
use crate::store::{ResidentGauge, ResultFileError, ResultStore, SliceStore, StoreError};
use crate::types::OutputKind;
use ndarray::Array3;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Pooled { workers: usize },
}

impl ExecutionMode {
    pub fn from_flags(parallel: bool, workers: usize) -> Self {
        if parallel {
            Self::Pooled {
                workers: workers.max(1),
            }
        } else {
            Self::Sequential
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to build the worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(
        "slice stores are locked by a running build ('{0}'); regression needs a finished build"
    )]
    StoreLocked(PathBuf),
}

#[derive(Debug, Error)]
pub enum SliceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Results(#[from] ResultFileError),
    #[error(transparent)]
    Design(#[from] DesignError),
}

/// Run `work` once per slice index. Results come back in the order of `slices`.
pub fn map_slices<T, E, F>(
    mode: ExecutionMode,
    slices: &[usize],
    work: F,
) -> Result<Vec<(usize, Result<T, E>)>, ExecutorError>
where
    F: Fn(usize) -> Result<T, E> + Sync + Send,
    T: Send,
    E: Send,
{
    match mode {
        ExecutionMode::Sequential => Ok(slices.iter().map(|&z| (z, work(z))).collect()),
        ExecutionMode::Pooled { workers } => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers.max(1))
                .build()?;
            Ok(pool.install(|| slices.par_iter().map(|&z| (z, work(z))).collect()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocationTally {
    pub fitted: usize,
    pub below_threshold: usize,
    pub fit_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    /// Result files were already present; nothing was recomputed.
    AlreadyComplete,
    Processed(LocationTally),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSummary {
    pub z: usize,
    pub status: SliceStatus,
}

#[derive(Debug)]
pub struct SliceFailure {
    pub z: usize,
    pub error: SliceError,
}

#[derive(Debug, Default)]
pub struct RegressionOutcome {
    pub summaries: Vec<SliceSummary>,
    pub failures: Vec<SliceFailure>,
}

/// Regresses whole slices against a built store.
pub struct SliceRegressor<'a> {
    store: &'a SliceStore,
    results: &'a ResultStore,
    engine: &'a LocationRegressionEngine,
    gauge: &'a ResidentGauge,
}

impl<'a> SliceRegressor<'a> {
    pub fn new(
        store: &'a SliceStore,
        results: &'a ResultStore,
        engine: &'a LocationRegressionEngine,
        gauge: &'a ResidentGauge,
    ) -> Self {
        Self {
            store,
            results,
            engine,
            gauge,
        }
    }

    /// Process every slice that has no complete result set yet.
    pub fn run(
        &self,
        mode: ExecutionMode,
        progress: &dyn RunProgressObserver,
    ) -> Result<RegressionOutcome, ExecutorError> {
        if self.store.is_locked() {
            return Err(ExecutorError::StoreLocked(self.store.lock_path()));
        }
        let slices: Vec<usize> = (0..self.store.dims().nz).collect();
        let done = AtomicUsize::new(0);
        progress.on_stage_start(RunStage::Regression, slices.len());

        let results = map_slices(mode, &slices, |z| {
            let result = self.process_slice(z);
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            progress.on_stage_advance(RunStage::Regression, finished);
            result
        })?;
        progress.on_stage_finish(RunStage::Regression);

        let mut outcome = RegressionOutcome::default();
        for (z, result) in results {
            match result {
                Ok(summary) => outcome.summaries.push(summary),
                Err(error) => {
                    log::error!("Slice {z} failed: {error}");
                    outcome.failures.push(SliceFailure { z, error });
                }
            }
        }
        Ok(outcome)
    }

    pub fn process_slice(&self, z: usize) -> Result<SliceSummary, SliceError> {
        if self.results.is_complete(z) {
            return Ok(SliceSummary {
                z,
                status: SliceStatus::AlreadyComplete,
            });
        }

        let dims = self.store.dims();
        let layout = *self.engine.layout();
        let k = layout.len();
        let mut coefficients = Array3::<f64>::zeros((dims.nx, dims.ny, k));
        let mut p_values = Array3::<f64>::zeros((dims.nx, dims.ny, k));
        let mut varcov = Array3::<f64>::zeros((dims.nx, dims.ny, 3));
        let mut counts = Array3::<f64>::zeros((dims.nx, dims.ny, 1));
        let mut tally = LocationTally::default();

        {
            let slice = self.store.load(z, self.gauge)?;
            let mut design = self.engine.design_buffer();
            for x in 0..dims.nx {
                for y in 0..dims.ny {
                    let result = self.engine.regress_into(slice.indicator(x, y), &mut design)?;
                    counts[[x, y, 0]] = result.count as f64;
                    match result.outcome {
                        LocationOutcome::Fitted(fit) => {
                            tally.fitted += 1;
                            for c in 0..k {
                                coefficients[[x, y, c]] = fit.coefficients[c];
                                p_values[[x, y, c]] = fit.p_values[c];
                            }
                            if let Some(moments) = fit.interaction {
                                varcov[[x, y, 0]] = moments.var_interacting;
                                varcov[[x, y, 1]] = moments.var_interaction;
                                varcov[[x, y, 2]] = moments.covariance;
                            }
                        }
                        LocationOutcome::Skipped(SkipReason::BelowThreshold { .. }) => {
                            tally.below_threshold += 1;
                        }
                        LocationOutcome::Skipped(SkipReason::FitFailed(err)) => {
                            log::debug!("Slice {z}, location ({x}, {y}): fit failed: {err}");
                            tally.fit_failed += 1;
                        }
                    }
                }
            }
        }

        for kind in OutputKind::for_layout(&layout) {
            let values = match kind {
                OutputKind::Coefficients => coefficients.view(),
                OutputKind::PValues => p_values.view(),
                OutputKind::VarCov => varcov.view(),
                OutputKind::Counts => counts.view(),
            };
            self.results.write(kind, z, values)?;
        }

        Ok(SliceSummary {
            z,
            status: SliceStatus::Processed(tally),
        })
    }
}
