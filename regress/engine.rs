//! Location regression: eligibility check, Cox fit, and extraction of the per-location
//! statistics. A failed fit is an ordinary outcome here, never an error that escapes.

use crate::clinical::PatientRecord;
use crate::cox::{CoxError, CoxOptions, RiskSets, fit_cox};
use crate::design::{DesignAssembler, DesignError};
use crate::types::{CovariateLayout, INTERACTING_COLUMN, INTERACTION_COLUMN};
use ndarray::{Array1, Array2};

/// Variance terms of the interacting variable (column 4) and the interaction (column 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionMoments {
    pub var_interacting: f64,
    pub var_interaction: f64,
    pub covariance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationFit {
    pub coefficients: Array1<f64>,
    pub p_values: Array1<f64>,
    /// Present in six-covariate mode.
    pub interaction: Option<InteractionMoments>,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    BelowThreshold { count: usize },
    FitFailed(CoxError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationOutcome {
    Fitted(LocationFit),
    Skipped(SkipReason),
}

impl LocationOutcome {
    pub fn fit(&self) -> Option<&LocationFit> {
        match self {
            Self::Fitted(fit) => Some(fit),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationResult {
    /// Patients with the indicator set at this location.
    pub count: usize,
    pub outcome: LocationOutcome,
}

/// Everything needed to regress one location, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct LocationRegressionEngine {
    assembler: DesignAssembler,
    risk: RiskSets,
    threshold: usize,
    options: CoxOptions,
}

impl LocationRegressionEngine {
    pub fn new(
        layout: CovariateLayout,
        records: &[PatientRecord],
        threshold: usize,
        options: CoxOptions,
    ) -> Result<Self, CoxError> {
        let time: Vec<f64> = records.iter().map(|r| r.survival_time).collect();
        let event: Vec<bool> = records.iter().map(PatientRecord::event_observed).collect();
        Ok(Self {
            assembler: DesignAssembler::new(layout, records),
            risk: RiskSets::new(&time, &event)?,
            threshold,
            options,
        })
    }

    pub fn layout(&self) -> &CovariateLayout {
        self.assembler.layout()
    }

    pub fn patients(&self) -> usize {
        self.assembler.patients()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Scratch design matrix for [`Self::regress_into`].
    pub fn design_buffer(&self) -> Array2<f64> {
        self.assembler.buffer()
    }

    pub fn regress(&self, indicator: &[u8]) -> Result<LocationResult, DesignError> {
        let mut design = self.design_buffer();
        self.regress_into(indicator, &mut design)
    }

    /// Regress one location, reusing `design` from [`Self::design_buffer`].
    pub fn regress_into(
        &self,
        indicator: &[u8],
        design: &mut Array2<f64>,
    ) -> Result<LocationResult, DesignError> {
        if indicator.len() != self.patients() {
            return Err(DesignError::LengthMismatch {
                expected: self.patients(),
                found: indicator.len(),
            });
        }
        let count = indicator.iter().filter(|&&v| v != 0).count();
        if count < self.threshold {
            return Ok(LocationResult {
                count,
                outcome: LocationOutcome::Skipped(SkipReason::BelowThreshold { count }),
            });
        }

        self.assembler.fill_location(indicator, design)?;
        let outcome = match fit_cox(design.view(), &self.risk, &self.options) {
            Ok(fit) => {
                let interaction = self.layout().has_interaction().then(|| InteractionMoments {
                    var_interacting: fit.covariance[[INTERACTING_COLUMN, INTERACTING_COLUMN]],
                    var_interaction: fit.covariance[[INTERACTION_COLUMN, INTERACTION_COLUMN]],
                    covariance: fit.covariance[[INTERACTING_COLUMN, INTERACTION_COLUMN]],
                });
                LocationOutcome::Fitted(LocationFit {
                    coefficients: fit.coefficients,
                    p_values: fit.p_values,
                    interaction,
                    iterations: fit.iterations,
                })
            }
            Err(err) => LocationOutcome::Skipped(SkipReason::FitFailed(err)),
        };
        Ok(LocationResult { count, outcome })
    }
}
