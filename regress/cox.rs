//! # Cox proportional-hazards fitting
//!
//! Newton-Raphson on the Breslow partial likelihood. The risk-set structure depends only
//! on the survival times, so [`RiskSets`] is computed once per run and shared by every
//! location. Covariates are centred before fitting; this leaves the coefficients unchanged
//! and keeps `exp(eta)` in range.
//!
//! A fit is reported as failed, rather than returned with meaningless numbers, when the
//! design cannot identify the coefficients: a constant column, no events, a singular
//! information matrix, or a likelihood that is still climbing towards infinity
//! (monotone likelihood, as under complete separation).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::cholesky::{FactorizeC, InverseC, SolveC};
use ndarray_linalg::UPLO;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::ops::Range;
use thiserror::Error;

/// Relative spread below which a column is treated as constant.
const CONSTANT_COLUMN_TOLERANCE: f64 = 1e-12;
/// Smallest admissible ratio of a Cholesky pivot to its diagonal entry.
const PIVOT_TOLERANCE: f64 = 1e-10;
/// Per-SD log hazard ratio beyond which the likelihood is considered monotone.
const MAX_SCALED_COEFFICIENT: f64 = 15.0;
/// Per-SD standard error beyond which the coefficient is considered unidentified.
const MAX_SCALED_STANDARD_ERROR: f64 = 100.0;
const MAX_STEP_HALVINGS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoxOptions {
    pub max_iterations: usize,
    /// Convergence when `|delta loglik| <= tolerance * (1 + |loglik|)`.
    pub tolerance: f64,
}

impl Default for CoxOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoxError {
    #[error("the design matrix has no rows or no columns")]
    EmptyDesign,

    #[error("no events were observed; the partial likelihood is flat")]
    NoEvents,

    #[error("design has {rows} rows but the survival data has {expected} patients")]
    DimensionMismatch { rows: usize, expected: usize },

    #[error("covariate column {column} is constant")]
    ConstantColumn { column: usize },

    #[error("the information matrix is singular or not positive definite")]
    SingularInformation,

    #[error(
        "Newton iterations did not converge within {iterations} iterations. Last log-likelihood change was {last_change:.6e}."
    )]
    DidNotConverge { iterations: usize, last_change: f64 },

    #[error("monotone likelihood: coefficient for column {column} diverges")]
    MonotoneLikelihood { column: usize },

    #[error("the partial likelihood became non-finite")]
    NonFinite,
}

/// Patient ordering by decreasing survival time with tied times grouped.
#[derive(Debug, Clone)]
pub struct RiskSets {
    order: Vec<usize>,
    tie_groups: Vec<Range<usize>>,
    event: Vec<bool>,
    n_events: usize,
}

impl RiskSets {
    pub fn new(time: &[f64], event: &[bool]) -> Result<Self, CoxError> {
        if time.len() != event.len() {
            return Err(CoxError::DimensionMismatch {
                rows: event.len(),
                expected: time.len(),
            });
        }
        if time.iter().any(|t| !t.is_finite()) {
            return Err(CoxError::NonFinite);
        }
        let mut order: Vec<usize> = (0..time.len()).collect();
        order.sort_by(|&a, &b| time[b].total_cmp(&time[a]).then(a.cmp(&b)));

        let mut tie_groups = Vec::new();
        let mut start = 0;
        while start < order.len() {
            let mut end = start + 1;
            while end < order.len() && time[order[end]] == time[order[start]] {
                end += 1;
            }
            tie_groups.push(start..end);
            start = end;
        }

        Ok(Self {
            order,
            tie_groups,
            event: event.to_vec(),
            n_events: event.iter().filter(|&&e| e).count(),
        })
    }

    pub fn patients(&self) -> usize {
        self.order.len()
    }

    pub fn events(&self) -> usize {
        self.n_events
    }
}

#[derive(Debug, Clone)]
pub struct CoxFit {
    pub coefficients: Array1<f64>,
    /// Inverse of the observed information at the optimum.
    pub covariance: Array2<f64>,
    pub standard_errors: Array1<f64>,
    /// Two-sided Wald p-values.
    pub p_values: Array1<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
}

struct Evaluation {
    log_likelihood: f64,
    gradient: Array1<f64>,
    information: Array2<f64>,
}

fn evaluate(x: &Array2<f64>, risk: &RiskSets, beta: &Array1<f64>) -> Evaluation {
    let k = x.ncols();
    let eta = x.dot(beta);
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights = eta.mapv(|e| (e - shift).exp());

    let mut log_likelihood = 0.0;
    let mut gradient = Array1::<f64>::zeros(k);
    let mut information = Array2::<f64>::zeros((k, k));

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(k);
    let mut s2 = Array2::<f64>::zeros((k, k));
    let mut event_sum = Array1::<f64>::zeros(k);

    for group in &risk.tie_groups {
        let mut deaths = 0usize;
        let mut eta_sum = 0.0;
        event_sum.fill(0.0);
        for &i in &risk.order[group.clone()] {
            let w = weights[i];
            let row = x.row(i);
            s0 += w;
            s1.scaled_add(w, &row);
            for a in 0..k {
                let wa = w * row[a];
                for b in 0..=a {
                    s2[[a, b]] += wa * row[b];
                }
            }
            if risk.event[i] {
                deaths += 1;
                eta_sum += eta[i];
                event_sum += &row;
            }
        }
        if deaths == 0 {
            continue;
        }
        let d = deaths as f64;
        log_likelihood += eta_sum - d * (shift + s0.ln());
        gradient.scaled_add(1.0, &event_sum);
        gradient.scaled_add(-d / s0, &s1);
        for a in 0..k {
            for b in 0..=a {
                information[[a, b]] += d * (s2[[a, b]] / s0 - s1[a] * s1[b] / (s0 * s0));
            }
        }
    }

    for a in 0..k {
        for b in 0..a {
            information[[b, a]] = information[[a, b]];
        }
    }

    Evaluation {
        log_likelihood,
        gradient,
        information,
    }
}

fn check_pivots(information: &Array2<f64>, factor: &Array2<f64>) -> Result<(), CoxError> {
    for (j, &pivot) in factor.diag().iter().enumerate() {
        let diagonal = information[[j, j]];
        if !(pivot.is_finite() && diagonal > 0.0 && pivot * pivot > PIVOT_TOLERANCE * diagonal) {
            return Err(CoxError::SingularInformation);
        }
    }
    Ok(())
}

fn newton_step(evaluation: &Evaluation) -> Result<Array1<f64>, CoxError> {
    let factor = evaluation
        .information
        .factorizec(UPLO::Lower)
        .map_err(|_| CoxError::SingularInformation)?;
    check_pivots(&evaluation.information, &factor.factor)?;
    let step = factor
        .solvec(&evaluation.gradient)
        .map_err(|_| CoxError::SingularInformation)?;
    if step.iter().all(|v| v.is_finite()) {
        Ok(step)
    } else {
        Err(CoxError::NonFinite)
    }
}

/// Fit a Cox model to `design` (`n x k`) with Breslow handling of tied times.
pub fn fit_cox(
    design: ArrayView2<'_, f64>,
    risk: &RiskSets,
    options: &CoxOptions,
) -> Result<CoxFit, CoxError> {
    let (n, k) = design.dim();
    if n == 0 || k == 0 {
        return Err(CoxError::EmptyDesign);
    }
    if n != risk.patients() {
        return Err(CoxError::DimensionMismatch {
            rows: n,
            expected: risk.patients(),
        });
    }
    if risk.events() == 0 {
        return Err(CoxError::NoEvents);
    }
    if design.iter().any(|v| !v.is_finite()) {
        return Err(CoxError::NonFinite);
    }

    let means = design.mean_axis(Axis(0)).ok_or(CoxError::EmptyDesign)?;
    let centred = &design - &means;
    let spreads = centred.map_axis(Axis(0), |col| (col.dot(&col) / n as f64).sqrt());
    for (column, (&sd, &mean)) in spreads.iter().zip(means.iter()).enumerate() {
        if sd <= CONSTANT_COLUMN_TOLERANCE * mean.abs().max(1.0) {
            return Err(CoxError::ConstantColumn { column });
        }
    }

    let mut beta = Array1::<f64>::zeros(k);
    let mut current = evaluate(&centred, risk, &beta);
    if !current.log_likelihood.is_finite() {
        return Err(CoxError::NonFinite);
    }

    let mut last_change = f64::INFINITY;
    let mut converged_after = None;
    for iteration in 1..=options.max_iterations {
        let mut step = newton_step(&current)?;
        let mut candidate_beta = &beta + &step;
        let mut candidate = evaluate(&centred, risk, &candidate_beta);
        let mut halvings = 0;
        while !(candidate.log_likelihood.is_finite()
            && candidate.log_likelihood >= current.log_likelihood - 1e-12)
            && halvings < MAX_STEP_HALVINGS
        {
            step *= 0.5;
            candidate_beta = &beta + &step;
            candidate = evaluate(&centred, risk, &candidate_beta);
            halvings += 1;
        }
        if !candidate.log_likelihood.is_finite() {
            return Err(CoxError::NonFinite);
        }

        last_change = (candidate.log_likelihood - current.log_likelihood).abs();
        let converged =
            last_change <= options.tolerance * (1.0 + candidate.log_likelihood.abs());
        beta = candidate_beta;
        current = candidate;
        if converged {
            converged_after = Some(iteration);
            break;
        }
    }
    let Some(iterations) = converged_after else {
        return Err(CoxError::DidNotConverge {
            iterations: options.max_iterations,
            last_change,
        });
    };

    let factor = current
        .information
        .factorizec(UPLO::Lower)
        .map_err(|_| CoxError::SingularInformation)?;
    check_pivots(&current.information, &factor.factor)?;
    let covariance = factor.invc().map_err(|_| CoxError::SingularInformation)?;

    let standard_errors = covariance.diag().mapv(|v| v.max(0.0).sqrt());
    for column in 0..k {
        let scale = spreads[column];
        let scaled_beta = beta[column].abs() * scale;
        let scaled_se = standard_errors[column] * scale;
        if !scaled_beta.is_finite() || !scaled_se.is_finite() {
            return Err(CoxError::NonFinite);
        }
        if scaled_beta > MAX_SCALED_COEFFICIENT || scaled_se > MAX_SCALED_STANDARD_ERROR {
            return Err(CoxError::MonotoneLikelihood { column });
        }
    }

    let p_values = Array1::from_iter(
        beta.iter()
            .zip(standard_errors.iter())
            .map(|(&b, &se)| wald_p_value(b, se)),
    );

    Ok(CoxFit {
        coefficients: beta,
        covariance,
        standard_errors,
        p_values,
        log_likelihood: current.log_likelihood,
        iterations,
    })
}

/// Two-sided p-value of `beta / se` under the standard normal.
pub fn wald_p_value(beta: f64, standard_error: f64) -> f64 {
    if standard_error <= 0.0 || !standard_error.is_finite() {
        return f64::NAN;
    }
    let z = (beta / standard_error).abs();
    erfc(z / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn single_column(x: &[f64]) -> Array2<f64> {
        Array2::from_shape_vec((x.len(), 1), x.to_vec()).unwrap()
    }

    #[test]
    fn risk_sets_group_tied_times_in_decreasing_order() {
        let risk = RiskSets::new(&[5.0, 9.0, 5.0, 1.0], &[true, false, true, true]).unwrap();
        assert_eq!(risk.order, vec![1, 0, 2, 3]);
        assert_eq!(risk.tie_groups, vec![0..1, 1..3, 3..4]);
        assert_eq!(risk.events(), 3);
    }

    #[test]
    fn single_binary_covariate_matches_closed_form() {
        // Times 1,2,3 with x = 1,0,1:
        // ll(b) = b - ln(2e^b + 1) - ln(e^b + 1), maximised where e^b = 1/sqrt(2).
        let risk = RiskSets::new(&[1.0, 2.0, 3.0], &[true, true, true]).unwrap();
        let design = single_column(&[1.0, 0.0, 1.0]);
        let fit = fit_cox(design.view(), &risk, &CoxOptions::default()).unwrap();
        assert_abs_diff_eq!(fit.coefficients[0], -0.5 * 2f64.ln(), epsilon = 1e-6);
        assert!(fit.p_values[0] > 0.0 && fit.p_values[0] < 1.0);
        assert!(fit.iterations <= 20);
    }

    #[test]
    fn covariance_is_inverse_information() {
        let time = [23.0, 6.0, 31.0, 5.0, 8.0, 32.0, 15.0, 21.0];
        let event = [true, true, false, true, true, false, true, true];
        let design = array![
            [45.0, 1.0],
            [62.0, 1.0],
            [58.0, 1.0],
            [70.0, 0.0],
            [51.0, 1.0],
            [66.0, 0.0],
            [39.0, 0.0],
            [55.0, 1.0]
        ];
        let risk = RiskSets::new(&time, &event).unwrap();
        let fit = fit_cox(design.view(), &risk, &CoxOptions::default()).unwrap();

        let means = design.mean_axis(Axis(0)).unwrap();
        let centred = &design - &means;
        let at_optimum = evaluate(&centred, &risk, &fit.coefficients);
        let identity = at_optimum.information.dot(&fit.covariance);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(identity[[i, j]], expected, epsilon = 1e-8);
            }
            assert_abs_diff_eq!(at_optimum.gradient[i], 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn coefficients_do_not_depend_on_column_offsets() {
        let time = [4.0, 7.0, 2.0, 9.0, 5.0, 3.0];
        let event = [true, true, false, true, true, true];
        let base = array![[0.2], [1.5], [0.7], [2.0], [0.1], [1.1]];
        let shifted = &base + 1000.0;
        let risk = RiskSets::new(&time, &event).unwrap();
        let a = fit_cox(base.view(), &risk, &CoxOptions::default()).unwrap();
        let b = fit_cox(shifted.view(), &risk, &CoxOptions::default()).unwrap();
        assert_abs_diff_eq!(a.coefficients[0], b.coefficients[0], epsilon = 1e-8);
    }

    #[test]
    fn complete_separation_is_rejected() {
        let risk = RiskSets::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[true; 6]).unwrap();
        let design = single_column(&[1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
        let err = fit_cox(design.view(), &risk, &CoxOptions::default()).unwrap_err();
        assert!(
            matches!(
                err,
                CoxError::MonotoneLikelihood { column: 0 } | CoxError::SingularInformation
            ),
            "unexpected error {err:?}"
        );
    }

    #[test]
    fn constant_column_and_missing_events_fail_fast() {
        let risk = RiskSets::new(&[1.0, 2.0, 3.0], &[true, false, true]).unwrap();
        let design = array![[1.0, 0.3], [1.0, 0.9], [1.0, 0.4]];
        assert_eq!(
            fit_cox(design.view(), &risk, &CoxOptions::default()).unwrap_err(),
            CoxError::ConstantColumn { column: 0 }
        );

        let no_events = RiskSets::new(&[1.0, 2.0, 3.0], &[false; 3]).unwrap();
        let design = single_column(&[0.3, 0.9, 0.4]);
        assert_eq!(
            fit_cox(design.view(), &no_events, &CoxOptions::default()).unwrap_err(),
            CoxError::NoEvents
        );
    }

    #[test]
    fn duplicated_columns_give_singular_information() {
        let risk = RiskSets::new(&[3.0, 1.0, 4.0, 1.5, 5.0, 2.5], &[true; 6]).unwrap();
        let x = [0.0, 1.0, 1.0, 0.0, 1.0, 0.0];
        let design = Array2::from_shape_fn((6, 2), |(i, _)| x[i]);
        assert_eq!(
            fit_cox(design.view(), &risk, &CoxOptions::default()).unwrap_err(),
            CoxError::SingularInformation
        );
    }

    #[test]
    fn wald_p_value_is_two_sided() {
        assert_abs_diff_eq!(wald_p_value(1.959963984540054, 1.0), 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(wald_p_value(-1.959963984540054, 1.0), 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(wald_p_value(0.0, 2.0), 1.0, epsilon = 1e-12);
        assert!(wald_p_value(1.0, 0.0).is_nan());
    }
}
