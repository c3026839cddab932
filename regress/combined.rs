//! Two-sided p-value for the sum of the interacting coefficient and the interaction
//! coefficient (`beta4 + beta6`), tested against a Student-t distribution.

use crate::volume::{ReferenceGeometry, VolumeError, read_volume_f64, write_float_volume};
use ndarray::{Array3, ArrayView3, Zip};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CombinedError {
    #[error(
        "{n_obs} observations with {n_predictors} predictors leave no residual degrees of freedom"
    )]
    NoDegreesOfFreedom { n_obs: usize, n_predictors: usize },
    #[error("input maps differ in shape: {0:?}")]
    ShapeMismatch(Vec<(usize, usize, usize)>),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("invalid Student-t parameters: {0}")]
    Distribution(String),
}

/// `n_obs - n_predictors - 1`, where `n_predictors` counts the intercept.
pub fn degrees_of_freedom(n_obs: usize, n_predictors: usize) -> Option<f64> {
    n_obs
        .checked_sub(n_predictors + 1)
        .filter(|&df| df > 0)
        .map(|df| df as f64)
}

/// Predictor count for a model with `covariates` columns, counting the intercept.
pub fn predictors_with_intercept(covariates: usize) -> usize {
    covariates + 1
}

/// P-value of `beta4 + beta6`. Non-positive or non-finite variance gives 0, the same
/// sentinel used for locations that were never fitted.
pub fn combined_p_value(
    beta4: f64,
    beta6: f64,
    var4: f64,
    var6: f64,
    cov46: f64,
    distribution: &StudentsT,
) -> f64 {
    let variance = var4 + var6 + 2.0 * cov46;
    if !variance.is_finite() || variance <= 0.0 {
        return 0.0;
    }
    let t = (beta4 + beta6) / variance.sqrt();
    if !t.is_finite() {
        return 0.0;
    }
    (2.0 * (1.0 - distribution.cdf(t.abs()))).clamp(0.0, 1.0)
}

/// Inputs of the combined test, one value per location.
pub struct CombinedInputs<'a> {
    pub beta4: ArrayView3<'a, f64>,
    pub beta6: ArrayView3<'a, f64>,
    pub var4: ArrayView3<'a, f64>,
    pub var6: ArrayView3<'a, f64>,
    pub cov46: ArrayView3<'a, f64>,
}

pub fn combined_p_map(inputs: &CombinedInputs<'_>, df: f64) -> Result<Array3<f64>, CombinedError> {
    let shapes = vec![
        inputs.beta4.dim(),
        inputs.beta6.dim(),
        inputs.var4.dim(),
        inputs.var6.dim(),
        inputs.cov46.dim(),
    ];
    if shapes.iter().any(|s| *s != shapes[0]) {
        return Err(CombinedError::ShapeMismatch(shapes));
    }
    let distribution =
        StudentsT::new(0.0, 1.0, df).map_err(|e| CombinedError::Distribution(e.to_string()))?;

    let mut out = Array3::<f64>::zeros(shapes[0]);
    Zip::from(&mut out)
        .and(&inputs.beta4)
        .and(&inputs.beta6)
        .and(&inputs.var4)
        .and(&inputs.var6)
        .and(&inputs.cov46)
        .for_each(|p, &b4, &b6, &v4, &v6, &c46| {
            *p = combined_p_value(b4, b6, v4, v6, c46, &distribution);
        });
    Ok(out)
}

/// Map files consumed by the standalone combination step.
#[derive(Debug, Clone)]
pub struct CombineFiles {
    pub beta4: PathBuf,
    pub beta6: PathBuf,
    pub var4: PathBuf,
    pub var6: PathBuf,
    pub cov46: PathBuf,
}

/// Read five maps, compute the combined p-value map and write it with the geometry of
/// the `beta4` map.
pub fn combine_files(
    files: &CombineFiles,
    n_obs: usize,
    n_predictors: usize,
    output: &Path,
) -> Result<(), CombinedError> {
    let df = degrees_of_freedom(n_obs, n_predictors)
        .ok_or(CombinedError::NoDegreesOfFreedom { n_obs, n_predictors })?;
    let beta4 = read_volume_f64(&files.beta4)?;
    let beta6 = read_volume_f64(&files.beta6)?;
    let var4 = read_volume_f64(&files.var4)?;
    let var6 = read_volume_f64(&files.var6)?;
    let cov46 = read_volume_f64(&files.cov46)?;
    let map = combined_p_map(
        &CombinedInputs {
            beta4: beta4.view(),
            beta6: beta6.view(),
            var4: var4.view(),
            var6: var6.view(),
            cov46: cov46.view(),
        },
        df,
    )?;

    let geometry = ReferenceGeometry::from_path(&files.beta4)?;
    write_float_volume(output, &geometry, map.view())?;
    log::info!(
        "Wrote combined p-value map ({df} degrees of freedom) to {}",
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn t(df: f64) -> StudentsT {
        StudentsT::new(0.0, 1.0, df).unwrap()
    }

    #[test]
    fn degrees_of_freedom_count_the_intercept() {
        assert_eq!(degrees_of_freedom(40, predictors_with_intercept(6)), Some(32.0));
        assert_eq!(degrees_of_freedom(8, 7), None);
        assert_eq!(degrees_of_freedom(3, 7), None);
    }

    #[test]
    fn matches_the_student_t_tail() {
        // var = 0.04 + 0.09 - 0.02, t = 0.5 / sqrt(0.11), df = 33.
        let p = combined_p_value(0.8, -0.3, 0.04, 0.09, -0.01, &t(33.0));
        assert_abs_diff_eq!(p, 0.141182586296, epsilon = 1e-7);
        let p = combined_p_value(2.0, 0.0, 1.0, 0.0, 0.0, &t(10.0));
        assert_abs_diff_eq!(p, 0.073388034771, epsilon = 1e-7);
    }

    #[test]
    fn invalid_variance_yields_the_zero_sentinel() {
        assert_eq!(combined_p_value(0.0, 0.0, 0.0, 0.0, 0.0, &t(10.0)), 0.0);
        assert_eq!(combined_p_value(1.0, 1.0, 0.1, 0.1, -0.2, &t(10.0)), 0.0);
        assert_eq!(combined_p_value(1.0, 1.0, f64::NAN, 0.1, 0.0, &t(10.0)), 0.0);
    }

    #[test]
    fn map_applies_per_location() {
        let zeros = Array3::<f64>::zeros((2, 1, 1));
        let mut beta4 = zeros.clone();
        let mut var4 = zeros.clone();
        beta4[[1, 0, 0]] = 2.0;
        var4[[1, 0, 0]] = 1.0;
        let inputs = CombinedInputs {
            beta4: beta4.view(),
            beta6: zeros.view(),
            var4: var4.view(),
            var6: zeros.view(),
            cov46: zeros.view(),
        };
        let map = combined_p_map(&inputs, 10.0).unwrap();
        assert_eq!(map[[0, 0, 0]], 0.0);
        assert_abs_diff_eq!(map[[1, 0, 0]], 0.073388034771, epsilon = 1e-7);
    }

    #[test]
    fn combine_files_writes_a_map_on_the_beta4_grid() {
        use crate::types::GridDims;
        let dir = tempfile::tempdir().unwrap();
        let geometry = ReferenceGeometry::synthetic(GridDims::new(2, 1, 1), (2.0, 2.0, 2.0));
        let mut beta4 = Array3::<f64>::zeros((2, 1, 1));
        let mut var4 = beta4.clone();
        beta4[[1, 0, 0]] = 2.0;
        var4[[1, 0, 0]] = 1.0;
        let zeros = Array3::<f64>::zeros((2, 1, 1));
        let path = |name: &str| dir.path().join(format!("{name}.nii.gz"));
        for (name, volume) in [
            ("beta4", &beta4),
            ("beta6", &zeros),
            ("var4", &var4),
            ("var6", &zeros),
            ("cov46", &zeros),
        ] {
            write_float_volume(&path(name), &geometry, volume.view()).unwrap();
        }
        let files = CombineFiles {
            beta4: path("beta4"),
            beta6: path("beta6"),
            var4: path("var4"),
            var6: path("var6"),
            cov46: path("cov46"),
        };

        // 18 observations, 7 predictors: df = 10.
        combine_files(&files, 18, 7, &path("combined")).unwrap();
        let map = read_volume_f64(&path("combined")).unwrap();
        assert_eq!(map[[0, 0, 0]], 0.0);
        assert_abs_diff_eq!(map[[1, 0, 0]], 0.073388034771, epsilon = 1e-6);

        assert!(matches!(
            combine_files(&files, 8, 7, &path("none")),
            Err(CombinedError::NoDegreesOfFreedom { .. })
        ));
    }
}
