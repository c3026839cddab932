//! # Volume reconstruction
//!
//! Per-slice result files are stacked back into full volumes, one output map at a time,
//! walking z in ascending order. Maps are named by covariate position, not by variable:
//! `beta_cov4` is always the variable paired with the indicator.

use crate::combined::{
    CombinedError, combined_p_value, degrees_of_freedom, predictors_with_intercept,
};
use crate::progress::{RunProgressObserver, RunStage};
use crate::store::{ResultFileError, ResultStore};
use crate::types::{
    CovariateLayout, INTERACTING_COLUMN, INTERACTION_COLUMN, OutputKind,
};
use crate::volume::{MapWriter, VolumeError};
use ndarray::{Array3, s};
use statrs::distribution::StudentsT;
use thiserror::Error;

/// First covariate (one-based) that gets coefficient and p-value maps.
const FIRST_MAPPED_COVARIATE: usize = 3;

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error(
        "result files are missing for slices {0:?}; rerun the regression to fill them in before reconstructing"
    )]
    MissingSlices(Vec<usize>),
    #[error(transparent)]
    Results(#[from] ResultFileError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Combined(#[from] CombinedError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapSource {
    Channel { kind: OutputKind, channel: usize },
    /// P-value of `beta4 + beta6` with the given residual degrees of freedom.
    CombinedInteraction { df: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapSpec {
    pub name: String,
    pub source: MapSource,
}

impl MapSpec {
    fn channel(name: String, kind: OutputKind, channel: usize) -> Self {
        Self {
            name,
            source: MapSource::Channel { kind, channel },
        }
    }
}

/// Every map produced for `layout` with `patients` patients in the regression.
pub fn map_specs(layout: &CovariateLayout, patients: usize) -> Vec<MapSpec> {
    let k = layout.len();
    let mut specs = Vec::new();
    for covariate in FIRST_MAPPED_COVARIATE..=k {
        specs.push(MapSpec::channel(
            format!("beta_cov{covariate}"),
            OutputKind::Coefficients,
            covariate - 1,
        ));
        specs.push(MapSpec::channel(
            format!("p_cov{covariate}"),
            OutputKind::PValues,
            covariate - 1,
        ));
    }
    if layout.has_interaction() {
        let interacting = INTERACTING_COLUMN + 1;
        let interaction = INTERACTION_COLUMN + 1;
        specs.push(MapSpec::channel(format!("var_cov{interacting}"), OutputKind::VarCov, 0));
        specs.push(MapSpec::channel(format!("var_cov{interaction}"), OutputKind::VarCov, 1));
        specs.push(MapSpec::channel(
            format!("cov_cov{interacting}_cov{interaction}"),
            OutputKind::VarCov,
            2,
        ));
        match degrees_of_freedom(patients, predictors_with_intercept(k)) {
            Some(df) => specs.push(MapSpec {
                name: format!("p_combined_cov{interacting}_cov{interaction}"),
                source: MapSource::CombinedInteraction { df },
            }),
            None => log::warn!(
                "Skipping the combined interaction p-value map: {patients} patients leave no degrees of freedom for {} predictors",
                predictors_with_intercept(k)
            ),
        }
    }
    specs.push(MapSpec::channel("lesion_count".to_string(), OutputKind::Counts, 0));
    specs
}

/// Stack one map from the per-slice results, z ascending.
pub fn reconstruct_map(results: &ResultStore, source: MapSource) -> Result<Array3<f64>, ReconstructError> {
    let dims = results.dims();
    let missing = results.missing_slices();
    if !missing.is_empty() {
        return Err(ReconstructError::MissingSlices(missing));
    }

    let mut volume = Array3::<f64>::zeros((dims.nx, dims.ny, dims.nz));
    match source {
        MapSource::Channel { kind, channel } => {
            for z in 0..dims.nz {
                let values = results.read(kind, z)?;
                volume
                    .slice_mut(s![.., .., z])
                    .assign(&values.slice(s![.., .., channel]));
            }
        }
        MapSource::CombinedInteraction { df } => {
            let distribution = StudentsT::new(0.0, 1.0, df)
                .map_err(|e| CombinedError::Distribution(e.to_string()))?;
            for z in 0..dims.nz {
                let coefficients = results.read(OutputKind::Coefficients, z)?;
                let varcov = results.read(OutputKind::VarCov, z)?;
                for x in 0..dims.nx {
                    for y in 0..dims.ny {
                        volume[[x, y, z]] = combined_p_value(
                            coefficients[[x, y, INTERACTING_COLUMN]],
                            coefficients[[x, y, INTERACTION_COLUMN]],
                            varcov[[x, y, 0]],
                            varcov[[x, y, 1]],
                            varcov[[x, y, 2]],
                            &distribution,
                        );
                    }
                }
            }
        }
    }
    Ok(volume)
}

/// Reconstruct and write every map for the run. Returns the map names in write order.
pub fn reconstruct_all(
    results: &ResultStore,
    patients: usize,
    writer: &dyn MapWriter,
    progress: &dyn RunProgressObserver,
) -> Result<Vec<String>, ReconstructError> {
    let missing = results.missing_slices();
    if !missing.is_empty() {
        return Err(ReconstructError::MissingSlices(missing));
    }

    let specs = map_specs(results.layout(), patients);
    progress.on_stage_start(RunStage::Reconstruction, specs.len());
    let mut written = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let volume = reconstruct_map(results, spec.source)?;
        writer.write_map(&spec.name, volume.view())?;
        written.push(spec.name.clone());
        progress.on_stage_advance(RunStage::Reconstruction, index + 1);
    }
    progress.on_stage_finish(RunStage::Reconstruction);
    Ok(written)
}
