//! Per-location design matrix assembly.
//!
//! The clinical block (columns 1 to 4) is identical at every location, so it is laid
//! out once per run. Only the indicator column and, in six-covariate mode, the
//! interaction column change from location to location.

use crate::clinical::PatientRecord;
use crate::types::{
    CLINICAL_COLUMNS, Covariate, CovariateLayout, INDICATOR_COLUMN, INTERACTING_COLUMN,
    INTERACTION_COLUMN,
};
use ndarray::{Array2, ArrayView2, s};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DesignError {
    #[error("indicator vector has {found} entries but the cohort has {expected} patients")]
    LengthMismatch { expected: usize, found: usize },
}

fn clinical_value(record: &PatientRecord, covariate: Covariate) -> f64 {
    match covariate {
        Covariate::Age => record.age,
        Covariate::Methylation => record.methylation,
        Covariate::BaselineVolume => record.baseline_volume,
        Covariate::Treatment => record.treatment,
        // Not clinical; the layout tables never place these in the first four columns.
        Covariate::Indicator | Covariate::Interaction => 0.0,
    }
}

/// Builds `n x k` design matrices in the run's fixed layout.
#[derive(Debug, Clone)]
pub struct DesignAssembler {
    layout: CovariateLayout,
    clinical: Array2<f64>,
}

impl DesignAssembler {
    pub fn new(layout: CovariateLayout, records: &[PatientRecord]) -> Self {
        let columns = layout.clinical_columns();
        let clinical = Array2::from_shape_fn((records.len(), CLINICAL_COLUMNS), |(row, col)| {
            clinical_value(&records[row], columns[col])
        });
        Self { layout, clinical }
    }

    pub fn layout(&self) -> &CovariateLayout {
        &self.layout
    }

    pub fn patients(&self) -> usize {
        self.clinical.nrows()
    }

    pub fn clinical_block(&self) -> ArrayView2<'_, f64> {
        self.clinical.view()
    }

    /// A reusable matrix with the clinical block already filled in.
    pub fn buffer(&self) -> Array2<f64> {
        let mut design = Array2::<f64>::zeros((self.patients(), self.layout.len()));
        design
            .slice_mut(s![.., ..CLINICAL_COLUMNS])
            .assign(&self.clinical);
        design
    }

    /// Overwrite the location-dependent columns of a matrix from [`Self::buffer`].
    pub fn fill_location(&self, indicator: &[u8], design: &mut Array2<f64>) -> Result<(), DesignError> {
        if indicator.len() != self.patients() {
            return Err(DesignError::LengthMismatch {
                expected: self.patients(),
                found: indicator.len(),
            });
        }
        let with_interaction = self.layout.has_interaction();
        for (row, &present) in indicator.iter().enumerate() {
            let value = f64::from(present);
            design[[row, INDICATOR_COLUMN]] = value;
            if with_interaction {
                design[[row, INTERACTION_COLUMN]] = value * self.clinical[[row, INTERACTING_COLUMN]];
            }
        }
        Ok(())
    }

    /// Allocate and fill a design matrix for one location.
    pub fn assemble(&self, indicator: &[u8]) -> Result<Array2<f64>, DesignError> {
        let mut design = self.buffer();
        self.fill_location(indicator, &mut design)?;
        Ok(design)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CovariateMode, InteractionVariable};

    fn record(id: u32, age: f64, volume: f64, treatment: f64, methylation: f64) -> PatientRecord {
        PatientRecord {
            id,
            site: "A".to_string(),
            age,
            censored: false,
            survival_time: 10.0,
            baseline_volume: volume,
            treatment,
            methylation,
        }
    }

    fn cohort() -> Vec<PatientRecord> {
        vec![
            record(1, 50.0, 12.5, 1.0, 0.0),
            record(2, 61.0, 30.0, 0.0, 1.0),
            record(3, 47.0, 8.25, 1.0, 1.0),
        ]
    }

    #[test]
    fn treatment_selection_multiplies_treatment_into_column_six() {
        let layout = CovariateLayout::resolve(CovariateMode::Six, InteractionVariable::Treatment);
        let assembler = DesignAssembler::new(layout, &cohort());
        let design = assembler.assemble(&[1, 1, 0]).unwrap();

        assert_eq!(design.dim(), (3, 6));
        assert_eq!(design.row(0).to_vec(), vec![50.0, 0.0, 12.5, 1.0, 1.0, 1.0]);
        assert_eq!(design.row(1).to_vec(), vec![61.0, 1.0, 30.0, 0.0, 1.0, 0.0]);
        assert_eq!(design.row(2).to_vec(), vec![47.0, 1.0, 8.25, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn volume_selection_multiplies_volume_into_column_six() {
        let layout = CovariateLayout::resolve(CovariateMode::Six, InteractionVariable::Volume);
        let assembler = DesignAssembler::new(layout, &cohort());
        let design = assembler.assemble(&[0, 1, 1]).unwrap();

        assert_eq!(design.row(0).to_vec(), vec![50.0, 0.0, 1.0, 12.5, 0.0, 0.0]);
        assert_eq!(design.row(1).to_vec(), vec![61.0, 1.0, 0.0, 30.0, 1.0, 30.0]);
        assert_eq!(design.row(2).to_vec(), vec![47.0, 1.0, 1.0, 8.25, 1.0, 8.25]);
        for row in design.rows() {
            assert_eq!(row[INTERACTION_COLUMN], row[INDICATOR_COLUMN] * row[INTERACTING_COLUMN]);
        }
    }

    #[test]
    fn five_covariate_mode_has_no_interaction_column() {
        let layout = CovariateLayout::resolve(CovariateMode::Five, InteractionVariable::Treatment);
        let assembler = DesignAssembler::new(layout, &cohort());
        let design = assembler.assemble(&[1, 0, 1]).unwrap();
        assert_eq!(design.dim(), (3, 5));
        assert_eq!(design.column(INDICATOR_COLUMN).to_vec(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn refilling_a_buffer_replaces_the_previous_location() {
        let layout = CovariateLayout::resolve(CovariateMode::Six, InteractionVariable::Treatment);
        let assembler = DesignAssembler::new(layout, &cohort());
        let mut design = assembler.buffer();
        assembler.fill_location(&[1, 1, 1], &mut design).unwrap();
        assembler.fill_location(&[0, 0, 1], &mut design).unwrap();
        assert_eq!(design, assembler.assemble(&[0, 0, 1]).unwrap());
    }

    #[test]
    fn indicator_length_must_match_the_cohort() {
        let layout = CovariateLayout::resolve(CovariateMode::Five, InteractionVariable::Treatment);
        let assembler = DesignAssembler::new(layout, &cohort());
        assert_eq!(
            assembler.assemble(&[1, 0]).unwrap_err(),
            DesignError::LengthMismatch { expected: 3, found: 2 }
        );
    }
}
