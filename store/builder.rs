//! # Slice store construction
//!
//! Masks are read one patient at a time; each patient's mask is cut into z-slices and
//! every slice file receives that patient's column. Patients are strictly sequential.
//! Within a patient, slices may be written in parallel because each slice file has
//! exactly one writer. A lock file held for the whole pass keeps a second builder (and
//! the regression phase) away from the stores.

use super::slice_store::{BuildLock, ColumnState, SliceStore, StoreError, WritePath};
use crate::progress::{RunProgressObserver, RunStage};
use crate::volume::{MaskSource, VolumeError};
use ndarray::{Array3, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read the mask of patient {patient_id}: {source}")]
    Mask {
        patient_id: u32,
        #[source]
        source: VolumeError,
    },
    #[error("mask source grid {found} does not match the slice store grid {expected}")]
    GridMismatch {
        expected: crate::types::GridDims,
        found: crate::types::GridDims,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub patients_written: usize,
    /// Patients whose columns were already final in every slice.
    pub patients_skipped: usize,
    /// Ids of patients without a mask; their columns hold zeros.
    pub missing_masks: Vec<u32>,
    pub slices_created: usize,
    pub fallback_rewrites: usize,
    pub slices_purged: usize,
}

pub struct SliceStoreBuilder<'a, M: MaskSource> {
    store: &'a SliceStore,
    masks: &'a M,
    patient_ids: &'a [u32],
    parallel: bool,
}

impl<'a, M: MaskSource> SliceStoreBuilder<'a, M> {
    /// `patient_ids[p]` owns column `p` of every slice.
    pub fn new(store: &'a SliceStore, masks: &'a M, patient_ids: &'a [u32]) -> Self {
        Self {
            store,
            masks,
            patient_ids,
            parallel: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn build(
        &self,
        rebuild: bool,
        progress: &dyn RunProgressObserver,
    ) -> Result<BuildReport, BuildError> {
        let dims = self.store.dims();
        if self.masks.dims() != dims {
            return Err(BuildError::GridMismatch {
                expected: dims,
                found: self.masks.dims(),
            });
        }
        if self.patient_ids.len() != self.store.patients() {
            return Err(StoreError::PatientOutOfRange {
                patient: self.patient_ids.len(),
                patients: self.store.patients(),
            }
            .into());
        }

        let _lock = BuildLock::acquire(self.store)?;
        let mut report = BuildReport::default();
        if rebuild {
            report.slices_purged = self.store.purge()?;
            log::info!("Rebuild requested: removed {} slice store files", report.slices_purged);
        }

        let finished = self.finished_patients()?;
        progress.on_stage_start(RunStage::StoreBuild, self.patient_ids.len());
        for (patient, &patient_id) in self.patient_ids.iter().enumerate() {
            if finished[patient] {
                report.patients_skipped += 1;
            } else {
                let mask = self
                    .masks
                    .load(patient_id)
                    .map_err(|source| BuildError::Mask { patient_id, source })?;
                if mask.is_none() {
                    log::warn!(
                        "No mask for patient {patient_id} at {}; treating pathology as absent at every location",
                        self.masks.location(patient_id)
                    );
                    report.missing_masks.push(patient_id);
                }
                self.write_patient(patient, mask.as_ref(), &mut report)?;
                report.patients_written += 1;
            }
            progress.on_stage_advance(RunStage::StoreBuild, patient + 1);
        }
        progress.on_stage_finish(RunStage::StoreBuild);

        log::info!(
            "Slice stores ready: {} patients written, {} already complete, {} without masks, {} slices created",
            report.patients_written,
            report.patients_skipped,
            report.missing_masks.len(),
            report.slices_created
        );
        if report.fallback_rewrites > 0 {
            log::warn!(
                "{} slice updates needed a full rewrite after an in-place write failed",
                report.fallback_rewrites
            );
        }
        Ok(report)
    }

    /// Patients whose column is `Written` in every slice.
    fn finished_patients(&self) -> Result<Vec<bool>, StoreError> {
        let patients = self.store.patients();
        let mut finished = vec![true; patients];
        for z in 0..self.store.dims().nz {
            if !self.store.exists(z) {
                return Ok(vec![false; patients]);
            }
            let states = self.store.column_states(z)?;
            for (done, state) in finished.iter_mut().zip(states) {
                *done &= state == ColumnState::Written;
            }
        }
        Ok(finished)
    }

    fn write_patient(
        &self,
        patient: usize,
        mask: Option<&Array3<u8>>,
        report: &mut BuildReport,
    ) -> Result<(), StoreError> {
        let write_slice = |z: usize| {
            let column = mask.map(|m| m.index_axis(Axis(2), z));
            self.store.write_column(z, patient, column)
        };
        let nz = self.store.dims().nz;
        let writes = if self.parallel {
            (0..nz).into_par_iter().map(write_slice).collect::<Result<Vec<_>, _>>()?
        } else {
            (0..nz).map(write_slice).collect::<Result<Vec<_>, _>>()?
        };
        for write in writes {
            report.slices_created += usize::from(write.created);
            report.fallback_rewrites += usize::from(write.path == WritePath::Fallback);
        }
        Ok(())
    }
}
