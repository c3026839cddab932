#![allow(dead_code)]

use ndarray::Array3;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use voxsurv::clinical::PatientRecord;
use voxsurv::config::ConfigOverrides;
use voxsurv::types::GridDims;
use voxsurv::volume::{ReferenceGeometry, write_float_volume};

pub const CLINICAL_HEADER: &str =
    "patient_id\tsite\tage\tcensoring\tsurvival_time\tbaseline_volume\ttreatment\tmethylation\n";

/// Indicator of the eight-patient cohort at location (1, 1); count 5.
pub const FIVE_OF_EIGHT: [u8; 8] = [1, 1, 1, 0, 1, 0, 0, 1];
/// Indicator at location (2, 2); count 3.
pub const THREE_OF_EIGHT: [u8; 8] = [1, 0, 1, 0, 0, 1, 0, 0];

fn record(
    id: u32,
    age: f64,
    methylation: f64,
    baseline_volume: f64,
    treatment: f64,
    survival_time: f64,
    censored: bool,
) -> PatientRecord {
    PatientRecord {
        id,
        site: if id % 2 == 0 { "UCSF" } else { "UCLA" }.to_string(),
        age,
        censored,
        survival_time,
        baseline_volume,
        treatment,
        methylation,
    }
}

/// Eight patients with known survival. Short survivors carry the lesion at (1, 1).
pub fn eight_patient_cohort() -> Vec<PatientRecord> {
    let age = [45.0, 62.0, 58.0, 70.0, 51.0, 66.0, 39.0, 55.0];
    let methylation = [0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0];
    let volume = [12.5, 30.1, 22.4, 41.0, 8.7, 27.3, 15.2, 19.8];
    let treatment = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0];
    let time = [23.0, 6.0, 31.0, 5.0, 8.0, 32.0, 15.0, 21.0];
    let censored = [false, false, true, false, false, true, false, false];
    (0..8)
        .map(|i| {
            record(
                i as u32 + 1,
                age[i],
                methylation[i],
                volume[i],
                treatment[i],
                time[i],
                censored[i],
            )
        })
        .collect()
}

/// Forty patients; `forty_patient_indicator` marks 17 of them.
pub fn forty_patient_cohort() -> Vec<PatientRecord> {
    let indicator = forty_patient_indicator();
    (0..40usize)
        .map(|i| {
            let treatment = (i % 2) as f64;
            let time = 12.0 + (i * 13 % 29) as f64 - 6.0 * f64::from(indicator[i]) + 3.0 * treatment;
            record(
                i as u32 + 101,
                40.0 + (i * 7 % 35) as f64,
                f64::from((i * 3 % 5) < 2),
                5.0 + (i * 11 % 37) as f64 * 1.3,
                treatment,
                time,
                i % 5 == 0,
            )
        })
        .collect()
}

pub fn forty_patient_indicator() -> Vec<u8> {
    (0..40usize).map(|i| u8::from((i * 5 % 7) < 3)).collect()
}

pub fn write_clinical_tsv(path: &Path, records: &[PatientRecord]) {
    let mut text = String::from(CLINICAL_HEADER);
    for r in records {
        writeln!(
            text,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.id,
            r.site,
            r.age,
            u8::from(r.censored),
            r.survival_time,
            r.baseline_volume,
            r.treatment,
            r.methylation
        )
        .expect("format clinical row");
    }
    fs::write(path, text).expect("write clinical table");
}

/// Write one binary mask per patient as `<dir>/<id>.nii.gz`, skipping `None` entries.
pub fn write_masks(dir: &Path, dims: GridDims, records: &[PatientRecord], masks: &[Option<Array3<u8>>]) {
    fs::create_dir_all(dir).expect("mask dir");
    let geometry = ReferenceGeometry::synthetic(dims, (1.0, 1.0, 1.0));
    for (record, mask) in records.iter().zip(masks) {
        if let Some(mask) = mask {
            let path = dir.join(format!("{}.nii.gz", record.id));
            write_float_volume(&path, &geometry, mask.mapv(f64::from).view()).expect("write mask");
        }
    }
}

/// Per-patient masks on a 4x4x`nz` grid with the eight-patient indicators at (1, 1) and
/// (2, 2) on every slice, plus a slice-dependent extra lesion at (3, 0) for z > 0.
pub fn eight_patient_masks(nz: usize) -> Vec<Option<Array3<u8>>> {
    (0..8)
        .map(|p| {
            let mut mask = Array3::<u8>::zeros((4, 4, nz));
            for z in 0..nz {
                mask[[1, 1, z]] = FIVE_OF_EIGHT[p];
                mask[[2, 2, z]] = THREE_OF_EIGHT[p];
                if z > 0 && p < z + 4 {
                    mask[[3, 0, z]] = 1;
                }
            }
            Some(mask)
        })
        .collect()
}

pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn clinical(&self) -> PathBuf {
        self.dir.path().join("clinical.tsv")
    }

    pub fn masks(&self) -> PathBuf {
        self.dir.path().join("masks")
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Overrides pointing at this workspace's inputs and the named output directory.
    pub fn overrides(&self, output: &str) -> ConfigOverrides {
        ConfigOverrides {
            clinical: Some(self.clinical()),
            mask_dir: Some(self.masks()),
            output: Some(self.output(output)),
            ..Default::default()
        }
    }
}
