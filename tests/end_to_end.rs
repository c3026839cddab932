mod common;

use common::*;
use std::fs;
use voxsurv::config::ConfigError;
use voxsurv::pipeline::{Pipeline, PipelineError};
use voxsurv::progress::NoopRunProgress;
use voxsurv::report::SliceRow;
use voxsurv::store::ResidentGauge;
use voxsurv::types::{CovariateMode, GridDims, OutputKind};
use voxsurv::volume::read_volume_f64;

fn eight_patient_workspace(nz: usize) -> Workspace {
    let ws = Workspace::new();
    let records = eight_patient_cohort();
    write_clinical_tsv(&ws.clinical(), &records);
    write_masks(&ws.masks(), GridDims::new(4, 4, nz), &records, &eight_patient_masks(nz));
    ws
}

#[test]
fn eight_patient_single_slice_run() {
    let ws = eight_patient_workspace(1);
    let config = ws.overrides("out").resolve().expect("config");
    assert_eq!(config.threshold, 5);
    let pipeline = Pipeline::open(config).expect("open pipeline");
    assert_eq!(pipeline.records().len(), 8);
    assert_eq!(pipeline.dims(), GridDims::new(4, 4, 1));

    let names = pipeline.run(&NoopRunProgress).expect("run");
    assert_eq!(
        names,
        vec!["beta_cov3", "p_cov3", "beta_cov4", "p_cov4", "beta_cov5", "p_cov5", "lesion_count"]
    );

    let maps = pipeline.paths().maps();
    let beta = read_volume_f64(&maps.join("beta_cov5.nii.gz")).expect("beta map");
    let p = read_volume_f64(&maps.join("p_cov5.nii.gz")).expect("p map");
    let count = read_volume_f64(&maps.join("lesion_count.nii.gz")).expect("count map");
    assert_eq!(beta.dim(), (4, 4, 1));

    // Short survivors carry the lesion at (1, 1), so its hazard ratio exceeds one.
    assert!(beta[[1, 1, 0]] > 0.0, "indicator coefficient {}", beta[[1, 1, 0]]);
    assert!(p[[1, 1, 0]] > 0.0 && p[[1, 1, 0]] <= 1.0);
    assert_eq!(count[[1, 1, 0]], 5.0);

    // Three patients at (2, 2): below threshold, sentinel zeros.
    assert_eq!(count[[2, 2, 0]], 3.0);
    assert_eq!(beta[[2, 2, 0]], 0.0);
    assert_eq!(p[[2, 2, 0]], 0.0);
    assert_eq!(count[[0, 0, 0]], 0.0);
    assert_eq!(beta[[0, 0, 0]], 0.0);

    let report = fs::read_to_string(pipeline.paths().report()).expect("run report");
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "0\tprocessed\t1\t15\t0\t");
}

#[test]
fn sequential_and_pooled_runs_write_identical_results() {
    let ws = eight_patient_workspace(3);
    let mut pooled = ws.overrides("pooled");
    pooled.parallel = Some(true);
    pooled.workers = Some(3);
    pooled.covariates = Some(CovariateMode::Six);
    let mut sequential = ws.overrides("sequential");
    sequential.covariates = Some(CovariateMode::Six);

    let a = Pipeline::open(sequential.resolve().unwrap()).unwrap();
    let b = Pipeline::open(pooled.resolve().unwrap()).unwrap();
    let names_a = a.run(&NoopRunProgress).expect("sequential run");
    let names_b = b.run(&NoopRunProgress).expect("pooled run");
    assert_eq!(names_a, names_b);

    for kind in [
        OutputKind::Coefficients,
        OutputKind::PValues,
        OutputKind::VarCov,
        OutputKind::Counts,
    ] {
        for z in 0..3 {
            let left = fs::read(a.result_store().path(kind, z)).unwrap();
            let right = fs::read(b.result_store().path(kind, z)).unwrap();
            assert_eq!(left, right, "{kind:?} differs on slice {z}");
        }
    }
    for z in 0..3 {
        let left = fs::read(a.slice_store().slice_path(z)).unwrap();
        let right = fs::read(b.slice_store().slice_path(z)).unwrap();
        assert_eq!(left, right, "slice store {z} differs");
    }
    for name in &names_a {
        let file = format!("{name}.nii.gz");
        let left = read_volume_f64(&a.paths().maps().join(&file)).unwrap();
        let right = read_volume_f64(&b.paths().maps().join(&file)).unwrap();
        assert_eq!(left, right, "map {name} differs");
    }
}

#[test]
fn regression_resumes_only_the_slices_without_results() {
    let ws = eight_patient_workspace(3);
    let pipeline = Pipeline::open(ws.overrides("out").resolve().unwrap()).unwrap();
    pipeline.build_stores(&NoopRunProgress).unwrap();
    let gauge = ResidentGauge::new();
    let first = pipeline.regress(&NoopRunProgress, &gauge).unwrap();
    assert!(first.failed_slices().is_empty());

    let results = pipeline.result_store();
    let before = fs::read(results.path(OutputKind::Coefficients, 1)).unwrap();
    fs::remove_file(results.path(OutputKind::Counts, 1)).unwrap();

    let second = pipeline.regress(&NoopRunProgress, &gauge).unwrap();
    let rows = second.rows();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], (0, SliceRow::AlreadyComplete));
    assert!(matches!(rows[1], (1, SliceRow::Processed(_))));
    assert_eq!(rows[2], (2, SliceRow::AlreadyComplete));
    assert_eq!(fs::read(results.path(OutputKind::Coefficients, 1)).unwrap(), before);
    assert!(results.missing_slices().is_empty());
}

#[test]
fn reopening_with_a_different_model_requires_rebuild() {
    let ws = eight_patient_workspace(1);
    let pipeline = Pipeline::open(ws.overrides("out").resolve().unwrap()).unwrap();
    pipeline.run(&NoopRunProgress).unwrap();

    let mut changed = ws.overrides("out");
    changed.threshold = Some(3);
    match Pipeline::open(changed.clone().resolve().unwrap()) {
        Err(PipelineError::Config(ConfigError::ManifestMismatch { fields, .. })) => {
            assert_eq!(fields, "threshold");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("a changed threshold must not reuse old results"),
    }

    // Execution settings are not part of the model definition.
    let mut pooled = ws.overrides("out");
    pooled.parallel = Some(true);
    assert!(Pipeline::open(pooled.resolve().unwrap()).is_ok());

    changed.rebuild = Some(true);
    let rebuilt = Pipeline::open(changed.resolve().unwrap()).expect("rebuild accepted");
    assert_eq!(rebuilt.result_store().missing_slices(), vec![0]);
    rebuilt.run(&NoopRunProgress).unwrap();
    // (2, 2) now reaches the threshold, leaving 14 locations below it.
    let report = fs::read_to_string(rebuilt.paths().report()).unwrap();
    let fields: Vec<&str> = report.lines().nth(1).unwrap().split('\t').collect();
    assert_eq!(fields[1], "processed");
    assert_eq!(fields[3], "14");
}

fn expect_mismatch(result: Result<Pipeline, PipelineError>, expected: &str) {
    match result {
        Err(PipelineError::Config(ConfigError::ManifestMismatch { fields, .. })) => {
            assert_eq!(fields, expected);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("stores built for other patients must not be reused"),
    }
}

#[test]
fn reordered_or_edited_clinical_table_requires_rebuild() {
    let ws = eight_patient_workspace(1);
    let pipeline = Pipeline::open(ws.overrides("out").resolve().unwrap()).unwrap();
    pipeline.run(&NoopRunProgress).unwrap();

    let mut reversed = eight_patient_cohort();
    reversed.reverse();
    write_clinical_tsv(&ws.clinical(), &reversed);
    expect_mismatch(
        Pipeline::open(ws.overrides("out").resolve().unwrap()),
        "patient ids or order",
    );

    let mut edited = eight_patient_cohort();
    edited[3].survival_time = 9.0;
    write_clinical_tsv(&ws.clinical(), &edited);
    expect_mismatch(
        Pipeline::open(ws.overrides("out").resolve().unwrap()),
        "clinical values",
    );

    // A rebuild re-derives every column from the reordered table.
    write_clinical_tsv(&ws.clinical(), &reversed);
    let mut rebuild = ws.overrides("out");
    rebuild.rebuild = Some(true);
    let rebuilt = Pipeline::open(rebuild.resolve().unwrap()).expect("rebuild accepted");
    let report = rebuilt.build_stores(&NoopRunProgress).unwrap();
    assert_eq!(report.patients_written, 8);
    let gauge = ResidentGauge::new();
    let slice = rebuilt.slice_store().load(0, &gauge).unwrap();
    let mut expected = FIVE_OF_EIGHT.to_vec();
    expected.reverse();
    assert_eq!(slice.indicator(1, 1), expected.as_slice());
}

#[test]
fn missing_masks_keep_patients_in_the_population() {
    let ws = Workspace::new();
    let records = eight_patient_cohort();
    write_clinical_tsv(&ws.clinical(), &records);
    let mut masks = eight_patient_masks(1);
    // Patient 4 has no lesion at (1, 1) or (2, 2); dropping the file changes nothing.
    masks[3] = None;
    write_masks(&ws.masks(), GridDims::new(4, 4, 1), &records, &masks);

    let pipeline = Pipeline::open(ws.overrides("out").resolve().unwrap()).unwrap();
    let report = pipeline.build_stores(&NoopRunProgress).unwrap();
    assert_eq!(report.missing_masks, vec![4]);
    assert_eq!(report.patients_written, 8);

    let gauge = ResidentGauge::new();
    let slice = pipeline.slice_store().load(0, &gauge).unwrap();
    assert_eq!(slice.indicator(1, 1), &FIVE_OF_EIGHT[..]);
    assert_eq!(slice.count(2, 2), 3);
}

#[test]
fn reconstruction_refuses_to_run_with_missing_slices() {
    let ws = eight_patient_workspace(2);
    let pipeline = Pipeline::open(ws.overrides("out").resolve().unwrap()).unwrap();
    assert!(matches!(
        pipeline.reconstruct(&NoopRunProgress),
        Err(PipelineError::Reconstruct(_))
    ));
}
