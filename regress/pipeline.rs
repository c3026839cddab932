//! # Run orchestration
//!
//! Ties the phases together against one output directory:
//!
//! ```text
//! <output>/run_config.toml        manifest of the model definition
//! <output>/slices/                slice stores (build phase)
//! <output>/results/<kind>/        per-slice results (regression phase)
//! <output>/run_report.tsv         per-slice account of the last regression pass
//! <output>/maps/*.nii.gz          reconstructed volumes
//! ```
//!
//! The build and regression phases never overlap: regression refuses to start while the
//! build lock exists.

use crate::clinical::{ClinicalDataError, PatientRecord, clinical_digest, load_clinical_table};
use crate::config::{ConfigError, RunConfig, RunManifest};
use crate::cox::CoxError;
use crate::engine::LocationRegressionEngine;
use crate::executor::{ExecutionMode, ExecutorError, SliceRegressor};
use crate::progress::RunProgressObserver;
use crate::reconstruct::{ReconstructError, reconstruct_all};
use crate::report::{ReportError, RunReport};
use crate::store::{
    BuildError, BuildReport, ResidentGauge, ResultFileError, ResultStore, SliceStore,
    SliceStoreBuilder,
};
use crate::types::{CovariateLayout, GridDims};
use crate::volume::{MaskTemplate, NiftiMapWriter, NiftiMaskSource, ReferenceGeometry, VolumeError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Clinical data error: {0}")]
    Clinical(#[from] ClinicalDataError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Volume I/O error: {0}")]
    Volume(#[from] VolumeError),
    #[error("Slice store build failed: {0}")]
    Build(#[from] BuildError),
    #[error("Result file error: {0}")]
    Results(#[from] ResultFileError),
    #[error("Execution error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Reconstruction failed: {0}")]
    Reconstruct(#[from] ReconstructError),
    #[error("{0}")]
    Report(#[from] ReportError),
    #[error("Invalid survival data: {0}")]
    Survival(#[from] CoxError),
    #[error("Failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "No reference volume was given and no patient mask exists in '{0}' to take the geometry from."
    )]
    NoReference(PathBuf),
    #[error("The reference grid {0} is empty.")]
    EmptyGrid(GridDims),
    #[error("{} slices failed during regression ({failed:?}); rerun to retry them before reconstructing.", .failed.len())]
    IncompleteRegression { failed: Vec<usize> },
}

/// Locations inside the output directory.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub root: PathBuf,
}

impl OutputPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn slices(&self) -> PathBuf {
        self.root.join("slices")
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn maps(&self) -> PathBuf {
        self.root.join("maps")
    }

    pub fn report(&self) -> PathBuf {
        self.root.join("run_report.tsv")
    }

    pub fn manifest(&self) -> PathBuf {
        RunManifest::path_in(&self.root)
    }
}

fn create_dir(path: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(path).map_err(|source| PipelineError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// An opened run: clinical table loaded, geometry known, manifest checked.
pub struct Pipeline {
    config: RunConfig,
    records: Vec<PatientRecord>,
    layout: CovariateLayout,
    geometry: ReferenceGeometry,
    template: MaskTemplate,
    paths: OutputPaths,
}

impl Pipeline {
    pub fn open(config: RunConfig) -> Result<Self, PipelineError> {
        let table = load_clinical_table(&config.clinical)?;
        log::info!(
            "Loaded {} patients from {} ({} rows without survival time excluded)",
            table.len(),
            config.clinical.display(),
            table.dropped_missing_survival
        );
        let records = table.records;
        let template = MaskTemplate::parse(&config.mask_template)?;
        let geometry = match &config.reference {
            Some(path) => ReferenceGeometry::from_path(path)?,
            None => {
                let first_mask = records
                    .iter()
                    .map(|r| config.mask_dir.join(template.file_name(r.id)))
                    .find(|path| path.is_file())
                    .ok_or_else(|| PipelineError::NoReference(config.mask_dir.clone()))?;
                log::info!("Using {} as the reference geometry", first_mask.display());
                ReferenceGeometry::from_path(&first_mask)?
            }
        };
        let dims = geometry.dims();
        if dims.is_empty() {
            return Err(PipelineError::EmptyGrid(dims));
        }
        let layout = CovariateLayout::resolve(config.covariates, config.interaction);
        log::info!(
            "Grid {dims}; covariates: {}",
            layout.column_names().join(", ")
        );

        let paths = OutputPaths::new(&config.output);
        create_dir(&paths.root)?;
        let manifest = RunManifest {
            patients: records.len(),
            patient_ids: records.iter().map(|r| r.id).collect(),
            clinical_digest: clinical_digest(&records),
            dims,
            config: config.clone(),
        };
        let manifest_path = paths.manifest();
        if config.rebuild {
            ResultStore::new(paths.results(), dims, layout).purge()?;
            log::info!("Rebuild requested: cleared previous results");
        } else if let Some(stored) = RunManifest::load(&manifest_path)? {
            manifest.check_against(&stored, &manifest_path)?;
        }
        manifest.save(&manifest_path)?;

        Ok(Self {
            config,
            records,
            layout,
            geometry,
            template,
            paths,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn records(&self) -> &[PatientRecord] {
        &self.records
    }

    pub fn dims(&self) -> GridDims {
        self.geometry.dims()
    }

    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }

    pub fn slice_store(&self) -> SliceStore {
        SliceStore::new(self.paths.slices(), self.dims(), self.records.len())
    }

    pub fn result_store(&self) -> ResultStore {
        ResultStore::new(self.paths.results(), self.dims(), self.layout)
    }

    pub fn build_stores(&self, progress: &dyn RunProgressObserver) -> Result<BuildReport, PipelineError> {
        let store = self.slice_store();
        let masks = NiftiMaskSource::new(&self.config.mask_dir, self.template.clone(), self.dims());
        let ids: Vec<u32> = self.records.iter().map(|r| r.id).collect();
        let report = SliceStoreBuilder::new(&store, &masks, &ids)
            .parallel(self.config.parallel)
            .build(self.config.rebuild, progress)?;
        Ok(report)
    }

    /// Regress every slice without results. Returns the pass report; failed slices are
    /// listed in it rather than returned as an error.
    pub fn regress(
        &self,
        progress: &dyn RunProgressObserver,
        gauge: &ResidentGauge,
    ) -> Result<RunReport, PipelineError> {
        let engine = LocationRegressionEngine::new(
            self.layout,
            &self.records,
            self.config.threshold,
            self.config.cox,
        )?;
        let store = self.slice_store();
        let results = self.result_store();
        let mode = ExecutionMode::from_flags(self.config.parallel, self.config.workers);
        log::info!("Regressing {} slices ({mode:?})", self.dims().nz);

        let outcome = SliceRegressor::new(&store, &results, &engine, gauge).run(mode, progress)?;
        let report = RunReport::from_outcome(&outcome);
        report.write_tsv(&self.paths.report())?;
        report.log_summary();
        log::debug!("Peak resident slice data: {} bytes", gauge.peak());
        Ok(report)
    }

    pub fn reconstruct(&self, progress: &dyn RunProgressObserver) -> Result<Vec<String>, PipelineError> {
        let maps_dir = self.paths.maps();
        create_dir(&maps_dir)?;
        let writer = NiftiMapWriter::new(maps_dir, self.geometry.clone());
        let names = reconstruct_all(&self.result_store(), self.records.len(), &writer, progress)?;
        Ok(names)
    }

    /// Build, regress, and reconstruct. Reconstruction only runs when every slice has
    /// results.
    pub fn run(&self, progress: &dyn RunProgressObserver) -> Result<Vec<String>, PipelineError> {
        self.build_stores(progress)?;
        let gauge = ResidentGauge::new();
        let report = self.regress(progress, &gauge)?;
        let failed = report.failed_slices();
        if !failed.is_empty() {
            return Err(PipelineError::IncompleteRegression { failed });
        }
        self.reconstruct(progress)
    }
}
