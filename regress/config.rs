//! Run configuration: a TOML file, command-line overrides on top, and a manifest stored
//! in the output directory so a resumed run cannot silently mix two model definitions.

use crate::cox::CoxOptions;
use crate::types::{CovariateMode, GridDims, InteractionVariable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_FILE_NAME: &str = "run_config.toml";
pub const DEFAULT_MASK_TEMPLATE: &str = "{id}.nii.gz";
pub const DEFAULT_THRESHOLD: usize = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting '{0}'. Pass it on the command line or in the --config file.")]
    MissingField(&'static str),
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse TOML file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize the run manifest to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(
        "The output directory was produced by a different model definition ({fields}). Pass --rebuild to start over, or point --output elsewhere. Manifest: '{path}'"
    )]
    ManifestMismatch { path: PathBuf, fields: String },
}

/// Fully resolved settings for one run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub clinical: PathBuf,
    pub mask_dir: PathBuf,
    pub mask_template: String,
    /// Geometry source for output maps. Defaults to the first patient mask found.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reference: Option<PathBuf>,
    pub output: PathBuf,
    pub covariates: CovariateMode,
    pub interaction: InteractionVariable,
    /// Minimum number of patients with the indicator set for a location to be fitted.
    pub threshold: usize,
    pub rebuild: bool,
    pub parallel: bool,
    pub workers: usize,
    pub cox: CoxOptions,
}

/// Partial settings from a config file or the command line. Every field is optional;
/// later layers win.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub clinical: Option<PathBuf>,
    pub mask_dir: Option<PathBuf>,
    pub mask_template: Option<String>,
    pub reference: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub covariates: Option<CovariateMode>,
    pub interaction: Option<InteractionVariable>,
    pub threshold: Option<usize>,
    pub rebuild: Option<bool>,
    pub parallel: Option<bool>,
    pub workers: Option<usize>,
    pub cox: Option<CoxOptions>,
}

impl ConfigOverrides {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Layer `top` over `self`; values present in `top` win.
    pub fn merge(self, top: ConfigOverrides) -> Self {
        Self {
            clinical: top.clinical.or(self.clinical),
            mask_dir: top.mask_dir.or(self.mask_dir),
            mask_template: top.mask_template.or(self.mask_template),
            reference: top.reference.or(self.reference),
            output: top.output.or(self.output),
            covariates: top.covariates.or(self.covariates),
            interaction: top.interaction.or(self.interaction),
            threshold: top.threshold.or(self.threshold),
            rebuild: top.rebuild.or(self.rebuild),
            parallel: top.parallel.or(self.parallel),
            workers: top.workers.or(self.workers),
            cox: top.cox.or(self.cox),
        }
    }

    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        Ok(RunConfig {
            clinical: self.clinical.ok_or(ConfigError::MissingField("clinical"))?,
            mask_dir: self.mask_dir.ok_or(ConfigError::MissingField("mask_dir"))?,
            mask_template: self
                .mask_template
                .unwrap_or_else(|| DEFAULT_MASK_TEMPLATE.to_string()),
            reference: self.reference,
            output: self.output.ok_or(ConfigError::MissingField("output"))?,
            covariates: self.covariates.unwrap_or_default(),
            interaction: self.interaction.unwrap_or_default(),
            threshold: self.threshold.unwrap_or(DEFAULT_THRESHOLD),
            rebuild: self.rebuild.unwrap_or(false),
            parallel: self.parallel.unwrap_or(false),
            workers: self.workers.unwrap_or_else(num_cpus::get).max(1),
            cox: self.cox.unwrap_or_default(),
        })
    }
}

/// What a finished or partial run in an output directory was computed with.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunManifest {
    pub patients: usize,
    /// Patient ids in store column order.
    pub patient_ids: Vec<u32>,
    /// `clinical_digest` of the records the stores and results were computed from.
    pub clinical_digest: String,
    pub dims: GridDims,
    pub config: RunConfig,
}

impl RunManifest {
    pub fn path_in(output: &Path) -> PathBuf {
        output.join(MANIFEST_FILE_NAME)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let mut file = BufWriter::new(fs::File::create(path).map_err(write_error)?);
        file.write_all(toml_string.as_bytes()).map_err(write_error)?;
        file.flush().map_err(write_error)?;
        Ok(())
    }

    /// `Ok(None)` when no manifest exists yet.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Names of the settings that change regression results and differ from `stored`.
    pub fn differences(&self, stored: &RunManifest) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.config.covariates != stored.config.covariates {
            fields.push("covariates");
        }
        if self.config.interaction != stored.config.interaction {
            fields.push("interaction");
        }
        if self.config.threshold != stored.config.threshold {
            fields.push("threshold");
        }
        if self.config.cox != stored.config.cox {
            fields.push("cox");
        }
        if self.patients != stored.patients {
            fields.push("patient count");
        } else if self.patient_ids != stored.patient_ids {
            fields.push("patient ids or order");
        } else if self.clinical_digest != stored.clinical_digest {
            fields.push("clinical values");
        }
        if self.dims != stored.dims {
            fields.push("grid dimensions");
        }
        fields
    }

    /// Reject a resumed run whose model definition differs from the stored one.
    pub fn check_against(&self, stored: &RunManifest, path: &Path) -> Result<(), ConfigError> {
        let fields = self.differences(stored);
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ManifestMismatch {
                path: path.to_path_buf(),
                fields: fields.join(", "),
            })
        }
    }
}
