//! # Shared vocabulary of the regression pipeline
//!
//! Grid geometry, the covariate-count mode, the interaction-variable choice and the
//! fixed covariate layout tables they resolve to. The layout is decided exactly once
//! per run; nothing downstream branches on the raw interaction selection again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Extent of the common reference grid. `nz` is the slice axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDims {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl GridDims {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    /// Number of locations sharing one z-index.
    pub fn locations_per_slice(&self) -> usize {
        self.nx * self.ny
    }

    pub fn is_empty(&self) -> bool {
        self.nx == 0 || self.ny == 0 || self.nz == 0
    }
}

impl fmt::Display for GridDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

/// Number of covariates submitted to every location's fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CovariateMode {
    /// Four clinical covariates plus the location indicator.
    #[default]
    Five,
    /// As `Five`, plus the indicator interaction column.
    Six,
}

impl CovariateMode {
    pub fn covariate_count(self) -> usize {
        match self {
            Self::Five => 5,
            Self::Six => 6,
        }
    }

    pub fn has_interaction(self) -> bool {
        matches!(self, Self::Six)
    }
}

impl TryFrom<u8> for CovariateMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            other => Err(format!("covariate count must be 5 or 6, got {other}")),
        }
    }
}

impl From<CovariateMode> for u8 {
    fn from(value: CovariateMode) -> Self {
        value.covariate_count() as u8
    }
}

/// The clinical variable paired with the location indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionVariable {
    #[default]
    Treatment,
    Volume,
}

impl fmt::Display for InteractionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Treatment => f.write_str("treatment"),
            Self::Volume => f.write_str("volume"),
        }
    }
}

/// One column of the design matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Covariate {
    Age,
    Methylation,
    BaselineVolume,
    Treatment,
    Indicator,
    Interaction,
}

impl Covariate {
    pub fn name(self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Methylation => "methylation",
            Self::BaselineVolume => "baseline_volume",
            Self::Treatment => "treatment",
            Self::Indicator => "indicator",
            Self::Interaction => "interaction",
        }
    }
}

// The selected variable sits in column 4, directly before the indicator, and the
// interaction multiplies the indicator by that same column. The combined beta4 + beta6
// test reads the selected variable's total effect where the indicator is set, which only
// holds when column 6 is built from column 4.
const TREATMENT_LAYOUT: [Covariate; 6] = [
    Covariate::Age,
    Covariate::Methylation,
    Covariate::BaselineVolume,
    Covariate::Treatment,
    Covariate::Indicator,
    Covariate::Interaction,
];

const VOLUME_LAYOUT: [Covariate; 6] = [
    Covariate::Age,
    Covariate::Methylation,
    Covariate::Treatment,
    Covariate::BaselineVolume,
    Covariate::Indicator,
    Covariate::Interaction,
];

/// Number of constant clinical columns preceding the indicator.
pub const CLINICAL_COLUMNS: usize = 4;

/// Zero-based position of the variable paired with the indicator ("covariate 4").
pub const INTERACTING_COLUMN: usize = 3;

/// Zero-based position of the indicator ("covariate 5").
pub const INDICATOR_COLUMN: usize = 4;

/// Zero-based position of the interaction product ("covariate 6").
pub const INTERACTION_COLUMN: usize = 5;

/// Fixed column order for one run.
///
/// Column 4 (one-based) always holds the selected interaction variable and, in
/// six-covariate mode, column 6 is always `indicator * column 4`. Output maps are keyed
/// by these positions, so the tables above must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CovariateLayout {
    mode: CovariateMode,
    interaction: InteractionVariable,
    table: &'static [Covariate; 6],
}

impl CovariateLayout {
    pub fn resolve(mode: CovariateMode, interaction: InteractionVariable) -> Self {
        let table = match interaction {
            InteractionVariable::Treatment => &TREATMENT_LAYOUT,
            InteractionVariable::Volume => &VOLUME_LAYOUT,
        };
        Self {
            mode,
            interaction,
            table,
        }
    }

    pub fn mode(&self) -> CovariateMode {
        self.mode
    }

    pub fn interaction_variable(&self) -> InteractionVariable {
        self.interaction
    }

    pub fn len(&self) -> usize {
        self.mode.covariate_count()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn has_interaction(&self) -> bool {
        self.mode.has_interaction()
    }

    pub fn columns(&self) -> &'static [Covariate] {
        &self.table[..self.mode.covariate_count()]
    }

    pub fn clinical_columns(&self) -> &'static [Covariate] {
        &self.table[..CLINICAL_COLUMNS]
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns().iter().map(|c| c.name()).collect()
    }
}

/// Kinds of per-slice result files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Coefficients,
    PValues,
    /// `var(beta4)`, `var(beta6)`, `cov(beta4, beta6)`; interaction mode only.
    VarCov,
    /// Patients with indicator = 1 at the location. Written last for every slice.
    Counts,
}

impl OutputKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Coefficients => "coefficients",
            Self::PValues => "pvalues",
            Self::VarCov => "varcov",
            Self::Counts => "counts",
        }
    }

    pub fn channels(self, layout: &CovariateLayout) -> usize {
        match self {
            Self::Coefficients | Self::PValues => layout.len(),
            Self::VarCov => 3,
            Self::Counts => 1,
        }
    }

    /// Kinds produced for a layout, in write order.
    pub fn for_layout(layout: &CovariateLayout) -> Vec<OutputKind> {
        let mut kinds = vec![Self::Coefficients, Self::PValues];
        if layout.has_interaction() {
            kinds.push(Self::VarCov);
        }
        kinds.push(Self::Counts);
        kinds
    }
}
