//! # Clinical covariate table
//!
//! Reads the per-patient clinical table (TSV, or Parquet by extension) and turns it into
//! an ordered list of immutable [`PatientRecord`]s. Column names are fixed and matched
//! case-insensitively. Rows without a survival time are dropped here and never reach
//! the regression; a missing value anywhere else is a user error.
//!
//! Record order is significant: a patient's position in the returned list is its column
//! index in every slice store.

use polars::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const PATIENT_ID: &str = "patient_id";
const SITE: &str = "site";
const AGE: &str = "age";
const CENSORING: &str = "censoring";
const SURVIVAL_TIME: &str = "survival_time";
const BASELINE_VOLUME: &str = "baseline_volume";
const TREATMENT: &str = "treatment";
const METHYLATION: &str = "methylation";

const REQUIRED_COLUMNS: [&str; 8] = [
    PATIENT_ID,
    SITE,
    AGE,
    CENSORING,
    SURVIVAL_TIME,
    BASELINE_VOLUME,
    TREATMENT,
    METHYLATION,
];

/// Errors surfaced while ingesting the clinical table. All of them are fatal.
#[derive(Debug, Error)]
pub enum ClinicalDataError {
    #[error("Error from the underlying Polars library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the clinical table.")]
    ColumnNotFound(String),
    #[error(
        "Column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the column '{0}' for patients with a survival time.")]
    MissingValues(String),
    #[error("Non-finite values were found in the column '{0}'.")]
    NonFiniteValues(String),
    #[error("Censoring status for patient {patient_id} must be 0 (event) or 1 (censored), found {value}.")]
    InvalidCensoring { patient_id: u32, value: f64 },
    #[error("Patient id {0} appears more than once in the clinical table.")]
    DuplicatePatientId(u32),
    #[error("No patients with a recorded survival time remain in the clinical table.")]
    NoValidRecords,
}

/// One validated patient. Immutable after ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub id: u32,
    pub site: String,
    pub age: f64,
    /// `true` when follow-up ended before the event was observed.
    pub censored: bool,
    pub survival_time: f64,
    pub baseline_volume: f64,
    pub treatment: f64,
    pub methylation: f64,
}

impl PatientRecord {
    pub fn event_observed(&self) -> bool {
        !self.censored
    }
}

/// The ordered patient population of a run.
#[derive(Debug, Clone)]
pub struct ClinicalTable {
    pub records: Vec<PatientRecord>,
    /// Rows excluded because their survival time was missing.
    pub dropped_missing_survival: usize,
}

impl ClinicalTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// SHA-256 over every record's values, in order. Two tables with the same digest assign
/// the same patient and the same clinical values to every store column.
pub fn clinical_digest(records: &[PatientRecord]) -> String {
    let mut hasher = Sha256::new();
    for r in records {
        hasher.update(r.id.to_le_bytes());
        hasher.update((r.site.len() as u64).to_le_bytes());
        hasher.update(r.site.as_bytes());
        hasher.update([u8::from(r.censored)]);
        for value in [r.age, r.survival_time, r.baseline_volume, r.treatment, r.methylation] {
            hasher.update(value.to_bits().to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Load and validate the clinical table.
pub fn load_clinical_table(path: &Path) -> Result<ClinicalTable, ClinicalDataError> {
    let df = read_tabular(path)?;
    let name_map = build_case_insensitive_map(
        df.get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string()),
    );
    for required in REQUIRED_COLUMNS {
        if !name_map.contains_key(required) {
            return Err(ClinicalDataError::ColumnNotFound(required.to_string()));
        }
    }

    let survival_time = extract_optional_f64(&df, &name_map, SURVIVAL_TIME)?;
    let ids = extract_optional_i64(&df, &name_map, PATIENT_ID)?;
    let sites = extract_optional_string(&df, &name_map, SITE)?;
    let age = extract_optional_f64(&df, &name_map, AGE)?;
    let censoring = extract_optional_f64(&df, &name_map, CENSORING)?;
    let volume = extract_optional_f64(&df, &name_map, BASELINE_VOLUME)?;
    let treatment = extract_optional_f64(&df, &name_map, TREATMENT)?;
    let methylation = extract_optional_f64(&df, &name_map, METHYLATION)?;

    let mut records = Vec::with_capacity(survival_time.len());
    let mut seen = HashSet::new();
    let mut dropped = 0usize;
    for row in 0..survival_time.len() {
        let Some(time) = survival_time[row] else {
            dropped += 1;
            continue;
        };
        if !time.is_finite() {
            return Err(ClinicalDataError::NonFiniteValues(SURVIVAL_TIME.to_string()));
        }
        let id = required(&ids, row, PATIENT_ID)?;
        let id = u32::try_from(id).map_err(|_| ClinicalDataError::ColumnWrongType {
            column_name: PATIENT_ID.to_string(),
            expected_type: "non-negative 32-bit integer",
            found_type: format!("value {id}"),
        })?;
        if !seen.insert(id) {
            return Err(ClinicalDataError::DuplicatePatientId(id));
        }
        let censoring_value = finite(required(&censoring, row, CENSORING)?, CENSORING)?;
        let censored = if censoring_value == 0.0 {
            false
        } else if censoring_value == 1.0 {
            true
        } else {
            return Err(ClinicalDataError::InvalidCensoring {
                patient_id: id,
                value: censoring_value,
            });
        };
        let site = sites[row]
            .clone()
            .ok_or_else(|| ClinicalDataError::MissingValues(SITE.to_string()))?;

        records.push(PatientRecord {
            id,
            site,
            age: finite(required(&age, row, AGE)?, AGE)?,
            censored,
            survival_time: time,
            baseline_volume: finite(required(&volume, row, BASELINE_VOLUME)?, BASELINE_VOLUME)?,
            treatment: finite(required(&treatment, row, TREATMENT)?, TREATMENT)?,
            methylation: finite(required(&methylation, row, METHYLATION)?, METHYLATION)?,
        });
    }

    if dropped > 0 {
        log::info!(
            "Excluded {dropped} clinical rows without a survival time; {} patients remain.",
            records.len()
        );
    }
    if records.is_empty() {
        return Err(ClinicalDataError::NoValidRecords);
    }

    Ok(ClinicalTable {
        records,
        dropped_missing_survival: dropped,
    })
}

fn required<T: Copy>(values: &[Option<T>], row: usize, column: &str) -> Result<T, ClinicalDataError> {
    values[row].ok_or_else(|| ClinicalDataError::MissingValues(column.to_string()))
}

fn finite(value: f64, column: &str) -> Result<f64, ClinicalDataError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ClinicalDataError::NonFiniteValues(column.to_string()))
    }
}

fn read_tabular(path: &Path) -> Result<DataFrame, ClinicalDataError> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("parquet") | Some("pq") => {
            let file = File::open(path)?;
            ParquetReader::new(file)
                .finish()
                .map_err(ClinicalDataError::from)
        }
        _ => {
            let file = File::open(path)?;
            CsvReadOptions::default()
                .with_has_header(true)
                .map_parse_options(|options| options.with_separator(b'\t'))
                .into_reader_with_file_handle(file)
                .finish()
                .map_err(ClinicalDataError::from)
        }
    }
}

fn build_case_insensitive_map<I, S>(names: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut map = HashMap::new();
    for name in names {
        let original = name.as_ref().to_string();
        map.insert(original.to_ascii_lowercase(), original);
    }
    map
}

fn lookup<'a>(
    df: &'a DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<&'a Column, ClinicalDataError> {
    let actual = map
        .get(key)
        .ok_or_else(|| ClinicalDataError::ColumnNotFound(key.to_string()))?;
    df.column(actual)
        .map_err(|_| ClinicalDataError::ColumnNotFound(actual.clone()))
}

/// Cast a column, treating any value the cast turned into null as a type error.
fn cast_strict(
    column: &Column,
    key: &str,
    target: &DataType,
    expected_type: &'static str,
) -> Result<Column, ClinicalDataError> {
    let dtype = column.dtype().clone();
    let wrong_type = || ClinicalDataError::ColumnWrongType {
        column_name: key.to_string(),
        expected_type,
        found_type: dtype.to_string(),
    };
    let casted = column.cast(target).map_err(|_| wrong_type())?;
    if casted.null_count() > column.null_count() {
        return Err(wrong_type());
    }
    Ok(casted)
}

fn extract_optional_f64(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<Option<f64>>, ClinicalDataError> {
    let column = lookup(df, map, key)?;
    if key == SURVIVAL_TIME && column.dtype() == &DataType::String {
        // Placeholder strings such as "NA" mark a missing survival time.
        let casted = column.cast(&DataType::Float64)?;
        return Ok(casted.f64()?.into_iter().collect());
    }
    let casted = cast_strict(column, key, &DataType::Float64, "float")?;
    Ok(casted.f64()?.into_iter().collect())
}

fn extract_optional_i64(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<Option<i64>>, ClinicalDataError> {
    let column = lookup(df, map, key)?;
    let casted = cast_strict(column, key, &DataType::Int64, "integer")?;
    Ok(casted.i64()?.into_iter().collect())
}

fn extract_optional_string(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<Option<String>>, ClinicalDataError> {
    let column = lookup(df, map, key)?;
    let casted = cast_strict(column, key, &DataType::String, "string")?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    const HEADER: &str =
        "patient_id\tsite\tage\tcensoring\tsurvival_time\tbaseline_volume\ttreatment\tmethylation\n";

    fn write_tsv(body: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(".tsv").tempfile().expect("tempfile");
        file.write_all(HEADER.as_bytes()).expect("write header");
        file.write_all(body.as_bytes()).expect("write body");
        file.flush().expect("flush");
        file
    }

    #[test]
    fn loads_records_in_file_order() {
        let file = write_tsv(
            "7\tUCLA\t61\t0\t14.5\t22.1\t1\t0\n\
3\tUCSF\t48\t1\t30.0\t9.8\t0\t1\n",
        );
        let table = load_clinical_table(file.path()).expect("load clinical table");
        assert_eq!(table.len(), 2);
        assert_eq!(table.dropped_missing_survival, 0);
        assert_eq!(table.records[0].id, 7);
        assert_eq!(table.records[0].site, "UCLA");
        assert!(table.records[0].event_observed());
        assert_eq!(table.records[1].id, 3);
        assert!(table.records[1].censored);
        assert_eq!(table.records[1].methylation, 1.0);
    }

    #[test]
    fn rows_without_survival_time_are_excluded() {
        let file = write_tsv(
            "1\tA\t50\t0\t\t10.0\t1\t0\n\
2\tA\t55\t0\t12.0\t11.0\t0\t1\n",
        );
        let table = load_clinical_table(file.path()).expect("load clinical table");
        assert_eq!(table.len(), 1);
        assert_eq!(table.dropped_missing_survival, 1);
        assert_eq!(table.records[0].id, 2);
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let mut file = Builder::new().suffix(".tsv").tempfile().expect("tempfile");
        file.write_all(b"patient_id\tsite\tage\tcensoring\tsurvival_time\tbaseline_volume\ttreatment\n1\tA\t50\t0\t12\t10\t1\n")
            .expect("write");
        file.flush().expect("flush");
        match load_clinical_table(file.path()) {
            Err(ClinicalDataError::ColumnNotFound(column)) => assert_eq!(column, "methylation"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn zero_valid_records_is_fatal() {
        let file = write_tsv("1\tA\t50\t0\t\t10.0\t1\t0\n");
        assert!(matches!(
            load_clinical_table(file.path()),
            Err(ClinicalDataError::NoValidRecords)
        ));
    }

    #[test]
    fn censoring_outside_zero_one_is_rejected() {
        let file = write_tsv("4\tA\t50\t2\t12.0\t10.0\t1\t0\n");
        assert!(matches!(
            load_clinical_table(file.path()),
            Err(ClinicalDataError::InvalidCensoring { patient_id: 4, .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let file = write_tsv(
            "4\tA\t50\t0\t12.0\t10.0\t1\t0\n\
4\tB\t51\t0\t13.0\t11.0\t0\t0\n",
        );
        assert!(matches!(
            load_clinical_table(file.path()),
            Err(ClinicalDataError::DuplicatePatientId(4))
        ));
    }

    #[test]
    fn digest_tracks_row_order_and_values() {
        let rows = "7\tUCLA\t61\t0\t14.5\t22.1\t1\t0\n3\tUCSF\t48\t1\t30.0\t9.8\t0\t1\n";
        let table = load_clinical_table(write_tsv(rows).path()).expect("load clinical table");
        let digest = clinical_digest(&table.records);
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, clinical_digest(&table.records.clone()));

        let mut reversed = table.records.clone();
        reversed.reverse();
        assert_ne!(digest, clinical_digest(&reversed));

        let mut edited = table.records.clone();
        edited[1].survival_time = 31.0;
        assert_ne!(digest, clinical_digest(&edited));
    }
}
