use crate::executor::{LocationTally, RegressionOutcome, SliceStatus};
use csv::WriterBuilder;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write run report '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceRow {
    Processed(LocationTally),
    AlreadyComplete,
    Failed(String),
}

/// Per-slice account of one regression pass, in slice order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    rows: Vec<(usize, SliceRow)>,
}

impl RunReport {
    pub fn from_outcome(outcome: &RegressionOutcome) -> Self {
        let mut rows: Vec<(usize, SliceRow)> = outcome
            .summaries
            .iter()
            .map(|summary| {
                let row = match summary.status {
                    SliceStatus::AlreadyComplete => SliceRow::AlreadyComplete,
                    SliceStatus::Processed(tally) => SliceRow::Processed(tally),
                };
                (summary.z, row)
            })
            .chain(
                outcome
                    .failures
                    .iter()
                    .map(|failure| (failure.z, SliceRow::Failed(failure.error.to_string()))),
            )
            .collect();
        rows.sort_by_key(|(z, _)| *z);
        Self { rows }
    }

    pub fn rows(&self) -> &[(usize, SliceRow)] {
        &self.rows
    }

    /// Location counts summed over the slices processed in this pass.
    pub fn totals(&self) -> LocationTally {
        let mut totals = LocationTally::default();
        for (_, row) in &self.rows {
            if let SliceRow::Processed(tally) = row {
                totals.fitted += tally.fitted;
                totals.below_threshold += tally.below_threshold;
                totals.fit_failed += tally.fit_failed;
            }
        }
        totals
    }

    pub fn failed_slices(&self) -> Vec<usize> {
        self.rows
            .iter()
            .filter(|(_, row)| matches!(row, SliceRow::Failed(_)))
            .map(|(z, _)| *z)
            .collect()
    }

    pub fn write_tsv(&self, path: &Path) -> Result<(), ReportError> {
        let csv_error = |source| ReportError::Csv {
            path: path.display().to_string(),
            source,
        };
        let mut wtr = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .map_err(csv_error)?;
        wtr.write_record(["slice", "status", "fitted", "below_threshold", "fit_failed", "error"])
            .map_err(csv_error)?;
        for (z, row) in &self.rows {
            let record = match row {
                SliceRow::Processed(tally) => [
                    z.to_string(),
                    "processed".to_string(),
                    tally.fitted.to_string(),
                    tally.below_threshold.to_string(),
                    tally.fit_failed.to_string(),
                    String::new(),
                ],
                SliceRow::AlreadyComplete => [
                    z.to_string(),
                    "already_complete".to_string(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                ],
                SliceRow::Failed(message) => [
                    z.to_string(),
                    "failed".to_string(),
                    String::new(),
                    String::new(),
                    String::new(),
                    message.clone(),
                ],
            };
            wtr.write_record(&record).map_err(csv_error)?;
        }
        wtr.flush().map_err(|e| csv_error(e.into()))?;
        Ok(())
    }

    pub fn log_summary(&self) {
        let totals = self.totals();
        let resumed = self
            .rows
            .iter()
            .filter(|(_, row)| *row == SliceRow::AlreadyComplete)
            .count();
        log::info!(
            "Regression pass: {} slices, {} already complete; {} locations fitted, {} below threshold, {} fits failed",
            self.rows.len(),
            resumed,
            totals.fitted,
            totals.below_threshold,
            totals.fit_failed
        );
        let failed = self.failed_slices();
        if !failed.is_empty() {
            log::error!(
                "{} slices failed and have no results: {:?}. Rerun to retry them.",
                failed.len(),
                failed
            );
        }
    }
}
