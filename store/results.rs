//! Per-slice result files.
//!
//! `results/<kind>/slice_<zzzz>.vxr` holds one slice's values for one output kind:
//! magic `VXRSULT1`, then `nx`, `ny`, `channels` as little-endian u32, then f64 LE values
//! laid out `(x * ny + y) * channels + c`. Files are replaced atomically, and the `counts`
//! file is written last, so its presence marks a finished slice.

use super::atomic::write_atomically;
use crate::types::{CovariateLayout, GridDims, OutputKind};
use ndarray::{Array3, ArrayView3};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RESULT_MAGIC: &[u8; 8] = b"VXRSULT1";
const RESULT_HEADER_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum ResultFileError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("result file '{path}' is malformed: {reason}")]
    BadHeader { path: PathBuf, reason: String },
    #[error("result file '{path}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ResultFileError + '_ {
    move |source| ResultFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
    dims: GridDims,
    layout: CovariateLayout,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>, dims: GridDims, layout: CovariateLayout) -> Self {
        Self {
            dir: dir.into(),
            dims,
            layout,
        }
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn layout(&self) -> &CovariateLayout {
        &self.layout
    }

    pub fn path(&self, kind: OutputKind, z: usize) -> PathBuf {
        self.dir.join(kind.dir_name()).join(format!("slice_{z:04}.vxr"))
    }

    fn expected_shape(&self, kind: OutputKind) -> (usize, usize, usize) {
        (self.dims.nx, self.dims.ny, kind.channels(&self.layout))
    }

    pub fn write(
        &self,
        kind: OutputKind,
        z: usize,
        values: ArrayView3<'_, f64>,
    ) -> Result<(), ResultFileError> {
        let path = self.path(kind, z);
        let expected = self.expected_shape(kind);
        if values.dim() != expected {
            return Err(ResultFileError::ShapeMismatch {
                path,
                expected,
                found: values.dim(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let (nx, ny, channels) = expected;
        write_atomically(&path, |w| {
            w.write_all(RESULT_MAGIC)?;
            for field in [nx, ny, channels] {
                w.write_all(&(field as u32).to_le_bytes())?;
            }
            // Logical iteration order is x, then y, then channel.
            for value in values.iter() {
                w.write_all(&value.to_le_bytes())?;
            }
            Ok(())
        })
        .map_err(io_error(&path))
    }

    pub fn read(&self, kind: OutputKind, z: usize) -> Result<Array3<f64>, ResultFileError> {
        let path = self.path(kind, z);
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        let bad = |reason: String| ResultFileError::BadHeader {
            path: path.clone(),
            reason,
        };
        if bytes.len() < RESULT_HEADER_LEN || &bytes[0..8] != RESULT_MAGIC {
            return Err(bad("missing result header".to_string()));
        }
        let field = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]) as usize
        };
        let found = (field(8), field(12), field(16));
        let expected = self.expected_shape(kind);
        if found != expected {
            return Err(ResultFileError::ShapeMismatch {
                path,
                expected,
                found,
            });
        }
        let body = &bytes[RESULT_HEADER_LEN..];
        let count = expected.0 * expected.1 * expected.2;
        if body.len() != count * 8 {
            return Err(bad(format!(
                "expected {} value bytes, found {}",
                count * 8,
                body.len()
            )));
        }
        let values: Vec<f64> = body
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        Array3::from_shape_vec(expected, values).map_err(|e| bad(e.to_string()))
    }

    /// A slice is complete once its counts file exists.
    pub fn is_complete(&self, z: usize) -> bool {
        self.path(OutputKind::Counts, z).is_file()
    }

    /// Slices whose result set is incomplete, in ascending order.
    pub fn missing_slices(&self) -> Vec<usize> {
        (0..self.dims.nz).filter(|&z| !self.is_complete(z)).collect()
    }

    /// Remove every result file of every kind.
    pub fn purge(&self) -> Result<(), ResultFileError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.dir)(e)),
        }
    }
}
