//! # Slice store files
//!
//! One file per z-index holds every patient's indicator values for that slice:
//!
//! ```text
//! magic "VXSLICE1" | version u32 | nx u32 | ny u32 | patients u32   (little endian)
//! status[patients]                       one byte per patient column
//! data[nx * ny * patients]               location-major: (x * ny + y) * patients + p
//! ```
//!
//! A patient's column is written in place through a writable memory map. If that fails
//! the file is reloaded, patched in memory and replaced atomically. Status bytes only
//! move forward (see [`ColumnState`]), so repeating a build never changes a file.

use super::atomic::write_atomically;
use super::gauge::{GaugeGuard, ResidentGauge};
use crate::types::GridDims;
use memmap2::MmapMut;
use ndarray::ArrayView2;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SLICE_MAGIC: &[u8; 8] = b"VXSLICE1";
pub const SLICE_FORMAT_VERSION: u32 = 1;
pub const SLICE_HEADER_LEN: usize = 24;
const LOCK_FILE_NAME: &str = ".build.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("slice store '{path}' is malformed: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error(
        "slice store '{path}' was built for a {found_nx}x{found_ny} slice with {found_patients} patients, but this run has {nx}x{ny} with {patients}. Rebuild the stores."
    )]
    DimensionMismatch {
        path: PathBuf,
        nx: usize,
        ny: usize,
        patients: usize,
        found_nx: usize,
        found_ny: usize,
        found_patients: usize,
    },

    #[error("patient column {patient} is out of range for a store with {patients} patients")]
    PatientOutOfRange { patient: usize, patients: usize },

    #[error("mask slice has shape {found:?}, expected {expected:?}")]
    ColumnShape {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "another build holds the slice store lock '{0}'. If no build is running, remove the file and retry."
    )]
    LockHeld(PathBuf),

    #[error("slice {slice}: in-place update failed and the full rewrite also failed: {source}")]
    UnrecoverableWrite {
        slice: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("slice store for z={slice} does not exist")]
    SliceMissing { slice: usize },

    #[error("slice store for z={slice} has {unwritten} patient columns that were never built")]
    IncompleteSlice { slice: usize, unwritten: usize },
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lifecycle of one patient's column within a slice file.
///
/// Allowed transitions are `Unwritten -> Written`, `Unwritten -> Absent` and
/// `Absent -> Written`. A `Written` column is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnState {
    Unwritten = 0,
    /// Filled from the patient's mask.
    Written = 1,
    /// The mask was missing; the column holds zeros (pathology absent everywhere).
    Absent = 2,
}

impl ColumnState {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unwritten),
            1 => Some(Self::Written),
            2 => Some(Self::Absent),
            _ => None,
        }
    }

    fn accepts(self, target: ColumnState) -> bool {
        matches!(
            (self, target),
            (Self::Unwritten, Self::Written | Self::Absent) | (Self::Absent, Self::Written)
        )
    }
}

/// How a column write reached the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    /// The column already held its final state.
    Unchanged,
    InPlace,
    /// The in-place update failed and the file was rewritten.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnWrite {
    pub created: bool,
    pub path: WritePath,
}

/// Byte layout shared by every slice file of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SliceLayout {
    nx: usize,
    ny: usize,
    patients: usize,
}

impl SliceLayout {
    fn locations(&self) -> usize {
        self.nx * self.ny
    }

    fn data_offset(&self) -> usize {
        SLICE_HEADER_LEN + self.patients
    }

    fn file_len(&self) -> usize {
        self.data_offset() + self.locations() * self.patients
    }

    fn encode_header(&self) -> [u8; SLICE_HEADER_LEN] {
        let mut header = [0u8; SLICE_HEADER_LEN];
        header[0..8].copy_from_slice(SLICE_MAGIC);
        header[8..12].copy_from_slice(&SLICE_FORMAT_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&(self.nx as u32).to_le_bytes());
        header[16..20].copy_from_slice(&(self.ny as u32).to_le_bytes());
        header[20..24].copy_from_slice(&(self.patients as u32).to_le_bytes());
        header
    }

    /// Validate a whole file image against this layout.
    fn check(&self, bytes: &[u8], path: &Path) -> Result<(), StoreError> {
        let bad = |reason: String| StoreError::BadHeader {
            path: path.to_path_buf(),
            reason,
        };
        if bytes.len() < SLICE_HEADER_LEN {
            return Err(bad(format!("file is only {} bytes long", bytes.len())));
        }
        if &bytes[0..8] != SLICE_MAGIC {
            return Err(bad("wrong magic bytes".to_string()));
        }
        let field = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]) as usize
        };
        let version = field(8) as u32;
        if version != SLICE_FORMAT_VERSION {
            return Err(bad(format!("unsupported format version {version}")));
        }
        let found = SliceLayout {
            nx: field(12),
            ny: field(16),
            patients: field(20),
        };
        if found != *self {
            return Err(StoreError::DimensionMismatch {
                path: path.to_path_buf(),
                nx: self.nx,
                ny: self.ny,
                patients: self.patients,
                found_nx: found.nx,
                found_ny: found.ny,
                found_patients: found.patients,
            });
        }
        if bytes.len() != self.file_len() {
            return Err(bad(format!(
                "expected {} bytes, found {}",
                self.file_len(),
                bytes.len()
            )));
        }
        Ok(())
    }

    fn state_at(&self, bytes: &[u8], patient: usize, path: &Path) -> Result<ColumnState, StoreError> {
        let byte = bytes[SLICE_HEADER_LEN + patient];
        ColumnState::from_byte(byte).ok_or_else(|| StoreError::BadHeader {
            path: path.to_path_buf(),
            reason: format!("invalid status byte {byte} for patient column {patient}"),
        })
    }

    /// Apply one column update to a validated file image. Returns whether anything changed.
    fn apply(
        &self,
        bytes: &mut [u8],
        patient: usize,
        column: Option<&ArrayView2<'_, u8>>,
        path: &Path,
    ) -> Result<bool, StoreError> {
        let target = if column.is_some() {
            ColumnState::Written
        } else {
            ColumnState::Absent
        };
        if !self.state_at(bytes, patient, path)?.accepts(target) {
            return Ok(false);
        }
        let data = self.data_offset();
        for x in 0..self.nx {
            for y in 0..self.ny {
                let value = column.map_or(0, |c| u8::from(c[[x, y]] != 0));
                bytes[data + (x * self.ny + y) * self.patients + patient] = value;
            }
        }
        bytes[SLICE_HEADER_LEN + patient] = target as u8;
        Ok(true)
    }
}

/// Directory of slice files for one grid and one patient population.
#[derive(Debug, Clone)]
pub struct SliceStore {
    dir: PathBuf,
    dims: GridDims,
    layout: SliceLayout,
}

impl SliceStore {
    pub fn new(dir: impl Into<PathBuf>, dims: GridDims, patients: usize) -> Self {
        Self {
            dir: dir.into(),
            dims,
            layout: SliceLayout {
                nx: dims.nx,
                ny: dims.ny,
                patients,
            },
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn patients(&self) -> usize {
        self.layout.patients
    }

    /// Bytes of indicator data in one slice.
    pub fn slice_data_len(&self) -> usize {
        self.layout.locations() * self.layout.patients
    }

    pub fn slice_path(&self, z: usize) -> PathBuf {
        self.dir.join(format!("slice_{z:04}.vxs"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    pub fn exists(&self, z: usize) -> bool {
        self.slice_path(z).is_file()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_path().exists()
    }

    /// Create slice `z` with every column unwritten.
    fn create(&self, z: usize) -> Result<(), StoreError> {
        let path = self.slice_path(z);
        let header = self.layout.encode_header();
        let body_len = self.layout.file_len() - SLICE_HEADER_LEN;
        write_atomically(&path, |w| {
            w.write_all(&header)?;
            io::copy(&mut io::repeat(0).take(body_len as u64), w)?;
            Ok(())
        })
        .map_err(io_error(&path))
    }

    fn check_column(&self, patient: usize, column: Option<&ArrayView2<'_, u8>>) -> Result<(), StoreError> {
        if patient >= self.layout.patients {
            return Err(StoreError::PatientOutOfRange {
                patient,
                patients: self.layout.patients,
            });
        }
        if let Some(column) = column {
            let expected = (self.layout.nx, self.layout.ny);
            if column.dim() != expected {
                return Err(StoreError::ColumnShape {
                    expected,
                    found: column.dim(),
                });
            }
        }
        Ok(())
    }

    /// Write one patient's indicator values for slice `z`. `None` records a missing mask.
    pub fn write_column(
        &self,
        z: usize,
        patient: usize,
        column: Option<ArrayView2<'_, u8>>,
    ) -> Result<ColumnWrite, StoreError> {
        self.write_column_via(z, patient, column, Self::write_in_place)
    }

    /// `write_column` with the in-place update supplied by the caller. A header or
    /// dimension error is final; any other in-place failure falls back to a rewrite.
    fn write_column_via<'v, F>(
        &self,
        z: usize,
        patient: usize,
        column: Option<ArrayView2<'v, u8>>,
        in_place: F,
    ) -> Result<ColumnWrite, StoreError>
    where
        F: FnOnce(&Self, usize, usize, Option<&ArrayView2<'v, u8>>) -> Result<bool, StoreError>,
    {
        self.check_column(patient, column.as_ref())?;
        let created = !self.exists(z);
        if created {
            self.create(z)?;
        }
        let path = match in_place(self, z, patient, column.as_ref()) {
            Ok(true) => WritePath::InPlace,
            Ok(false) => WritePath::Unchanged,
            Err(err @ (StoreError::BadHeader { .. } | StoreError::DimensionMismatch { .. })) => {
                return Err(err);
            }
            Err(err) => {
                log::warn!(
                    "In-place update of slice {z} failed ({err}); rewriting the whole slice file"
                );
                match self.rewrite_column(z, patient, column.as_ref()) {
                    Ok(_) => WritePath::Fallback,
                    Err(source) => {
                        return Err(StoreError::UnrecoverableWrite {
                            slice: z,
                            source: Box::new(source),
                        });
                    }
                }
            }
        };
        Ok(ColumnWrite { created, path })
    }

    fn write_in_place(
        &self,
        z: usize,
        patient: usize,
        column: Option<&ArrayView2<'_, u8>>,
    ) -> Result<bool, StoreError> {
        let path = self.slice_path(z);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(io_error(&path))?;
        self.layout.check(&map, &path)?;
        let changed = self.layout.apply(&mut map, patient, column, &path)?;
        if changed {
            map.flush().map_err(io_error(&path))?;
        }
        Ok(changed)
    }

    /// Reload the whole slice, patch it in memory and replace the file.
    pub(crate) fn rewrite_column(
        &self,
        z: usize,
        patient: usize,
        column: Option<&ArrayView2<'_, u8>>,
    ) -> Result<bool, StoreError> {
        let path = self.slice_path(z);
        let mut bytes = fs::read(&path).map_err(io_error(&path))?;
        self.layout.check(&bytes, &path)?;
        let changed = self.layout.apply(&mut bytes, patient, column, &path)?;
        if changed {
            write_atomically(&path, |w| w.write_all(&bytes)).map_err(io_error(&path))?;
        }
        Ok(changed)
    }

    pub fn column_states(&self, z: usize) -> Result<Vec<ColumnState>, StoreError> {
        let path = self.slice_path(z);
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        self.layout.check(&bytes, &path)?;
        (0..self.layout.patients)
            .map(|p| self.layout.state_at(&bytes, p, &path))
            .collect()
    }

    /// Load slice `z` for regression. Every patient column must have been built.
    pub fn load<'g>(&self, z: usize, gauge: &'g ResidentGauge) -> Result<LoadedSlice<'g>, StoreError> {
        let path = self.slice_path(z);
        if !path.is_file() {
            return Err(StoreError::SliceMissing { slice: z });
        }
        let guard = gauge.acquire(self.layout.file_len());
        let mut bytes = fs::read(&path).map_err(io_error(&path))?;
        self.layout.check(&bytes, &path)?;
        let mut unwritten = 0;
        for p in 0..self.layout.patients {
            if self.layout.state_at(&bytes, p, &path)? == ColumnState::Unwritten {
                unwritten += 1;
            }
        }
        if unwritten > 0 {
            return Err(StoreError::IncompleteSlice { slice: z, unwritten });
        }
        bytes.drain(..self.layout.data_offset());
        Ok(LoadedSlice {
            z,
            ny: self.layout.ny,
            patients: self.layout.patients,
            data: bytes,
            _guard: guard,
        })
    }

    /// Remove every slice file. The caller must hold the build lock.
    pub fn purge(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error(&self.dir))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "vxs") {
                fs::remove_file(&path).map_err(io_error(&path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One slice's indicator data, resident in memory.
#[derive(Debug)]
pub struct LoadedSlice<'g> {
    z: usize,
    ny: usize,
    patients: usize,
    data: Vec<u8>,
    _guard: GaugeGuard<'g>,
}

impl LoadedSlice<'_> {
    pub fn z(&self) -> usize {
        self.z
    }

    /// Indicator values of all patients at `(x, y)`, in patient order.
    pub fn indicator(&self, x: usize, y: usize) -> &[u8] {
        let start = (x * self.ny + y) * self.patients;
        &self.data[start..start + self.patients]
    }

    pub fn count(&self, x: usize, y: usize) -> usize {
        self.indicator(x, y).iter().filter(|&&v| v != 0).count()
    }
}

/// Exclusive lock over a slice store directory, held for a whole build pass.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(store: &SliceStore) -> Result<Self, StoreError> {
        fs::create_dir_all(store.dir()).map_err(io_error(store.dir()))?;
        let path = store.lock_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    log::warn!("Could not record the owner in build lock '{}': {e}", path.display());
                }
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::LockHeld(path)),
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Could not remove build lock '{}': {e}", self.path.display());
        }
    }
}
