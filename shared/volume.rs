//! # Volumetric I/O
//!
//! Per-patient binary masks are read through the [`MaskSource`] trait; output maps are
//! written through [`MapWriter`]. The NIfTI implementations read with the `nifti` crate
//! and write float32 NIfTI-1 volumes that reuse a reference volume's raw header, so the
//! spatial geometry (pixdim, qform, sform) is carried over byte for byte.
//!
//! Arrays are always indexed `[x, y, z]` with `z` the slice axis.

use crate::store::atomic::write_atomically;
use crate::types::GridDims;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, ArrayView3};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{NiftiObject, ReaderOptions};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Size of a NIfTI-1 header.
pub const NIFTI1_HEADER_LEN: usize = 348;
/// Header plus the four-byte extension flag.
const NIFTI1_VOX_OFFSET: usize = 352;
const DATATYPE_FLOAT32: i16 = 16;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read NIfTI volume '{path}': {message}")]
    Nifti { path: PathBuf, message: String },
    #[error("volume '{path}' has {found} dimensions; a single 3D volume is required")]
    UnsupportedDimensionality { path: PathBuf, found: usize },
    #[error("volume '{path}' has grid {found} but the run uses {expected}")]
    ShapeMismatch {
        path: PathBuf,
        expected: GridDims,
        found: GridDims,
    },
    #[error("unsupported NIfTI header in '{path}': {reason}")]
    UnsupportedHeader { path: PathBuf, reason: String },
    #[error("in-memory mask for patient {patient_id} has grid {found} but the source uses {expected}")]
    MaskShapeMismatch {
        patient_id: u32,
        expected: GridDims,
        found: GridDims,
    },
    #[error("mask filename template '{0}' must contain an '{{id}}' or '{{id:0N}}' placeholder")]
    InvalidTemplate(String),
    #[error("map '{name}' has grid {found} but the reference volume is {expected}")]
    MapShapeMismatch {
        name: String,
        expected: GridDims,
        found: GridDims,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> VolumeError + '_ {
    move |source| VolumeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Supplies one binary indicator volume per patient.
pub trait MaskSource: Sync {
    fn dims(&self) -> GridDims;

    /// `Ok(None)` means the patient has no mask on disk. That is not an error: the
    /// patient stays in the regression population with every location absent.
    fn load(&self, patient_id: u32) -> Result<Option<Array3<u8>>, VolumeError>;

    /// Where the patient's mask is expected, for log messages.
    fn location(&self, patient_id: u32) -> String {
        format!("patient {patient_id}")
    }
}

/// Receives reconstructed output maps.
pub trait MapWriter {
    fn write_map(&self, name: &str, volume: ArrayView3<'_, f64>) -> Result<(), VolumeError>;
}

/// Filename template with a numeric patient-id placeholder: `{id}` or `{id:03}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskTemplate {
    prefix: String,
    suffix: String,
    width: usize,
}

impl MaskTemplate {
    pub fn parse(template: &str) -> Result<Self, VolumeError> {
        let invalid = || VolumeError::InvalidTemplate(template.to_string());
        let start = template.find("{id").ok_or_else(invalid)?;
        let close = template[start..].find('}').ok_or_else(invalid)? + start;
        let spec = &template[start + 3..close];
        let width = if spec.is_empty() {
            0
        } else {
            let digits = spec.strip_prefix(":0").ok_or_else(invalid)?;
            digits.parse::<usize>().map_err(|_| invalid())?
        };
        let suffix = &template[close + 1..];
        if suffix.contains("{id") {
            return Err(invalid());
        }
        Ok(Self {
            prefix: template[..start].to_string(),
            suffix: suffix.to_string(),
            width,
        })
    }

    pub fn file_name(&self, patient_id: u32) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            patient_id,
            self.suffix,
            width = self.width
        )
    }
}

/// Masks stored as NIfTI files in one directory.
#[derive(Debug, Clone)]
pub struct NiftiMaskSource {
    dir: PathBuf,
    template: MaskTemplate,
    dims: GridDims,
}

impl NiftiMaskSource {
    pub fn new(dir: impl Into<PathBuf>, template: MaskTemplate, dims: GridDims) -> Self {
        Self {
            dir: dir.into(),
            template,
            dims,
        }
    }

    pub fn path_for(&self, patient_id: u32) -> PathBuf {
        self.dir.join(self.template.file_name(patient_id))
    }
}

impl MaskSource for NiftiMaskSource {
    fn dims(&self) -> GridDims {
        self.dims
    }

    fn load(&self, patient_id: u32) -> Result<Option<Array3<u8>>, VolumeError> {
        let path = self.path_for(patient_id);
        if !path.is_file() {
            return Ok(None);
        }
        let values = read_volume_f64(&path)?;
        let found = dims_of(&values);
        if found != self.dims {
            return Err(VolumeError::ShapeMismatch {
                path,
                expected: self.dims,
                found,
            });
        }
        Ok(Some(values.mapv(|v| u8::from(v > 0.5))))
    }

    fn location(&self, patient_id: u32) -> String {
        self.path_for(patient_id).display().to_string()
    }
}

/// Masks held in memory, keyed by patient id.
#[derive(Debug, Clone)]
pub struct InMemoryMasks {
    dims: GridDims,
    masks: HashMap<u32, Array3<u8>>,
}

impl InMemoryMasks {
    pub fn new(dims: GridDims) -> Self {
        Self {
            dims,
            masks: HashMap::new(),
        }
    }

    /// Insert a mask. Non-zero values count as present.
    pub fn insert(&mut self, patient_id: u32, mask: Array3<u8>) -> Result<(), VolumeError> {
        let found = dims_of(&mask);
        if found != self.dims {
            return Err(VolumeError::MaskShapeMismatch {
                patient_id,
                expected: self.dims,
                found,
            });
        }
        self.masks.insert(patient_id, mask.mapv(|v| u8::from(v != 0)));
        Ok(())
    }

    pub fn remove(&mut self, patient_id: u32) -> Option<Array3<u8>> {
        self.masks.remove(&patient_id)
    }
}

impl MaskSource for InMemoryMasks {
    fn dims(&self) -> GridDims {
        self.dims
    }

    fn load(&self, patient_id: u32) -> Result<Option<Array3<u8>>, VolumeError> {
        Ok(self.masks.get(&patient_id).cloned())
    }
}

fn dims_of<T>(volume: &Array3<T>) -> GridDims {
    let (nx, ny, nz) = volume.dim();
    GridDims::new(nx, ny, nz)
}

/// Read any scalar NIfTI volume as `f64`, indexed `[x, y, z]`.
pub fn read_volume_f64(path: &Path) -> Result<Array3<f64>, VolumeError> {
    let nifti_error = |message: String| VolumeError::Nifti {
        path: path.to_path_buf(),
        message,
    };
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_error(e.to_string()))?;
    let array = object
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| nifti_error(e.to_string()))?;

    let shape = array.shape().to_vec();
    let single_volume = shape.len() == 3 || (shape.len() == 4 && shape[3] == 1);
    if !single_volume {
        return Err(VolumeError::UnsupportedDimensionality {
            path: path.to_path_buf(),
            found: shape.len(),
        });
    }
    let mut out = Array3::<f64>::zeros((shape[0], shape[1], shape[2]));
    if shape.len() == 3 {
        for ((x, y, z), value) in out.indexed_iter_mut() {
            *value = array[&[x, y, z][..]];
        }
    } else {
        for ((x, y, z), value) in out.indexed_iter_mut() {
            *value = array[&[x, y, z, 0][..]];
        }
    }
    Ok(out)
}

fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>, VolumeError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);
    let magic = reader.fill_buf().map_err(io_error(path))?;
    let gzipped = magic.len() >= 2 && magic[0] == 0x1f && magic[1] == 0x8b;
    if gzipped {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn read_i16(header: &[u8; NIFTI1_HEADER_LEN], offset: usize) -> i16 {
    i16::from_le_bytes([header[offset], header[offset + 1]])
}

fn write_i16(header: &mut [u8; NIFTI1_HEADER_LEN], offset: usize, value: i16) {
    header[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_f32(header: &mut [u8; NIFTI1_HEADER_LEN], offset: usize, value: f32) {
    header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Spatial header of the reference volume that every output map inherits.
#[derive(Debug, Clone)]
pub struct ReferenceGeometry {
    header: [u8; NIFTI1_HEADER_LEN],
    dims: GridDims,
}

impl ReferenceGeometry {
    /// Read the raw NIfTI-1 header of `path` (`.nii` or `.nii.gz`).
    pub fn from_path(path: &Path) -> Result<Self, VolumeError> {
        let mut reader = open_maybe_gzip(path)?;
        let mut header = [0u8; NIFTI1_HEADER_LEN];
        reader.read_exact(&mut header).map_err(io_error(path))?;
        Self::from_header(header, path)
    }

    fn from_header(header: [u8; NIFTI1_HEADER_LEN], path: &Path) -> Result<Self, VolumeError> {
        let unsupported = |reason: &str| VolumeError::UnsupportedHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let sizeof_hdr = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if sizeof_hdr != NIFTI1_HEADER_LEN as i32 {
            if i32::from_be_bytes([header[0], header[1], header[2], header[3]])
                == NIFTI1_HEADER_LEN as i32
            {
                return Err(unsupported("big-endian headers are not supported"));
            }
            return Err(unsupported("not a NIfTI-1 header"));
        }
        let rank = read_i16(&header, 40);
        if !(3..=4).contains(&rank) {
            return Err(unsupported("reference must be a 3D volume"));
        }
        let extent = |axis: usize| -> Result<usize, VolumeError> {
            let value = read_i16(&header, 40 + 2 * axis);
            usize::try_from(value)
                .ok()
                .filter(|&v| v > 0)
                .ok_or_else(|| unsupported("non-positive grid extent"))
        };
        let dims = GridDims::new(extent(1)?, extent(2)?, extent(3)?);
        Ok(Self { header, dims })
    }

    /// A minimal scanner-space header for a grid with the given voxel size.
    pub fn synthetic(dims: GridDims, voxel_size: (f32, f32, f32)) -> Self {
        let mut header = [0u8; NIFTI1_HEADER_LEN];
        header[0..4].copy_from_slice(&(NIFTI1_HEADER_LEN as i32).to_le_bytes());
        let dim: [i16; 8] = [3, dims.nx as i16, dims.ny as i16, dims.nz as i16, 1, 1, 1, 1];
        for (axis, value) in dim.iter().enumerate() {
            write_i16(&mut header, 40 + axis * 2, *value);
        }
        let pixdim: [f32; 8] = [1.0, voxel_size.0, voxel_size.1, voxel_size.2, 1.0, 1.0, 1.0, 1.0];
        for (axis, value) in pixdim.iter().enumerate() {
            write_f32(&mut header, 76 + axis * 4, *value);
        }
        // sform_code = 1 with a diagonal affine.
        write_i16(&mut header, 254, 1);
        write_f32(&mut header, 280, voxel_size.0);
        write_f32(&mut header, 296 + 4, voxel_size.1);
        write_f32(&mut header, 312 + 8, voxel_size.2);
        header[344..348].copy_from_slice(b"n+1\0");
        Self { header, dims }
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    /// The reference header rewritten for a single float32 volume of the same grid.
    fn float32_header(&self) -> [u8; NIFTI1_HEADER_LEN] {
        let mut header = self.header;
        write_i16(&mut header, 40, 3);
        for axis in 4..8 {
            write_i16(&mut header, 40 + axis * 2, 1);
        }
        write_i16(&mut header, 68, 0);
        write_i16(&mut header, 70, DATATYPE_FLOAT32);
        write_i16(&mut header, 72, 32);
        write_f32(&mut header, 108, NIFTI1_VOX_OFFSET as f32);
        write_f32(&mut header, 112, 1.0);
        write_f32(&mut header, 116, 0.0);
        write_f32(&mut header, 124, 0.0);
        write_f32(&mut header, 128, 0.0);
        header[344..348].copy_from_slice(b"n+1\0");
        header
    }
}

/// Write `volume` as a float32 NIfTI-1 file with the reference geometry. Paths ending
/// in `.gz` are gzip-compressed.
pub fn write_float_volume(
    path: &Path,
    geometry: &ReferenceGeometry,
    volume: ArrayView3<'_, f64>,
) -> Result<(), VolumeError> {
    let (nx, ny, nz) = volume.dim();
    let found = GridDims::new(nx, ny, nz);
    if found != geometry.dims {
        return Err(VolumeError::ShapeMismatch {
            path: path.to_path_buf(),
            expected: geometry.dims,
            found,
        });
    }

    let gzipped = path.extension().is_some_and(|ext| ext == "gz");
    write_atomically(path, |w| encode_float_volume(w, gzipped, geometry, volume).map(|_| ()))
        .map_err(io_error(path))
}

/// Encode a float32 NIfTI-1 volume into `out`, finishing the gzip stream (trailer
/// included) before returning the inner writer.
fn encode_float_volume<W: Write>(
    out: W,
    gzipped: bool,
    geometry: &ReferenceGeometry,
    volume: ArrayView3<'_, f64>,
) -> io::Result<W> {
    if gzipped {
        let mut encoder = GzEncoder::new(out, Compression::default());
        write_volume_body(&mut encoder, geometry, volume)?;
        encoder.finish()
    } else {
        let mut out = out;
        write_volume_body(&mut out, geometry, volume)?;
        Ok(out)
    }
}

fn write_volume_body<W: Write>(
    writer: &mut W,
    geometry: &ReferenceGeometry,
    volume: ArrayView3<'_, f64>,
) -> io::Result<()> {
    let (nx, ny, nz) = volume.dim();
    writer.write_all(&geometry.float32_header())?;
    writer.write_all(&[0u8; NIFTI1_VOX_OFFSET - NIFTI1_HEADER_LEN])?;
    // NIfTI stores x fastest.
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                writer.write_all(&(volume[[x, y, z]] as f32).to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Writes maps as `<dir>/<name>.nii.gz` with a shared reference geometry.
#[derive(Debug, Clone)]
pub struct NiftiMapWriter {
    dir: PathBuf,
    geometry: ReferenceGeometry,
}

impl NiftiMapWriter {
    pub fn new(dir: impl Into<PathBuf>, geometry: ReferenceGeometry) -> Self {
        Self {
            dir: dir.into(),
            geometry,
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.nii.gz"))
    }
}

impl MapWriter for NiftiMapWriter {
    fn write_map(&self, name: &str, volume: ArrayView3<'_, f64>) -> Result<(), VolumeError> {
        let path = self.path_for(name);
        std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        write_float_volume(&path, &self.geometry, volume)?;
        log::info!("Wrote map '{}' to {}", name, path.display());
        Ok(())
    }
}

/// Collects maps in memory.
#[derive(Debug)]
pub struct MemoryMapWriter {
    dims: GridDims,
    maps: Mutex<HashMap<String, Array3<f64>>>,
}

impl MemoryMapWriter {
    pub fn new(dims: GridDims) -> Self {
        Self {
            dims,
            maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn take(&self, name: &str) -> Option<Array3<f64>> {
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl MapWriter for MemoryMapWriter {
    fn write_map(&self, name: &str, volume: ArrayView3<'_, f64>) -> Result<(), VolumeError> {
        let (nx, ny, nz) = volume.dim();
        let found = GridDims::new(nx, ny, nz);
        if found != self.dims {
            return Err(VolumeError::MapShapeMismatch {
                name: name.to_string(),
                expected: self.dims,
                found,
            });
        }
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), volume.to_owned());
        Ok(())
    }
}
