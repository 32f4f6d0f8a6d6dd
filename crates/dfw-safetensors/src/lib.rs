//! CPU safetensors load/save for dfw tensors.
//!
//! Tensors are written as F64. Reading accepts F64, F32, F16 and BF16 and
//! widens everything to `f64`. Optional string metadata rides in the file
//! header.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use dfw_tensor::{Shape, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

/// Errors from safetensors operations.
#[derive(Debug, thiserror::Error)]
pub enum SafetensorsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[source] safetensors::SafeTensorError),
    #[error("serialize error: {0}")]
    Serialize(#[source] safetensors::SafeTensorError),
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),
}

impl SafetensorsError {
    /// True when the underlying failure is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, SafetensorsError>;

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| SafetensorsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every tensor in a safetensors file.
pub fn load(path: &Path) -> Result<BTreeMap<String, Tensor>> {
    let data = read_file(path)?;
    let tensors = SafeTensors::deserialize(&data).map_err(SafetensorsError::Parse)?;

    let mut result = BTreeMap::new();
    for (name, view) in tensors.tensors() {
        let values = decode(view.dtype(), view.data())?;
        result.insert(name, Tensor::new(values, Shape::from_slice(view.shape())));
    }
    Ok(result)
}

/// Header metadata of a safetensors file; empty when there is none.
pub fn read_metadata(path: &Path) -> Result<BTreeMap<String, String>> {
    let data = read_file(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&data).map_err(SafetensorsError::Parse)?;
    Ok(metadata
        .metadata()
        .as_ref()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default())
}

/// Save tensors to a safetensors file as F64.
pub fn save(tensors: &BTreeMap<String, Tensor>, path: &Path) -> Result<()> {
    save_with_metadata(tensors, &BTreeMap::new(), path)
}

/// Save tensors with string metadata in the header.
pub fn save_with_metadata(
    tensors: &BTreeMap<String, Tensor>,
    metadata: &BTreeMap<String, String>,
    path: &Path,
) -> Result<()> {
    let serialized = serialize(tensors, metadata)?;
    std::fs::write(path, serialized).map_err(|source| SafetensorsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize tensors to safetensors bytes.
pub fn serialize(
    tensors: &BTreeMap<String, Tensor>,
    metadata: &BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    // Owned little-endian buffers that the views borrow from.
    let encoded: Vec<(&str, Vec<u8>, Vec<usize>)> = tensors
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.as_str(), bytes, tensor.dims().to_vec())
        })
        .collect();

    let mut views = Vec::with_capacity(encoded.len());
    for (name, bytes, shape) in &encoded {
        let view = TensorView::new(Dtype::F64, shape.clone(), bytes)
            .map_err(SafetensorsError::Serialize)?;
        views.push((*name, view));
    }

    let metadata: Option<HashMap<String, String>> = if metadata.is_empty() {
        None
    } else {
        Some(metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    };
    safetensors::tensor::serialize(views, &metadata).map_err(SafetensorsError::Serialize)
}

fn decode(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f64>> {
    let values = match dtype {
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])) as f64)
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16_to_f32(u16::from_le_bytes([c[0], c[1]])) as f64)
            .collect(),
        other => return Err(SafetensorsError::UnsupportedDtype(format!("{other:?}"))),
    };
    Ok(values)
}

/// IEEE 754 half precision to f32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 1) as u32;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let frac = (bits & 0x3ff) as u32;

    let out = match (exp, frac) {
        (0, 0) => sign << 31,
        (0, _) => {
            // subnormal: renormalise
            let mut e = 127 - 15 + 1;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            (sign << 31) | ((e as u32) << 23) | ((f & 0x3ff) << 13)
        }
        (0x1f, 0) => (sign << 31) | 0x7f80_0000,
        (0x1f, _) => (sign << 31) | 0x7fc0_0000,
        _ => (sign << 31) | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(out)
}

/// bfloat16 is the top half of an f32.
fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}
