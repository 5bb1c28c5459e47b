//! Tensor I/O: safetensors checkpoint loading and saving.
//!
//! Checkpoints are flat name-to-tensor maps, matching the dotted names
//! produced by `named_parameters`. Bytes are little-endian on disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::debug;

use tangram_core::{DType, Engine, Result, Shape, TangramError, Tensor};

/// Save named tensors to a safetensors file.
pub fn save(path: &Path, tensors: &[(String, Tensor)]) -> Result<()> {
    let mut buffers: Vec<(String, Vec<u8>, safetensors::Dtype, Vec<usize>)> =
        Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let shape: Vec<usize> = tensor.shape().0.iter().map(|&d| d as usize).collect();
        buffers.push((
            name.clone(),
            to_le_bytes(tensor)?,
            map_dtype_out(tensor.dtype()),
            shape,
        ));
    }

    let views: Vec<(&str, TensorView<'_>)> = buffers
        .iter()
        .map(|(name, bytes, dtype, shape)| {
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| {
                    TangramError::InvalidArgument(format!("safetensors view error: {e}"))
                })
        })
        .collect::<Result<_>>()?;

    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| TangramError::InvalidArgument(format!("safetensors save error: {e}")))?;
    debug!(path = %path.display(), count = tensors.len(), "saved checkpoint");
    Ok(())
}

/// Load every tensor from a safetensors file into the engine's arena.
pub fn load(engine: &Arc<Engine>, path: &Path) -> Result<HashMap<String, Tensor>> {
    let data = fs::read(path)?;
    let st = SafeTensors::deserialize(&data)
        .map_err(|e| TangramError::InvalidArgument(format!("safetensors parse error: {e}")))?;
    deserialize_tensors(engine, &st)
}

/// Load using memory-mapped I/O; useful for large weight files.
pub fn load_mmap(engine: &Arc<Engine>, path: &Path) -> Result<HashMap<String, Tensor>> {
    let file = fs::File::open(path)?;
    // SAFETY: The file must not be modified while the mmap is alive.
    // This is the standard usage pattern for read-only weight files.
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)
        .map_err(|e| TangramError::InvalidArgument(format!("safetensors parse error: {e}")))?;
    deserialize_tensors(engine, &st)
}

/// Load a checkpoint into existing tensors, matched by name. Every
/// destination must be present in the file with the same shape and dtype;
/// storage is overwritten in place so live handles stay valid.
pub fn load_into(path: &Path, tensors: &[(String, Tensor)]) -> Result<()> {
    if tensors.is_empty() {
        return Ok(());
    }
    let engine = tensors[0].1.engine().clone();
    let loaded = load(&engine, path)?;
    let result = copy_entries(&loaded, tensors);
    // The loaded tensors are scratch whether the copy succeeded or not.
    for tensor in loaded.values() {
        let _ = engine.dispose(tensor);
    }
    result
}

fn copy_entries(loaded: &HashMap<String, Tensor>, tensors: &[(String, Tensor)]) -> Result<()> {
    for (name, dst) in tensors {
        let src = loaded.get(name).ok_or_else(|| {
            TangramError::InvalidArgument(format!("checkpoint has no tensor named {name:?}"))
        })?;
        dst.copy_from(src)?;
    }
    Ok(())
}

fn deserialize_tensors(engine: &Arc<Engine>, st: &SafeTensors<'_>) -> Result<HashMap<String, Tensor>> {
    let mut result = HashMap::new();
    for (name, view) in st.tensors() {
        let shape = Shape::new(view.shape().iter().map(|&d| d as i64).collect::<Vec<_>>());
        let tensor = from_le_bytes(engine, view.dtype(), view.data(), &shape)?;
        result.insert(name, tensor);
    }
    Ok(result)
}

fn from_le_bytes(
    engine: &Arc<Engine>,
    dtype: safetensors::Dtype,
    data: &[u8],
    shape: &Shape,
) -> Result<Tensor> {
    match dtype {
        safetensors::Dtype::F32 => {
            let values: Vec<f32> = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            engine.tensor(&values, &shape.0)
        }
        safetensors::Dtype::I32 => {
            let values: Vec<i32> = data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            engine.tensor_i32(&values, &shape.0)
        }
        safetensors::Dtype::I8 => engine.tensor_bytes(data, &shape.0, DType::I8),
        safetensors::Dtype::U8 => engine.tensor_bytes(data, &shape.0, DType::U8),
        other => Err(TangramError::InvalidArgument(format!(
            "unsupported safetensors dtype: {other:?}"
        ))),
    }
}

fn to_le_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    match tensor.dtype() {
        DType::F32 => Ok(tensor
            .to_vec_f32()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()),
        DType::I32 => Ok(tensor
            .to_vec_i32()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()),
        DType::I8 | DType::U8 => tensor.to_bytes(),
    }
}

fn map_dtype_out(dtype: DType) -> safetensors::Dtype {
    match dtype {
        DType::F32 => safetensors::Dtype::F32,
        DType::I32 => safetensors::Dtype::I32,
        DType::I8 => safetensors::Dtype::I8,
        DType::U8 => safetensors::Dtype::U8,
    }
}
