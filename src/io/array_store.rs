//! Handles to on-disk Zarr array stores.
//!
//! Every stage output (instance map, class map, final instance segmentation) is a Zarr V3
//! directory store. An [`ArrayStore`] is a cloneable handle over shared state: clones given to a
//! stage and kept by the driver refer to the same array, so closing one closes all of them and
//! any later operation fails.

use crate::pipeline::Metrics;
use anyhow::{Context, Result};
use ndarray::Array3;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::{Array, ArrayBuilder};
use zarrs::filesystem::FilesystemStore;

/// Suffix appended to the model output prefix for the instance probability store.
pub const INSTANCE_STORE_SUFFIX: &str = "_inst.zarr";

/// Suffix appended to the model output prefix for the class probability store.
pub const CLASS_STORE_SUFFIX: &str = "_cls.zarr";

/// Name of the final instance segmentation store inside an item's output directory.
pub const FINAL_STORE_NAME: &str = "pinst_pp.zarr";

/// What a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Per-pixel instance probabilities written by inference
    Instance,
    /// Per-pixel class probabilities written by inference
    Class,
    /// Final instance segmentation written by post-processing
    Final,
}

impl StoreRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Instance => "instance",
            StoreRole::Class => "class",
            StoreRole::Final => "final",
        }
    }
}

/// Shape and chunking of a new store: (channels, height, width).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub shape: [u64; 3],
    pub chunk_shape: [u64; 3],
    pub compression_level: i32,
}

struct StoreState {
    path: PathBuf,
    role: StoreRole,
    array: Mutex<Option<Array<FilesystemStore>>>,
    metrics: Option<Arc<Metrics>>,
}

/// Shared handle to a persistent chunked array.
#[derive(Clone)]
pub struct ArrayStore {
    state: Arc<StoreState>,
}

impl ArrayStore {
    /// Create a new store at `path`, replacing nothing: the directory must not hold an array yet.
    pub fn create(
        path: &Path,
        role: StoreRole,
        layout: &StoreLayout,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create store directory {}", path.display()))?;
        let store = Arc::new(FilesystemStore::new(path)?);

        let mut builder = ArrayBuilder::new(
            layout.shape.to_vec(),
            layout.chunk_shape.to_vec(),
            "float32",
            0.0f32,
        );

        builder.dimension_names(Some(vec![
            Some("channel".to_string()),
            Some("y".to_string()),
            Some("x".to_string()),
        ]));

        builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(
            layout.compression_level,
            false,
        ))]);

        let mut attributes = serde_json::Map::new();
        attributes.insert("role".to_string(), serde_json::json!(role.as_str()));
        builder.attributes(attributes);

        let array = builder
            .build(store, "/")
            .with_context(|| format!("Failed to build {} store at {}", role.as_str(), path.display()))?;
        array.store_metadata()?;

        tracing::debug!(
            "Created {} store at {} with shape {:?}",
            role.as_str(),
            path.display(),
            layout.shape
        );

        Ok(Self::from_array(path, role, array, metrics))
    }

    /// Open an existing store.
    pub fn open(path: &Path, role: StoreRole, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} store not found at {}", role.as_str(), path.display());
        }
        let store = Arc::new(FilesystemStore::new(path)?);
        let array = Array::open(store, "/")
            .with_context(|| format!("Failed to open {} store at {}", role.as_str(), path.display()))?;

        Ok(Self::from_array(path, role, array, metrics))
    }

    fn from_array(
        path: &Path,
        role: StoreRole,
        array: Array<FilesystemStore>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        if let Some(ref m) = metrics {
            m.add_store_opened();
        }
        Self {
            state: Arc::new(StoreState {
                path: path.to_path_buf(),
                role,
                array: Mutex::new(Some(array)),
                metrics,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state.path
    }

    pub fn role(&self) -> StoreRole {
        self.state.role
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Array shape (channels, height, width).
    pub fn shape(&self) -> Result<Vec<u64>> {
        let guard = self.lock();
        let array = guard.as_ref().ok_or_else(|| self.closed_error())?;
        Ok(array.shape().to_vec())
    }

    /// Write one chunk. Partial edge chunks are padded to the full chunk shape with zeros.
    pub fn write_chunk(&self, chunk_indices: &[u64], data: Array3<f32>) -> Result<()> {
        let guard = self.lock();
        let array = guard.as_ref().ok_or_else(|| self.closed_error())?;

        let chunk_shape: Vec<usize> = array
            .chunk_shape(chunk_indices)
            .with_context(|| format!("Invalid chunk indices {:?}", chunk_indices))?
            .iter()
            .map(|d| d.get() as usize)
            .collect();
        let expected = [chunk_shape[0], chunk_shape[1], chunk_shape[2]];

        let shape = data.shape().to_vec();
        if shape.iter().zip(expected.iter()).any(|(s, e)| s > e) {
            anyhow::bail!(
                "Chunk {:?} data shape {:?} exceeds chunk shape {:?}",
                chunk_indices,
                shape,
                expected
            );
        }

        let elements: Vec<f32> = if shape[..] != expected[..] {
            let mut padded = Array3::<f32>::zeros((expected[0], expected[1], expected[2]));
            padded
                .slice_mut(ndarray::s![..shape[0], ..shape[1], ..shape[2]])
                .assign(&data);
            padded.iter().copied().collect()
        } else {
            data.iter().copied().collect()
        };

        array
            .store_chunk_elements(chunk_indices, &elements)
            .map_err(|e| anyhow::anyhow!("Failed to write chunk {:?}: {:?}", chunk_indices, e))?;
        Ok(())
    }

    /// Close the store. Returns `true` if this call closed it, `false` if it was already closed.
    pub fn close(&self) -> bool {
        let closed = self.lock().take().is_some();
        if closed {
            if let Some(ref m) = self.state.metrics {
                m.add_store_closed();
            }
            tracing::debug!("Closed {} store {}", self.role().as_str(), self.path().display());
        }
        closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Array<FilesystemStore>>> {
        // A poisoned lock still holds a valid Option; closing must keep working after a panic.
        self.state.array.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed_error(&self) -> anyhow::Error {
        anyhow::anyhow!(
            "{} store {} is closed",
            self.role().as_str(),
            self.path().display()
        )
    }
}

impl std::fmt::Debug for ArrayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStore")
            .field("path", &self.state.path)
            .field("role", &self.state.role)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for StoreState {
    fn drop(&mut self) {
        let array = self.array.get_mut().unwrap_or_else(|e| e.into_inner());
        if array.take().is_some() {
            tracing::warn!(
                "{} store {} dropped without being closed",
                self.role.as_str(),
                self.path.display()
            );
            if let Some(ref m) = self.metrics {
                m.add_store_closed();
            }
        }
    }
}

/// Delete a store from disk. A store that does not exist counts as deleted.
///
/// Returns `true` if something was removed.
pub fn delete_store(path: &Path) -> std::io::Result<bool> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
