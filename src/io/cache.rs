//! Stage items on fast local storage before processing.
//!
//! Copies go through a temporary file in the cache directory that is renamed into place only
//! once complete, so a failed or interrupted copy never leaves a truncated file under the
//! item's name.

use crate::config::InputConfig;
use crate::error::{PipelineError, Result};
use crate::input::ItemSource;
use crate::io::store::{create_input_store, parse_s3_uri};
use crate::pipeline::Metrics;
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Result of staging one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedItem {
    /// Path the rest of the item's pipeline reads from
    pub path: PathBuf,
    /// `true` if `path` is a cache copy distinct from the source
    pub is_cache_copy: bool,
}

/// Copy an item into `cache_dir`, keeping its file name.
pub async fn stage_item(
    source: &ItemSource,
    cache_dir: &Path,
    input: &InputConfig,
    metrics: &Metrics,
) -> Result<StagedItem> {
    let cache_dir = std::path::absolute(cache_dir)
        .map_err(|e| PipelineError::io(format!("resolving {}", cache_dir.display()), e))?;
    std::fs::create_dir_all(&cache_dir)
        .map_err(|e| PipelineError::io(format!("creating cache directory {}", cache_dir.display()), e))?;

    let (staged, bytes) = match source {
        ItemSource::Local(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || copy_local(&path, &cache_dir))
                .await
                .map_err(|e| PipelineError::Other(anyhow::anyhow!("Cache copy task failed: {}", e)))??
        }
        ItemSource::Remote(uri) => download_remote(uri, &cache_dir, input).await?,
    };

    metrics.add_bytes_cached(bytes);
    Ok(staged)
}

/// Remove a cache copy once its item is finished. Sources used in place are never touched.
pub fn evict(staged: &StagedItem) {
    if !staged.is_cache_copy {
        return;
    }
    match std::fs::remove_file(&staged.path) {
        Ok(()) => tracing::debug!("Evicted cached copy {}", staged.path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to evict cached copy {}: {}", staged.path.display(), e),
    }
}

fn cache_target(name: Option<&str>, source: &str, cache_dir: &Path) -> Result<PathBuf> {
    let name = name.ok_or_else(|| {
        PipelineError::Configuration(format!("Input {} has no file name to cache under", source))
    })?;
    Ok(cache_dir.join(name))
}

fn copy_local(src: &Path, cache_dir: &Path) -> Result<(StagedItem, u64)> {
    let dest = cache_target(
        src.file_name().and_then(|n| n.to_str()),
        &src.display().to_string(),
        cache_dir,
    )?;

    if dest == src {
        tracing::debug!("{} already lives in the cache directory", src.display());
        return Ok((
            StagedItem {
                path: dest,
                is_cache_copy: false,
            },
            0,
        ));
    }

    let src_meta = std::fs::metadata(src).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::NotFound(src.to_path_buf()),
        _ => PipelineError::io(format!("reading {}", src.display()), e),
    })?;
    if src_meta.is_dir() {
        return Err(PipelineError::Configuration(format!(
            "Cannot cache directory input {}",
            src.display()
        )));
    }

    if is_fresh_copy(&src_meta, &dest) {
        tracing::info!("Reusing cached copy {}", dest.display());
        return Ok((
            StagedItem {
                path: dest,
                is_cache_copy: true,
            },
            0,
        ));
    }

    let io_err = |e: std::io::Error| {
        PipelineError::io(format!("caching {} to {}", src.display(), dest.display()), e)
    };

    let mut tmp = NamedTempFile::new_in(cache_dir).map_err(io_err)?;
    let mut reader = std::fs::File::open(src).map_err(io_err)?;
    let bytes = std::io::copy(&mut reader, tmp.as_file_mut()).map_err(io_err)?;
    // The copy carries the source mtime so a later run can recognize it
    let modified = src_meta.modified().map_err(io_err)?;
    tmp.as_file().set_modified(modified).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(&dest).map_err(|e| io_err(e.error))?;

    Ok((
        StagedItem {
            path: dest,
            is_cache_copy: true,
        },
        bytes,
    ))
}

/// A cached file is only reused if it is a copy of this exact source version: same length and
/// same modification time. Equal length alone says nothing about the content.
fn is_fresh_copy(src_meta: &std::fs::Metadata, dest: &Path) -> bool {
    let Ok(existing) = std::fs::metadata(dest) else {
        return false;
    };
    if !existing.is_file() || existing.len() != src_meta.len() {
        return false;
    }
    match (existing.modified(), src_meta.modified()) {
        (Ok(cached), Ok(source)) => cached == source,
        _ => false,
    }
}

async fn download_remote(
    uri: &str,
    cache_dir: &Path,
    input: &InputConfig,
) -> Result<(StagedItem, u64)> {
    let (bucket, key) = parse_s3_uri(uri).map_err(PipelineError::config)?;
    let dest = cache_target(key.rsplit('/').next().filter(|n| !n.is_empty()), uri, cache_dir)?;
    let store = create_input_store(bucket, input)?;

    let io_err = |e: std::io::Error| {
        PipelineError::io(format!("downloading {} to {}", uri, dest.display()), e)
    };

    let mut tmp = NamedTempFile::new_in(cache_dir).map_err(io_err)?;

    let location = object_store::path::Path::from(key);
    let result = store.get(&location).await.map_err(|e| match e {
        object_store::Error::NotFound { .. } => PipelineError::NotFound(PathBuf::from(uri)),
        e => io_err(std::io::Error::other(e)),
    })?;

    let mut stream = result.into_stream();
    let mut bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| io_err(std::io::Error::other(e)))?;
        tmp.write_all(&chunk).map_err(io_err)?;
        bytes += chunk.len() as u64;
    }

    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(&dest).map_err(|e| io_err(e.error))?;

    tracing::debug!("Downloaded {} ({} bytes)", uri, bytes);
    Ok((
        StagedItem {
            path: dest,
            is_cache_copy: true,
        },
        bytes,
    ))
}
