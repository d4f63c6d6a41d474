//! Turn an input specification into an ordered list of items.
//!
//! The specification is one of:
//!
//! - a `.txt` list file with one path (or `s3://` URI) per line,
//! - an existing path, returned as-is,
//! - a glob pattern, expanded and sorted lexicographically.
//!
//! The ordering is deterministic so that repeated runs over an unchanged directory visit items in
//! the same order.

use crate::error::{PipelineError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Where an item's bytes live before staging.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemSource {
    /// Absolute path on a local (or mounted) filesystem
    Local(PathBuf),
    /// Object store URI, e.g. `s3://bucket/slides/a.svs`
    Remote(String),
}

impl ItemSource {
    /// Path view used for classification and naming (the key part for remote items).
    pub fn as_path(&self) -> &Path {
        match self {
            ItemSource::Local(p) => p,
            ItemSource::Remote(uri) => Path::new(uri.as_str()),
        }
    }

    /// Original file name, preserved by the cache stager.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            ItemSource::Local(p) => p.file_name().and_then(|n| n.to_str()),
            ItemSource::Remote(uri) => uri.rsplit('/').next().filter(|n| !n.is_empty()),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ItemSource::Remote(_))
    }
}

impl std::fmt::Display for ItemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemSource::Local(p) => write!(f, "{}", p.display()),
            ItemSource::Remote(uri) => f.write_str(uri),
        }
    }
}

/// Resolve an input specification. The result is never empty.
pub fn resolve_inputs(spec: &str) -> Result<Vec<ItemSource>> {
    let spec = spec.trim_end();
    tracing::info!("Input specified: {}", spec);

    let items = if is_list_file(spec) {
        read_list_file(Path::new(spec))?
    } else {
        expand_pattern(spec)?
    };

    tracing::info!("Found {} file(s) to process", items.len());
    Ok(items)
}

fn is_list_file(spec: &str) -> bool {
    Path::new(spec)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("txt"))
}

fn read_list_file(path: &Path) -> Result<Vec<ItemSource>> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::NotFound(path.to_path_buf()),
        _ => PipelineError::io(format!("reading input list {}", path.display()), e),
    })?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let item = if line.starts_with("s3://") {
            ItemSource::Remote(line.to_string())
        } else {
            let path = absolutize(Path::new(line))?;
            if !path.exists() {
                return Err(PipelineError::NotFound(path));
            }
            ItemSource::Local(path)
        };

        if seen.insert(item.clone()) {
            items.push(item);
        } else {
            tracing::warn!("Ignoring duplicate entry in {}: {}", path.display(), line);
        }
    }

    if items.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "Text file {} is empty or contains no valid paths",
            path.display()
        )));
    }
    Ok(items)
}

fn expand_pattern(spec: &str) -> Result<Vec<ItemSource>> {
    // A literal path is a degenerate glob; checking it first keeps names with `[` or `*` usable.
    let literal = Path::new(spec);
    if !spec.is_empty() && literal.exists() {
        return Ok(vec![ItemSource::Local(absolutize(literal)?)]);
    }

    let entries = glob::glob(spec)
        .map_err(|e| PipelineError::Configuration(format!("Invalid glob pattern '{}': {}", spec, e)))?;

    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => paths.push(absolutize(&path)?),
            Err(e) => tracing::warn!("Skipping unreadable match: {}", e),
        }
    }
    paths.sort();
    paths.dedup();

    if paths.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "No files found matching pattern: {}",
            spec
        )));
    }
    Ok(paths.into_iter().map(ItemSource::Local).collect())
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| PipelineError::io(format!("resolving {}", path.display()), e))
}
