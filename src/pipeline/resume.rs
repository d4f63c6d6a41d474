//! Resumability: an item whose final store exists has finished post-processing.

use crate::pipeline::WorkItem;
use std::path::PathBuf;

/// Terminal output marker for an item.
pub fn marker_path(item: &WorkItem) -> PathBuf {
    item.final_store_path()
}

/// Whether post-processing for `item` already completed in an earlier run.
pub fn is_complete(item: &WorkItem) -> bool {
    marker_path(item).exists()
}

/// Whether the raw stores from an earlier inference run are both present.
pub fn raw_stores_present(item: &WorkItem) -> bool {
    item.instance_store_path().exists() && item.class_store_path().exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ItemSource;
    use tempfile::TempDir;

    #[test]
    fn test_marker_drives_completion() {
        let dir = TempDir::new().unwrap();
        let item = WorkItem::new(
            0,
            &ItemSource::Local(PathBuf::from("/data/slide.svs")),
            dir.path(),
        )
        .unwrap();

        assert!(!is_complete(&item));
        std::fs::create_dir_all(marker_path(&item)).unwrap();
        assert!(is_complete(&item));
    }

    #[test]
    fn test_raw_stores_present_requires_both() {
        let dir = TempDir::new().unwrap();
        let item = WorkItem::new(
            0,
            &ItemSource::Local(PathBuf::from("/data/slide.svs")),
            dir.path(),
        )
        .unwrap();

        std::fs::create_dir_all(item.instance_store_path()).unwrap();
        assert!(!raw_stores_present(&item));
        std::fs::create_dir_all(item.class_store_path()).unwrap();
        assert!(raw_stores_present(&item));
    }
}
