//! Extension-based processing mode for a single item.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Decoding strategy used by the stages for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemMode {
    /// Numpy array (`.npy`)
    RawArray,
    /// Image readable by a regular image decoder
    StandardImage,
    /// Whole-slide image; the slide backend also covers any other format
    WholeSlide,
}

const RAW_ARRAY_EXTENSIONS: &[&str] = &["npy"];
const STANDARD_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

impl ItemMode {
    /// Classify by file extension. Never fails: unknown extensions are whole-slide images.
    pub fn classify(path: &Path) -> Self {
        let ext = extension_of(path).to_ascii_lowercase();

        if RAW_ARRAY_EXTENSIONS.contains(&ext.as_str()) {
            ItemMode::RawArray
        } else if STANDARD_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            ItemMode::StandardImage
        } else {
            ItemMode::WholeSlide
        }
    }

    /// Short name used in logs and worker requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemMode::RawArray => "npy",
            ItemMode::StandardImage => "img",
            ItemMode::WholeSlide => "wsi",
        }
    }
}

impl std::fmt::Display for ItemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File extension without the leading dot, empty if there is none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(ItemMode::classify(Path::new("/a/tile.npy")), ItemMode::RawArray);
        assert_eq!(ItemMode::classify(Path::new("/a/tile.png")), ItemMode::StandardImage);
        assert_eq!(ItemMode::classify(Path::new("/a/tile.jpg")), ItemMode::StandardImage);
        assert_eq!(ItemMode::classify(Path::new("/a/tile.jpeg")), ItemMode::StandardImage);
        assert_eq!(ItemMode::classify(Path::new("/a/tile.bmp")), ItemMode::StandardImage);
        assert_eq!(ItemMode::classify(Path::new("/a/slide.svs")), ItemMode::WholeSlide);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(ItemMode::classify(Path::new("TILE.PNG")), ItemMode::StandardImage);
        assert_eq!(ItemMode::classify(Path::new("arr.NPY")), ItemMode::RawArray);
    }

    #[test]
    fn test_unknown_defaults_to_whole_slide() {
        for name in ["slide.tiff", "slide.mrxs", "slide.ome.tif", "noext", "archive.", ".hidden", "s3://b/k/slide.ndpi"] {
            assert_eq!(ItemMode::classify(Path::new(name)), ItemMode::WholeSlide, "{}", name);
        }
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("a/b/slide.svs")), "svs");
        assert_eq!(extension_of(Path::new("a/b/slide")), "");
        assert_eq!(extension_of(Path::new("x.ome.tif")), "tif");
    }
}
