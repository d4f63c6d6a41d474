//! Input resolution and per-item classification.

mod classifier;
mod resolver;

pub use classifier::{extension_of, ItemMode};
pub use resolver::{resolve_inputs, ItemSource};
