//! I/O: array store handles, item caching, and remote object stores.

mod array_store;
pub mod cache;
mod store;

pub use array_store::{
    delete_store, ArrayStore, StoreLayout, StoreRole, CLASS_STORE_SUFFIX, FINAL_STORE_NAME,
    INSTANCE_STORE_SUFFIX,
};
pub use cache::{evict, stage_item, StagedItem};
pub use store::{create_input_store, parse_s3_uri};
