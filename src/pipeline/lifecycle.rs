//! Store handle ownership and cleanup for one item.
//!
//! [`ItemResources`] holds every handle opened for an item. Handles are closed explicitly on the
//! normal path and by `Drop` on every other one (errors, interrupts, early exit), so no handle
//! outlives the iteration that opened it.

use crate::io::{delete_store, ArrayStore};
use crate::pipeline::{Metrics, RawStores, WorkItem};

/// Handles opened for the current item.
#[derive(Debug, Default)]
pub struct ItemResources {
    raw: Option<RawStores>,
    final_store: Option<ArrayStore>,
}

impl ItemResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_raw(&mut self, raw: RawStores) {
        if let Some(previous) = self.raw.replace(raw) {
            close_raw_pair(&previous);
        }
    }

    pub fn raw(&self) -> Option<&RawStores> {
        self.raw.as_ref()
    }

    pub fn set_final(&mut self, store: ArrayStore) {
        if let Some(previous) = self.final_store.replace(store) {
            previous.close();
        }
    }

    /// Close the instance and class stores. Returns how many handles this call closed.
    pub fn close_raw(&mut self) -> usize {
        self.raw.take().map_or(0, |raw| close_raw_pair(&raw))
    }

    /// Close every handle still held. Returns how many handles this call closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = self.close_raw();
        if let Some(store) = self.final_store.take() {
            closed += usize::from(store.close());
        }
        closed
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_none() && self.final_store.is_none()
    }
}

impl Drop for ItemResources {
    fn drop(&mut self) {
        let closed = self.close_all();
        if closed > 0 {
            tracing::debug!("Closed {} store handle(s) while unwinding item", closed);
        }
    }
}

fn close_raw_pair(raw: &RawStores) -> usize {
    usize::from(raw.instance.close()) + usize::from(raw.class.close())
}

/// Remove the instance and class stores of an item.
///
/// Best effort: a store that is already gone is not an error, other failures are logged and
/// ignored. Returns the number of stores removed.
pub fn delete_raw_stores(item: &WorkItem, metrics: &Metrics) -> usize {
    let mut deleted = 0;
    for path in [item.instance_store_path(), item.class_store_path()] {
        match delete_store(&path) {
            Ok(true) => {
                metrics.add_raw_store_deleted();
                deleted += 1;
                tracing::debug!("Deleted raw store {}", path.display());
            }
            Ok(false) => tracing::debug!("Raw store {} already absent", path.display()),
            Err(e) => tracing::warn!("Failed to delete raw store {}: {}", path.display(), e),
        }
    }
    deleted
}
