use calsync_caldav::CalDav;
use calsync_store::Store;
use std::sync::Arc;

/// The reconciliation engine: decides, per tracked event, whether to upload,
/// fast-forward from the calendar, or quarantine a conflict, and applies the
/// outcome to the store.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) store: Store,
    pub(crate) caldav: Arc<dyn CalDav>,
}

impl SyncEngine {
    pub fn new(store: Store, caldav: Arc<dyn CalDav>) -> Self {
        Self { store, caldav }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
