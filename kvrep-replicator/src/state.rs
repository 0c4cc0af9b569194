use std::sync::Arc;

use kvrep_core::Replicator;

#[derive(Clone)]
pub struct AppState {
    pub replicator: Arc<Replicator>,
}

impl AppState {
    pub fn new(replicator: Arc<Replicator>) -> Self {
        Self { replicator }
    }
}
