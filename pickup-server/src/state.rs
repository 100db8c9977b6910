//! Application state shared across all request handlers.

use pickup_core::store::PgStore;

/// Cheap to clone; the store only holds the connection pool.
#[derive(Clone)]
pub struct AppState {
    pub store: PgStore,
}

impl AppState {
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }
}
