use std::sync::{Arc, Mutex};

use skillswap_store::{Database, StoreError};

use crate::error::ServerError;

/// The one database connection, shared by every request and session.
pub type SharedDb = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDb {
    Arc::new(Mutex::new(db))
}

/// Run `f` with the database locked. Keep `f` short and never hold it across
/// an `.await`.
pub fn with_db<T>(
    db: &SharedDb,
    f: impl FnOnce(&mut Database) -> Result<T, StoreError>,
) -> Result<T, ServerError> {
    let mut guard = db
        .lock()
        .map_err(|_| ServerError::Internal("database lock poisoned".into()))?;
    Ok(f(&mut guard)?)
}
