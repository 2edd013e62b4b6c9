/// Storage layer
///
/// Owns the SQLite pools shared by the SQLite-backed queue, slot store and
/// flow store.

pub mod database;

pub use database::StorageManager;

/// Milliseconds since the Unix epoch, the timestamp format used in every table
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
