pub mod blob;
pub mod sqlite;

pub use blob::DiskBlobStore;
pub use sqlite::SqliteStore;
