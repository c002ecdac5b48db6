pub mod identity;
pub mod kv_store;

pub use identity::IdentityStore;
pub use kv_store::{KeyValueStore, SqliteKeyValueStore};
