//! Session/conversation cache: session metadata, ordered history and owner
//! context under prefixed keys with TTLs.

pub mod cache;
pub mod sqlite_cache;
pub mod store;

pub use cache::{CacheBackend, CachedValue, MokaCacheBackend};
pub use sqlite_cache::SqliteCacheBackend;
pub use store::{
    history_key, owner_key, session_key, AppendOutcome, SessionStore, SessionStoreConfig,
};
