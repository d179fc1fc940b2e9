pub mod identity_cache;
pub mod loader;
pub mod memory_store;
pub mod pg_store;
pub mod resolver;
pub mod store;
