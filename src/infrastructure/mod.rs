pub mod config;
pub mod error;
pub mod http_store;
pub mod logging;
pub mod memory_store;
pub mod persistence;
pub mod sqlite_store;
pub mod storage;
pub mod view_cache;
pub mod wire;
