pub mod cache_dir;
pub mod filesystem;

pub use cache_dir::{default_cache_dir, default_output_dir};
pub use filesystem::{object_name, CacheStats, CacheStore, StagedEntry, METADATA_EXT};
