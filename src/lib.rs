// Library interface for precis
// The binary and integration tests both build batches through these modules

pub mod batch;
pub mod cache_key;
pub mod cancel;
pub mod config;
pub mod config_discovery;
pub mod document;
pub mod error;
pub mod function;
pub mod logging;
pub mod process;
pub mod remote;
pub mod storage;

// Re-export commonly used types
pub use batch::{Batch, BatchReport, PlannedStep, StepReport};
pub use cache_key::CacheKey;
pub use cancel::CancelFlag;
pub use config::BatchConfig;
pub use config_discovery::{discover_config, load_config_with_discovery};
pub use error::{PrecisError, Result};
pub use function::{ExecutionContext, FunctionRegistry, FunctionSource, StepFunction};
pub use storage::{default_cache_dir, CacheStore};
