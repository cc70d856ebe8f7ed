//! Step functions and their cached execution
//!
//! A [`StepFunction`] is a typed callable plus the fingerprint that stands in
//! for its behaviour in cache keys. Functions are grouped into
//! [`FunctionSource`]s and looked up through a [`FunctionRegistry`]; each
//! declared step becomes a [`FunctionRun`] that restores or executes it.

pub mod context;
pub mod metadata;
pub mod registry;
pub mod run;
pub mod shell;

pub use context::ExecutionContext;
pub use metadata::{MetadataEnvelope, SupplementalFile, METADATA_VERSION};
pub use registry::{FunctionRegistry, FunctionSource, ResolvedFunction};
pub use run::{FunctionRun, RunOutcome, RunState};

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

type Callable =
    dyn Fn(&mut ExecutionContext<'_>, &Map<String, Value>) -> anyhow::Result<Value> + Send + Sync;

/// A caller-supplied computation
///
/// `fingerprint` must change whenever the function's behaviour changes;
/// every cached result of the old behaviour is then ignored.
#[derive(Clone)]
pub struct StepFunction {
    name: String,
    fingerprint: String,
    callable: Arc<Callable>,
}

impl StepFunction {
    pub fn new<F>(name: &str, fingerprint: &str, callable: F) -> Self
    where
        F: Fn(&mut ExecutionContext<'_>, &Map<String, Value>) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            callable: Arc::new(callable),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn call(
        &self,
        ctx: &mut ExecutionContext<'_>,
        args: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        (self.callable)(ctx, args)
    }
}

impl fmt::Debug for StepFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepFunction")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
