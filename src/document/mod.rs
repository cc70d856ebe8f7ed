//! Template rendering and the filter chain

pub mod filters;
pub mod pipeline;
pub mod template;

pub use filters::{Filter, FilterContext, FilterRegistry};
pub use pipeline::{publish, reset_output_dir, DocumentKind, DocumentPipeline, GeneratedDocument};
pub use template::{ExpressionEngine, TemplateData, TemplateEngine, TemplateSource};
