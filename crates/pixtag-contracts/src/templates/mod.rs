mod registry;
mod selectors;

pub use registry::{PromptTemplate, TemplateRegistry};
pub use selectors::{normalize_model_name, TemplateSelection, TemplateSelector};
