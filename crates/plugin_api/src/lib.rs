pub mod context;
pub mod definition;
pub mod mcp;
pub mod metadata;
pub mod runtime;

pub use context::{AuthState, GlobalContext, StartContext};
pub use definition::{AuthCheck, DefinitionError, HookError, PluginDefinition, PluginFactory};
pub use metadata::PluginMetadata;
pub use runtime::run;
