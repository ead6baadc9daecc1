pub mod config;
pub mod fetch;
pub mod logger;
pub mod mcp;
pub mod metadata;
pub mod process;
pub mod registry;
pub mod schema;
pub mod secret;
pub mod watcher;
