// src/schema.rs

use std::{fs, path::PathBuf};

use anyhow::Error;
use plugin_api::metadata::PluginMetadata;
use schemars::schema_for;

use crate::registry::InstanceDiagnostics;

/// The entry point invoked by `main.rs` for `Commands::Schema`: emit the
/// JSON schemas of the wire types the platform consumes.
pub fn write_schema(out_dir: PathBuf) -> Result<(), Error> {
    fs::create_dir_all(&out_dir)?;

    let metadata_schema = schema_for!(PluginMetadata);
    fs::write(
        out_dir.join("plugin-metadata.schema.json"),
        serde_json::to_string_pretty(&metadata_schema)?,
    )?;

    let diagnostics_schema = schema_for!(Vec<InstanceDiagnostics>);
    fs::write(
        out_dir.join("instance-diagnostics.schema.json"),
        serde_json::to_string_pretty(&diagnostics_schema)?,
    )?;

    Ok(())
}
