pub mod metadata;

pub use metadata::{
    ParameterSchema, PortMetadata, StageFactory, StageMetadata, StageMetadataFactoryWrapper,
};

use crate::core::Stage;
use anyhow::{anyhow, Result};
use serde_json::Value;

/// All stage types linked into the binary
pub fn list_stages() -> Vec<StageMetadata> {
    let mut stages: Vec<StageMetadata> = inventory::iter::<StageMetadataFactoryWrapper>
        .into_iter()
        .map(|wrapper| (wrapper.0)())
        .collect();
    stages.sort_by(|a, b| a.id.cmp(&b.id));
    stages
}

/// Look up a stage by type id (`"IirFilter"`) or display name (`"IIR Filter"`)
pub fn find_stage(type_name: &str) -> Option<StageMetadata> {
    inventory::iter::<StageMetadataFactoryWrapper>
        .into_iter()
        .map(|wrapper| (wrapper.0)())
        .find(|meta| meta.id == type_name || meta.name == type_name)
}

/// Instantiate a registered stage type and hand it its JSON config
pub fn create_stage(type_name: &str, config: Value) -> Result<Box<dyn Stage>> {
    let meta = find_stage(type_name).ok_or_else(|| anyhow!("Unknown stage type: {}", type_name))?;
    meta.check_config(&config)
        .map_err(|e| anyhow!("Invalid {} config: {}", type_name, e))?;
    let mut stage = meta.create_instance();
    stage
        .on_create(config)
        .map_err(|e| anyhow!("Failed to configure {} stage: {}", type_name, e))?;
    Ok(stage)
}
