use crate::engine::{AcquisitionKernel, ExtractorBinding, StageGraph};
use crate::hal::{Direction, Engine, EngineConfig, LoopbackSettings};
use crate::queue::QueuePolicy;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// An input routed through a stage graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,

    /// `{nodes: [{id, type, config}], connections: [{from, to}]}`
    #[serde(default)]
    pub graph: Option<Value>,

    /// Continuous store for the raw samples
    #[serde(default)]
    pub record: Option<PathBuf>,
}

/// An output fed by a signal queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,

    #[serde(default)]
    pub policy: QueuePolicy,

    #[serde(default = "default_auto_decrement")]
    pub auto_decrement: bool,
}

fn default_auto_decrement() -> bool {
    true
}

/// Complete description of one acquisition setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub engine: EngineConfig,

    /// Loopback used when running against the simulated engine
    #[serde(default)]
    pub simulation: LoopbackSettings,

    #[serde(default)]
    pub inputs: Vec<InputConfig>,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,

    #[serde(default)]
    pub extractors: Vec<ExtractorBinding>,
}

impl ExperimentConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse experiment config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .context(format!("Failed to read experiment config from {:?}", path))?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize experiment config")?;
        fs::write(path, json).context(format!("Failed to write experiment config to {:?}", path))?;
        Ok(())
    }

    fn require_direction(&self, name: &str, direction: Direction) -> Result<()> {
        let channel = self.engine.channel(name)?;
        if channel.direction != direction {
            bail!("Channel {} is not an {:?} channel", name, direction);
        }
        Ok(())
    }

    /// Fail fast on anything that would stop acquisition from starting
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        for input in &self.inputs {
            self.require_direction(&input.name, Direction::Input)?;
            if let Some(graph) = &input.graph {
                StageGraph::from_json(graph)
                    .with_context(|| format!("Invalid stage graph for input {}", input.name))?;
            }
        }
        for output in &self.outputs {
            self.require_direction(&output.name, Direction::Output)?;
            output
                .policy
                .validate()
                .with_context(|| format!("Invalid queue policy for output {}", output.name))?;
        }
        for extractor in &self.extractors {
            if !self.inputs.iter().any(|i| i.name == extractor.input) {
                bail!("Extractor {} reads unconfigured input {}", extractor.name, extractor.input);
            }
            if !self.outputs.iter().any(|o| o.name == extractor.output) {
                bail!("Extractor {} follows unconfigured output {}", extractor.name, extractor.output);
            }
        }
        Ok(())
    }

    /// Assemble an idle kernel around `engine`
    pub fn build_kernel(&self, engine: Box<dyn Engine>) -> Result<AcquisitionKernel> {
        let mut kernel = AcquisitionKernel::new(engine, self.engine.clone())?;
        for output in &self.outputs {
            kernel.add_output(&output.name, output.policy, output.auto_decrement)?;
        }
        for input in &self.inputs {
            let graph = match &input.graph {
                Some(graph) => StageGraph::from_json(graph)?,
                None => StageGraph::new(),
            };
            kernel.add_input(&input.name, graph)?;
            if let Some(path) = &input.record {
                kernel.record(&input.name, path)?;
            }
        }
        for extractor in &self.extractors {
            kernel.add_extractor(extractor.clone())?;
        }
        tracing::info!(
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            extractors = self.extractors.len(),
            "kernel assembled from config"
        );
        Ok(kernel)
    }

    pub fn input(&self, name: &str) -> Result<&InputConfig> {
        self.inputs
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| anyhow!("Input {} is not configured", name))
    }
}
