use crate::core::Stage;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata describing a port (input or output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMetadata {
    pub id: String,
    pub name: String,
    pub data_type: String,
}

/// Schema for a configurable parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub default: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParameterSchema {
    /// Reject a configured value of the wrong JSON type or outside `[min, max]`
    pub fn check(&self, value: &Value) -> Result<()> {
        match self.param_type.as_str() {
            "number" => {
                let Some(v) = value.as_f64() else {
                    bail!("{} must be a number, got {}", self.name, value);
                };
                if self.min.is_some_and(|min| v < min) || self.max.is_some_and(|max| v > max) {
                    bail!(
                        "{} = {} is outside [{}, {}]",
                        self.name,
                        v,
                        self.min.unwrap_or(f64::NEG_INFINITY),
                        self.max.unwrap_or(f64::INFINITY)
                    );
                }
            }
            "string" if !value.is_string() => bail!("{} must be a string, got {}", self.name, value),
            "boolean" if !value.is_boolean() => bail!("{} must be a boolean, got {}", self.name, value),
            _ => {}
        }
        Ok(())
    }
}

/// Factory function type for creating stage instances
pub type StageFactory = fn() -> Box<dyn Stage>;

/// Complete metadata for a stage type
#[derive(Clone)]
pub struct StageMetadata {
    /// Type name used in graph JSON (`"IirFilter"`, `"Downsample"`, ...)
    pub id: String,
    pub name: String,
    pub category: String,
    pub inputs: Vec<PortMetadata>,
    pub outputs: Vec<PortMetadata>,
    pub parameters: Vec<ParameterSchema>,
    pub factory: StageFactory,
}

impl StageMetadata {
    /// Create a new, unconfigured instance of this stage type
    pub fn create_instance(&self) -> Box<dyn Stage> {
        (self.factory)()
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSchema> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check every declared parameter present in `config`.
    ///
    /// Keys without a schema are left to the stage itself.
    pub fn check_config(&self, config: &Value) -> Result<()> {
        let fields = match config {
            Value::Null => return Ok(()),
            Value::Object(fields) => fields,
            other => bail!("{} config must be an object, got {}", self.id, other),
        };
        for param in &self.parameters {
            if let Some(value) = fields.get(&param.name) {
                param.check(value)?;
            }
        }
        Ok(())
    }
}

// Factory type for creating stage metadata at runtime
pub type StageMetadataFactory = fn() -> StageMetadata;

// Wrapper for inventory collection
pub struct StageMetadataFactoryWrapper(pub StageMetadataFactory);

inventory::collect!(StageMetadataFactoryWrapper);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cutoff() -> ParameterSchema {
        ParameterSchema {
            name: "fl".to_string(),
            param_type: "number".to_string(),
            default: json!(300.0),
            min: Some(0.0),
            max: None,
        }
    }

    #[test]
    fn test_number_bounds() {
        assert!(cutoff().check(&json!(100)).is_ok());
        assert!(cutoff().check(&json!(-1.0)).is_err());
        assert!(cutoff().check(&json!("high")).is_err());
    }

    #[test]
    fn test_string_type() {
        let btype = ParameterSchema {
            name: "btype".to_string(),
            param_type: "string".to_string(),
            default: json!("bandpass"),
            min: None,
            max: None,
        };
        assert!(btype.check(&json!("lowpass")).is_ok());
        assert!(btype.check(&json!(2)).is_err());
    }
}
