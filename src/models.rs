//! Model catalog.
//!
//! Foundation and embedding models can be pinned in a YAML file instead of
//! environment variables:
//!
//! ```yaml
//! agent_models:
//!   primary: { id: amazon.nova-pro-v1:0, name: Nova Pro }
//!   alternatives:
//!     - { id: anthropic.claude-3-haiku-20240307-v1:0, name: Claude 3 Haiku }
//! embedding_models:
//!   primary: { id: amazon.titan-embed-text-v1, dimension: 1536 }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ConfigError;

pub const DEFAULT_FOUNDATION_MODEL: &str = "amazon.nova-pro-v1:0";
pub const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v1";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 1536;

/// A text-generation model usable by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// An embedding model usable by the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub id: String,
    /// Vector size produced by the model; must match the search index
    #[serde(default = "default_dimension")]
    pub dimension: u32,
}

fn default_dimension() -> u32 {
    DEFAULT_EMBEDDING_DIMENSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ModelChoices<T> {
    pub primary: T,
    #[serde(default)]
    pub alternatives: Vec<T>,
}

/// Models used by a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub agent_models: ModelChoices<AgentModel>,
    pub embedding_models: ModelChoices<EmbeddingModel>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            agent_models: ModelChoices {
                primary: AgentModel {
                    id: DEFAULT_FOUNDATION_MODEL.to_string(),
                    name: Some("Amazon Nova Pro".to_string()),
                    description: None,
                },
                alternatives: Vec::new(),
            },
            embedding_models: ModelChoices {
                primary: EmbeddingModel {
                    id: DEFAULT_EMBEDDING_MODEL.to_string(),
                    dimension: DEFAULT_EMBEDDING_DIMENSION,
                },
                alternatives: Vec::new(),
            },
        }
    }
}

impl ModelCatalog {
    /// Parse a catalog from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text)
            .map_err(|e| ConfigError::InvalidValue("models file".to_string(), e.to_string()))
    }

    /// Load a catalog from a file. The file must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidValue(
                "AGENT_STACK_MODELS_FILE".to_string(),
                format!("{}: {}", path.display(), e),
            )
        })?;
        let catalog = Self::from_yaml(&text)?;
        info!("Loaded model catalog from {}", path.display());
        Ok(catalog)
    }

    /// Agent model by role: `primary` or the id of one of the alternatives.
    pub fn agent_model(&self, which: &str) -> Option<&AgentModel> {
        if which == "primary" {
            return Some(&self.agent_models.primary);
        }
        std::iter::once(&self.agent_models.primary)
            .chain(self.agent_models.alternatives.iter())
            .find(|m| m.id == which)
    }

    /// Embedding model by role: `primary` or the id of one of the alternatives.
    pub fn embedding_model(&self, which: &str) -> Option<&EmbeddingModel> {
        if which == "primary" {
            return Some(&self.embedding_models.primary);
        }
        std::iter::once(&self.embedding_models.primary)
            .chain(self.embedding_models.alternatives.iter())
            .find(|m| m.id == which)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_with_alternatives() {
        let yaml = r#"
agent_models:
  primary: { id: amazon.nova-pro-v1:0, name: Nova Pro }
  alternatives:
    - { id: anthropic.claude-3-haiku-20240307-v1:0 }
embedding_models:
  primary: { id: amazon.titan-embed-text-v2:0, dimension: 1024 }
"#;
        let catalog = ModelCatalog::from_yaml(yaml).unwrap();
        assert_eq!(catalog.agent_model("primary").unwrap().id, "amazon.nova-pro-v1:0");
        assert!(catalog
            .agent_model("anthropic.claude-3-haiku-20240307-v1:0")
            .is_some());
        assert!(catalog.agent_model("unknown").is_none());
        assert_eq!(catalog.embedding_model("primary").unwrap().dimension, 1024);
    }

    #[test]
    fn embedding_dimension_defaults() {
        let yaml = r#"
agent_models:
  primary: { id: a }
embedding_models:
  primary: { id: e }
"#;
        let catalog = ModelCatalog::from_yaml(yaml).unwrap();
        assert_eq!(
            catalog.embedding_models.primary.dimension,
            DEFAULT_EMBEDDING_DIMENSION
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelCatalog::load(&dir.path().join("modles.yaml")).unwrap_err();
        assert!(err.to_string().contains("modles.yaml"));
    }

    #[test]
    fn loads_catalog_without_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.yaml");
        std::fs::write(
            &path,
            "agent_models:\n  primary: { id: a }\nembedding_models:\n  primary: { id: e, dimension: 8 }\n",
        )
        .unwrap();
        let catalog = ModelCatalog::load(&path).unwrap();
        assert!(catalog.agent_models.alternatives.is_empty());
        assert_eq!(catalog.embedding_model("e").unwrap().dimension, 8);
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        assert!(ModelCatalog::from_yaml("agent_models: [").is_err());
    }
}
