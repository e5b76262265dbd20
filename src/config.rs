//! Configuration management for agent-stack.
//!
//! Configuration is set via environment variables:
//! - `AGENT_STACK_BASE_NAME` - Optional. Base name for agents, roles and functions. Defaults to `multi-agent-ai`.
//! - `AGENT_STACK_KB_BASE_NAME` - Optional. Base name for knowledge-base resources. Defaults to `bedrock-agent-kb`.
//! - `AGENT_STACK_STORAGE_BASE_NAME` - Optional. Base name for the bucket. Defaults to `bedrock-agent`.
//! - `AWS_REGION` / `AWS_DEFAULT_REGION` - Optional. Region. Defaults to `us-east-1`.
//! - `AGENT_STACK_FOUNDATION_MODEL` - Optional. Overrides the catalog's primary agent model.
//! - `AGENT_STACK_EMBEDDING_MODEL` - Optional. Overrides the catalog's primary embedding model.
//! - `AGENT_STACK_MODELS_FILE` - Optional. YAML model catalog.
//! - `AGENT_STACK_BACKEND` - Optional. `aws` or `local`. Defaults to `aws`.
//! - `AGENT_STACK_STATE_FILE` - Optional. State file for the local backend. Defaults to `.agent-stack/state.json`.
//! - `AGENT_STACK_RUNTIME_BINARY` - Optional. Collaborator runtime binary to package into functions.
//! - `AGENT_STACK_ACCOUNT_ID` - Optional. Account id reported by the local backend.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::ModelCatalog;
use crate::wait::PollPolicy;

pub const DEFAULT_BASE_NAME: &str = "multi-agent-ai";
pub const DEFAULT_KB_BASE_NAME: &str = "bedrock-agent-kb";
pub const DEFAULT_STORAGE_BASE_NAME: &str = "bedrock-agent";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_STATE_FILE: &str = ".agent-stack/state.json";
pub const LOCAL_ACCOUNT_ID: &str = "000000000000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which control plane to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The real cloud control plane (requires the `aws` feature)
    Aws,
    /// File-backed simulator
    Local,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(BackendKind::Aws),
            "local" | "memory" => Ok(BackendKind::Local),
            other => Err(ConfigError::InvalidValue(
                "AGENT_STACK_BACKEND".to_string(),
                format!("unknown backend '{}'", other),
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Aws => write!(f, "aws"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// Base names every resource name is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingInputs {
    pub base_name: String,
    pub kb_base_name: String,
    pub storage_base_name: String,
}

impl Default for NamingInputs {
    fn default() -> Self {
        Self {
            base_name: DEFAULT_BASE_NAME.to_string(),
            kb_base_name: DEFAULT_KB_BASE_NAME.to_string(),
            storage_base_name: DEFAULT_STORAGE_BASE_NAME.to_string(),
        }
    }
}

/// Polling schedules per resource family.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    pub agent: PollPolicy,
    pub alias: PollPolicy,
    pub knowledge_base: PollPolicy,
    pub collection: PollPolicy,
    pub ingestion: PollPolicy,
    pub function: PollPolicy,
    /// Read-after-write settling (new roles, attached policies)
    pub consistency: PollPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            agent: PollPolicy::fixed(Duration::from_secs(300), Duration::from_secs(5)),
            alias: PollPolicy::fixed(Duration::from_secs(300), Duration::from_secs(5)),
            knowledge_base: PollPolicy::fixed(Duration::from_secs(300), Duration::from_secs(5)),
            collection: PollPolicy::fixed(Duration::from_secs(600), Duration::from_secs(10)),
            ingestion: PollPolicy::fixed(Duration::from_secs(600), Duration::from_secs(10)),
            function: PollPolicy::fixed(Duration::from_secs(300), Duration::from_secs(2)),
            consistency: PollPolicy::exponential(
                Duration::from_secs(60),
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(10),
            ),
        }
    }
}

impl PollingConfig {
    /// Millisecond schedules for the local simulator and tests.
    pub fn immediate() -> Self {
        let p = PollPolicy::fixed(Duration::from_secs(5), Duration::from_millis(1));
        Self {
            agent: p,
            alias: p,
            knowledge_base: p,
            collection: p,
            ingestion: p,
            function: p,
            consistency: p,
        }
    }
}

/// Deployment configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base names for derived resource names
    pub naming: NamingInputs,

    /// Region to deploy into
    pub region: String,

    /// Foundation model for all agents
    pub foundation_model: String,

    /// Embedding model for the knowledge base
    pub embedding_model: String,

    /// Vector dimension of the embedding model
    pub embedding_dimension: u32,

    /// Control plane backend
    pub backend: BackendKind,

    /// State file of the local backend
    pub state_file: PathBuf,

    /// Collaborator runtime binary packaged into functions
    pub runtime_binary: Option<PathBuf>,

    /// Account id reported by the local backend
    pub local_account_id: String,

    /// Polling schedules
    pub polling: PollingConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unknown backend or an
    /// unreadable model catalog.
    pub fn from_env() -> Result<Self, ConfigError> {
        let naming = NamingInputs {
            base_name: std::env::var("AGENT_STACK_BASE_NAME")
                .unwrap_or_else(|_| DEFAULT_BASE_NAME.to_string()),
            kb_base_name: std::env::var("AGENT_STACK_KB_BASE_NAME")
                .unwrap_or_else(|_| DEFAULT_KB_BASE_NAME.to_string()),
            storage_base_name: std::env::var("AGENT_STACK_STORAGE_BASE_NAME")
                .unwrap_or_else(|_| DEFAULT_STORAGE_BASE_NAME.to_string()),
        };

        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| DEFAULT_REGION.to_string());

        let catalog = match std::env::var("AGENT_STACK_MODELS_FILE") {
            Ok(path) => ModelCatalog::load(&PathBuf::from(path))?,
            Err(_) => ModelCatalog::default(),
        };

        let foundation_model = std::env::var("AGENT_STACK_FOUNDATION_MODEL")
            .unwrap_or_else(|_| catalog.agent_models.primary.id.clone());

        let (embedding_model, embedding_dimension) =
            match std::env::var("AGENT_STACK_EMBEDDING_MODEL") {
                Ok(id) => {
                    let dimension = catalog
                        .embedding_model(&id)
                        .map(|m| m.dimension)
                        .unwrap_or(catalog.embedding_models.primary.dimension);
                    (id, dimension)
                }
                Err(_) => (
                    catalog.embedding_models.primary.id.clone(),
                    catalog.embedding_models.primary.dimension,
                ),
            };

        let backend = std::env::var("AGENT_STACK_BACKEND")
            .unwrap_or_else(|_| "aws".to_string())
            .parse()?;

        let state_file = std::env::var("AGENT_STACK_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_FILE));

        let runtime_binary = std::env::var("AGENT_STACK_RUNTIME_BINARY")
            .map(PathBuf::from)
            .ok();

        let local_account_id = std::env::var("AGENT_STACK_ACCOUNT_ID")
            .unwrap_or_else(|_| LOCAL_ACCOUNT_ID.to_string());
        if local_account_id.len() != 12 || !local_account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidValue(
                "AGENT_STACK_ACCOUNT_ID".to_string(),
                "expected 12 digits".to_string(),
            ));
        }

        Ok(Self {
            naming,
            region,
            foundation_model,
            embedding_model,
            embedding_dimension,
            backend,
            state_file,
            runtime_binary,
            local_account_id,
            polling: PollingConfig::default(),
        })
    }

    /// Create a config for the local backend (useful for testing).
    pub fn local(region: &str) -> Self {
        let catalog = ModelCatalog::default();
        Self {
            naming: NamingInputs::default(),
            region: region.to_string(),
            foundation_model: catalog.agent_models.primary.id,
            embedding_model: catalog.embedding_models.primary.id,
            embedding_dimension: catalog.embedding_models.primary.dimension,
            backend: BackendKind::Local,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            runtime_binary: None,
            local_account_id: LOCAL_ACCOUNT_ID.to_string(),
            polling: PollingConfig::immediate(),
        }
    }

    /// Embedding model ARN in the configured region.
    pub fn embedding_model_arn(&self) -> String {
        format!(
            "arn:aws:bedrock:{}::foundation-model/{}",
            self.region, self.embedding_model
        )
    }

    /// Runtime binary to package, defaulting to the `collaborator-runtime`
    /// binary next to the running executable.
    pub fn resolve_runtime_binary(&self) -> Option<PathBuf> {
        if let Some(path) = &self.runtime_binary {
            return Some(path.clone());
        }
        let exe = std::env::current_exe().ok()?;
        Some(exe.with_file_name("collaborator-runtime"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses() {
        assert_eq!("aws".parse::<BackendKind>().unwrap(), BackendKind::Aws);
        assert_eq!("LOCAL".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("gcp".parse::<BackendKind>().is_err());
    }

    #[test]
    fn embedding_arn_uses_region() {
        let config = Config::local("eu-west-1");
        assert_eq!(
            config.embedding_model_arn(),
            "arn:aws:bedrock:eu-west-1::foundation-model/amazon.titan-embed-text-v1"
        );
    }

    #[test]
    fn explicit_runtime_binary_wins() {
        let mut config = Config::local("us-east-1");
        config.runtime_binary = Some(PathBuf::from("/opt/bootstrap"));
        assert_eq!(
            config.resolve_runtime_binary(),
            Some(PathBuf::from("/opt/bootstrap"))
        );
    }
}
