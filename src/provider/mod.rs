//! Control-plane backends.
//!
//! One trait per resource family exposes the raw calls the adapters need.
//! Backends implement every family:
//!
//! - [`local::MemoryControlPlane`] - file-backed simulator used by tests and
//!   `--backend local`
//! - `aws::AwsControlPlane` - the real platform (cargo feature `aws`)
//!
//! Errors are classified [`ApiError`]s so adapters can recognise the
//! idempotent outcomes (`NotFound`, `AlreadyExists`) without knowing which
//! backend produced them.

pub mod local;

#[cfg(feature = "aws")]
pub mod aws;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::FunctionSchema;
use crate::config::{BackendKind, Config};
use crate::error::{ApiError, ProvisionError};
use crate::policy::CollectionPolicyKind;

pub use local::MemoryControlPlane;

/// Account identity of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
}

#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn caller_identity(&self) -> Result<CallerIdentity, ApiError>;
}

// ==================== IAM ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedPolicyInfo {
    pub name: String,
    pub arn: String,
    pub default_version_id: String,
    pub attachment_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVersionInfo {
    pub version_id: String,
    pub is_default: bool,
}

#[async_trait]
pub trait IamApi: Send + Sync {
    async fn get_role(&self, name: &str) -> Result<RoleInfo, ApiError>;
    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        description: &str,
    ) -> Result<RoleInfo, ApiError>;
    async fn update_assume_role_policy(&self, name: &str, trust_policy: &str)
        -> Result<(), ApiError>;
    async fn delete_role(&self, name: &str) -> Result<(), ApiError>;

    async fn get_policy(&self, arn: &str) -> Result<ManagedPolicyInfo, ApiError>;
    /// Document of one policy version.
    async fn get_policy_version(&self, arn: &str, version_id: &str) -> Result<String, ApiError>;
    async fn create_policy(
        &self,
        name: &str,
        document: &str,
        description: &str,
    ) -> Result<ManagedPolicyInfo, ApiError>;
    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_as_default: bool,
    ) -> Result<PolicyVersionInfo, ApiError>;
    async fn list_policy_versions(&self, arn: &str) -> Result<Vec<PolicyVersionInfo>, ApiError>;
    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), ApiError>;
    async fn delete_policy(&self, arn: &str) -> Result<(), ApiError>;

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), ApiError>;
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), ApiError>;
    /// ARNs of managed policies attached to a role.
    async fn list_attached_role_policies(&self, role: &str) -> Result<Vec<String>, ApiError>;
    /// Names of inline policies of a role.
    async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, ApiError>;
    async fn delete_role_policy(&self, role: &str, name: &str) -> Result<(), ApiError>;
}

// ==================== Object storage ====================

/// One object version or delete marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub key: String,
    /// `None` addresses the current object (or creates a delete marker in a
    /// versioned bucket)
    pub version_id: Option<String>,
    #[serde(default)]
    pub is_delete_marker: bool,
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<(), ApiError>;
    /// Create a bucket; `region` decides the location constraint.
    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), ApiError>;
    async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> Result<(), ApiError>;
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ApiError>;
    /// Keys of current objects, optionally under a prefix.
    async fn list_objects(&self, bucket: &str, prefix: Option<&str>)
        -> Result<Vec<String>, ApiError>;
    /// Every version and delete marker in the bucket.
    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectVersion>, ApiError>;
    /// Delete a batch; returns how many entries were removed.
    async fn delete_objects(
        &self,
        bucket: &str,
        objects: &[ObjectVersion],
    ) -> Result<usize, ApiError>;
    async fn delete_bucket(&self, bucket: &str) -> Result<(), ApiError>;
}

// ==================== Functions ====================

/// Desired configuration of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub role_arn: String,
    pub runtime: String,
    pub handler: String,
    pub timeout_secs: u32,
    pub memory_mb: u32,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub arn: String,
    /// `Pending`, `Active`, `Inactive` or `Failed`
    pub state: String,
    /// `InProgress`, `Successful` or `Failed`
    pub last_update_status: String,
    /// Base64 SHA-256 of the deployment package
    pub code_sha256: String,
    pub role_arn: String,
    pub runtime: String,
    pub handler: String,
    pub timeout_secs: u32,
    pub memory_mb: u32,
    pub environment: BTreeMap<String, String>,
}

impl FunctionInfo {
    /// Whether the live configuration differs from `spec`.
    pub fn config_drifts_from(&self, spec: &FunctionSpec) -> bool {
        self.role_arn != spec.role_arn
            || self.runtime != spec.runtime
            || self.handler != spec.handler
            || self.timeout_secs != spec.timeout_secs
            || self.memory_mb != spec.memory_mb
            || self.environment != spec.environment
    }
}

/// Resource-policy statement allowing a service to invoke a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokePermission {
    pub statement_id: String,
    pub principal: String,
    pub source_arn: Option<String>,
}

#[async_trait]
pub trait FunctionApi: Send + Sync {
    async fn get_function(&self, name: &str) -> Result<FunctionInfo, ApiError>;
    async fn create_function(&self, spec: &FunctionSpec, package: Vec<u8>)
        -> Result<FunctionInfo, ApiError>;
    async fn update_function_code(&self, name: &str, package: Vec<u8>)
        -> Result<FunctionInfo, ApiError>;
    async fn update_function_configuration(&self, spec: &FunctionSpec)
        -> Result<FunctionInfo, ApiError>;
    async fn list_functions(&self) -> Result<Vec<FunctionInfo>, ApiError>;
    async fn delete_function(&self, name: &str) -> Result<(), ApiError>;
    async fn add_permission(&self, name: &str, permission: &InvokePermission)
        -> Result<(), ApiError>;
    async fn remove_permission(&self, name: &str, statement_id: &str) -> Result<(), ApiError>;
    /// Synchronous invocation; returns the response payload.
    async fn invoke(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, ApiError>;
}

// ==================== Vector search ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPolicy {
    pub name: String,
    pub kind: CollectionPolicyKind,
    /// Opaque version token required by updates
    pub version: String,
    pub document: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    pub arn: String,
    /// `CREATING`, `ACTIVE`, `DELETING` or `FAILED`
    pub status: String,
    pub endpoint: Option<String>,
}

#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Policies of `kind` whose rules cover `resource` (e.g. `collection/name`).
    async fn list_policies(
        &self,
        kind: CollectionPolicyKind,
        resource: &str,
    ) -> Result<Vec<SearchPolicy>, ApiError>;
    async fn get_policy(&self, kind: CollectionPolicyKind, name: &str)
        -> Result<SearchPolicy, ApiError>;
    async fn create_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
        document: &str,
        description: &str,
    ) -> Result<SearchPolicy, ApiError>;
    async fn update_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
        version: &str,
        document: &str,
    ) -> Result<SearchPolicy, ApiError>;
    async fn delete_policy(&self, kind: CollectionPolicyKind, name: &str) -> Result<(), ApiError>;

    async fn get_collection(&self, name: &str) -> Result<CollectionInfo, ApiError>;
    /// Create a vector-search collection.
    async fn create_collection(&self, name: &str, description: &str)
        -> Result<CollectionInfo, ApiError>;
    async fn delete_collection(&self, id: &str) -> Result<(), ApiError>;

    async fn index_exists(&self, endpoint: &str, index: &str) -> Result<bool, ApiError>;
    async fn create_index(&self, endpoint: &str, index: &str, body: &Value)
        -> Result<(), ApiError>;
}

// ==================== Knowledge bases ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseSummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseInfo {
    pub id: String,
    pub name: String,
    pub arn: String,
    pub status: String,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
}

/// Field names inside the vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub vector: String,
    pub text: String,
    pub metadata: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            vector: "vector".to_string(),
            text: "text".to_string(),
            metadata: "metadata".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseSpec {
    pub name: String,
    pub description: String,
    pub role_arn: String,
    pub embedding_model_arn: String,
    pub collection_arn: String,
    pub vector_index: String,
    pub fields: FieldMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_tokens: u32,
    pub overlap_percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSpec {
    pub name: String,
    pub bucket_arn: String,
    pub inclusion_prefixes: Vec<String>,
    pub chunking: ChunkingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// Ingestion job status: `STARTING`, `IN_PROGRESS`, `COMPLETE` or `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
}

#[async_trait]
pub trait KnowledgeBaseApi: Send + Sync {
    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseSummary>, ApiError>;
    async fn get_knowledge_base(&self, id: &str) -> Result<KnowledgeBaseInfo, ApiError>;
    async fn create_knowledge_base(&self, spec: &KnowledgeBaseSpec)
        -> Result<KnowledgeBaseInfo, ApiError>;
    async fn delete_knowledge_base(&self, id: &str) -> Result<(), ApiError>;

    async fn list_data_sources(&self, kb_id: &str) -> Result<Vec<DataSourceSummary>, ApiError>;
    async fn create_data_source(&self, kb_id: &str, spec: &DataSourceSpec)
        -> Result<DataSourceSummary, ApiError>;
    async fn delete_data_source(&self, kb_id: &str, ds_id: &str) -> Result<(), ApiError>;

    async fn start_ingestion_job(&self, kb_id: &str, ds_id: &str)
        -> Result<IngestionJob, ApiError>;
    async fn get_ingestion_job(
        &self,
        kb_id: &str,
        ds_id: &str,
        job_id: &str,
    ) -> Result<IngestionJob, ApiError>;
}

// ==================== Agents ====================

/// Multi-agent collaboration mode of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Collaboration {
    Disabled,
    Supervisor,
    SupervisorRouter,
}

impl Collaboration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collaboration::Disabled => "DISABLED",
            Collaboration::Supervisor => "SUPERVISOR",
            Collaboration::SupervisorRouter => "SUPERVISOR_ROUTER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub role_arn: String,
    pub foundation_model: String,
    pub instruction: String,
    pub idle_session_ttl_secs: u32,
    pub collaboration: Collaboration,
    /// Session-summary memory retention in days; `None` disables memory
    pub memory_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub arn: String,
    /// `CREATING`, `NOT_PREPARED`, `PREPARING`, `PREPARED`, `UPDATING`, `FAILED`, ...
    pub status: String,
    pub role_arn: String,
    pub foundation_model: String,
    pub instruction: String,
    pub collaboration: Collaboration,
    pub memory_days: Option<u32>,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGroupSpec {
    pub name: String,
    pub description: String,
    pub function_arn: String,
    pub functions: Vec<FunctionSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGroupInfo {
    pub id: String,
    pub name: String,
    pub function_arn: String,
    pub functions: Vec<FunctionSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasInfo {
    pub id: String,
    pub name: String,
    pub arn: String,
    /// `CREATING`, `PREPARED`, `UPDATING`, `FAILED`, ...
    pub status: String,
    /// Agent version the alias routes to
    pub routing_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorInfo {
    pub id: String,
    pub name: String,
    pub alias_arn: String,
}

#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentSummary>, ApiError>;
    async fn get_agent(&self, id: &str) -> Result<AgentInfo, ApiError>;
    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentInfo, ApiError>;
    async fn update_agent(&self, id: &str, spec: &AgentSpec) -> Result<AgentInfo, ApiError>;
    async fn delete_agent(&self, id: &str) -> Result<(), ApiError>;
    /// Start preparing the working draft; returns the new status.
    async fn prepare_agent(&self, id: &str) -> Result<String, ApiError>;

    async fn list_action_groups(&self, agent_id: &str) -> Result<Vec<ActionGroupInfo>, ApiError>;
    async fn create_action_group(&self, agent_id: &str, spec: &ActionGroupSpec)
        -> Result<ActionGroupInfo, ApiError>;
    async fn update_action_group(
        &self,
        agent_id: &str,
        action_group_id: &str,
        spec: &ActionGroupSpec,
    ) -> Result<ActionGroupInfo, ApiError>;

    async fn list_aliases(&self, agent_id: &str) -> Result<Vec<AliasInfo>, ApiError>;
    async fn get_alias(&self, agent_id: &str, alias_id: &str) -> Result<AliasInfo, ApiError>;
    /// Create an alias routing to a new version cut from the prepared draft.
    async fn create_alias(&self, agent_id: &str, name: &str, description: &str)
        -> Result<AliasInfo, ApiError>;
    /// Re-point an alias at a new version cut from the prepared draft.
    async fn update_alias(&self, agent_id: &str, alias_id: &str, name: &str)
        -> Result<AliasInfo, ApiError>;
    async fn delete_alias(&self, agent_id: &str, alias_id: &str) -> Result<(), ApiError>;

    /// Ids of knowledge bases associated with the agent's draft.
    async fn list_agent_knowledge_bases(&self, agent_id: &str) -> Result<Vec<String>, ApiError>;
    async fn associate_knowledge_base(
        &self,
        agent_id: &str,
        kb_id: &str,
        description: &str,
    ) -> Result<(), ApiError>;

    async fn list_collaborators(&self, agent_id: &str) -> Result<Vec<CollaboratorInfo>, ApiError>;
    async fn associate_collaborator(
        &self,
        agent_id: &str,
        name: &str,
        alias_arn: &str,
        instruction: &str,
    ) -> Result<CollaboratorInfo, ApiError>;
    async fn disassociate_collaborator(&self, agent_id: &str, collaborator_id: &str)
        -> Result<(), ApiError>;

    /// Send one prompt through an alias; returns the completion text.
    async fn invoke_agent(
        &self,
        agent_id: &str,
        alias_id: &str,
        session_id: &str,
        input: &str,
    ) -> Result<String, ApiError>;
}

/// Every resource family of one backend.
#[derive(Clone)]
pub struct ControlPlane {
    pub identity: Arc<dyn IdentityApi>,
    pub iam: Arc<dyn IamApi>,
    pub storage: Arc<dyn StorageApi>,
    pub functions: Arc<dyn FunctionApi>,
    pub search: Arc<dyn SearchApi>,
    pub knowledge_bases: Arc<dyn KnowledgeBaseApi>,
    pub agents: Arc<dyn AgentApi>,
}

impl ControlPlane {
    /// Bundle a backend implementing every family.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: IdentityApi
            + IamApi
            + StorageApi
            + FunctionApi
            + SearchApi
            + KnowledgeBaseApi
            + AgentApi
            + 'static,
    {
        Self {
            identity: backend.clone(),
            iam: backend.clone(),
            storage: backend.clone(),
            functions: backend.clone(),
            search: backend.clone(),
            knowledge_bases: backend.clone(),
            agents: backend,
        }
    }
}

/// The backend selected by configuration.
pub enum Backend {
    Local(Arc<MemoryControlPlane>),
    #[cfg(feature = "aws")]
    Aws(Arc<aws::AwsControlPlane>),
}

impl Backend {
    /// Open the configured backend. The local simulator loads its state
    /// file; the cloud backend resolves credentials for the region.
    pub async fn connect(config: &Config) -> Result<Self, ProvisionError> {
        match config.backend {
            BackendKind::Local => Ok(Backend::Local(Arc::new(MemoryControlPlane::open(
                &config.state_file,
                &config.region,
                &config.local_account_id,
            )?))),
            #[cfg(feature = "aws")]
            BackendKind::Aws => Ok(Backend::Aws(Arc::new(
                aws::AwsControlPlane::connect(&config.region).await?,
            ))),
            #[cfg(not(feature = "aws"))]
            BackendKind::Aws => Err(ProvisionError::Precondition(
                "built without the `aws` feature; use --backend local".to_string(),
            )),
        }
    }

    pub fn control_plane(&self) -> ControlPlane {
        match self {
            Backend::Local(sim) => ControlPlane::from_backend(sim.clone()),
            #[cfg(feature = "aws")]
            Backend::Aws(cloud) => ControlPlane::from_backend(cloud.clone()),
        }
    }

    /// Write simulator state back to disk; the cloud keeps its own.
    pub fn persist(&self) -> Result<(), ProvisionError> {
        match self {
            Backend::Local(sim) => sim.save(),
            #[cfg(feature = "aws")]
            Backend::Aws(_) => Ok(()),
        }
    }
}
