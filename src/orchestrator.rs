//! Deployment state machine.
//!
//! # State Machine
//! ```text
//! IAM_ROLES -> STORAGE -> SEARCH_COLLECTION -> SEARCH_INDEX -> KNOWLEDGE_BASE
//!   -> DATA_SOURCE -> COMPUTE_FUNCTIONS -> SUPERVISOR_AGENT -> COLLABORATOR_AGENTS
//!   -> KB_ASSOCIATION -> COLLABORATOR_ASSOCIATION [-> DATA_UPLOAD -> KB_SYNC] -> DONE
//! ```
//!
//! Stages run strictly in order and each one is create-or-update, so a run
//! that failed part way is resumed by running it again. A failure aborts the
//! run and names the stage it happened in.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::adapters::knowledge_base::KB_DESCRIPTION;
use crate::adapters::{AgentAdapter, AgentRecord, Adapters, CollaboratorLink};
use crate::collaborators::{validate_functions, CollaboratorConfig, Selection};
use crate::context::DeploymentContext;
use crate::error::ProvisionError;
use crate::names::{ResourceNames, SUPERVISOR_ALIAS_NAME};
use crate::package::{DeploymentPackage, PackageSource};
use crate::provider::{ControlPlane, FieldMapping, FunctionInfo};

/// A state of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployStage {
    IamRoles,
    Storage,
    SearchCollection,
    SearchIndex,
    KnowledgeBase,
    DataSource,
    ComputeFunctions,
    SupervisorAgent,
    CollaboratorAgents,
    KbAssociation,
    CollaboratorAssociation,
    DataUpload,
    KbSync,
    Done,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::IamRoles => "IAM_ROLES",
            DeployStage::Storage => "STORAGE",
            DeployStage::SearchCollection => "SEARCH_COLLECTION",
            DeployStage::SearchIndex => "SEARCH_INDEX",
            DeployStage::KnowledgeBase => "KNOWLEDGE_BASE",
            DeployStage::DataSource => "DATA_SOURCE",
            DeployStage::ComputeFunctions => "COMPUTE_FUNCTIONS",
            DeployStage::SupervisorAgent => "SUPERVISOR_AGENT",
            DeployStage::CollaboratorAgents => "COLLABORATOR_AGENTS",
            DeployStage::KbAssociation => "KB_ASSOCIATION",
            DeployStage::CollaboratorAssociation => "COLLABORATOR_ASSOCIATION",
            DeployStage::DataUpload => "DATA_UPLOAD",
            DeployStage::KbSync => "KB_SYNC",
            DeployStage::Done => "DONE",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment that stopped in `stage`.
#[derive(Debug, Error)]
#[error("deployment failed at {stage}: {source}")]
pub struct DeployError {
    pub stage: DeployStage,
    #[source]
    pub source: ProvisionError,
}

trait AtStage<T> {
    fn at(self, stage: DeployStage) -> Result<T, DeployError>;
}

impl<T> AtStage<T> for Result<T, ProvisionError> {
    fn at(self, stage: DeployStage) -> Result<T, DeployError> {
        self.map_err(|source| DeployError { stage, source })
    }
}

/// What to deploy.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub selection: Selection,
    /// File or directory uploaded under the knowledge prefix, followed by
    /// an ingestion run. `None` skips both stages.
    pub upload_data: Option<PathBuf>,
    /// Code packaged into every collaborator function
    pub package: PackageSource,
}

impl DeploymentPlan {
    pub fn new(package: PackageSource) -> Self {
        Self {
            selection: Selection::all(),
            upload_data: None,
            package,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_upload(mut self, data: impl Into<PathBuf>) -> Self {
        self.upload_data = Some(data.into());
        self
    }
}

/// Outputs of a finished deployment.
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub supervisor: AgentRecord,
    pub knowledge_base_id: String,
    pub data_source_id: String,
    pub bucket: String,
    pub collection_endpoint: String,
    pub collaborators: Vec<String>,
    pub uploaded_files: usize,
    pub ingestion_job_id: Option<String>,
    pub elapsed: Duration,
}

impl DeploymentReport {
    /// Human-readable summary, one fact per line.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Supervisor agent: {}", self.supervisor.agent_id),
            format!("Supervisor alias: {}", self.supervisor.alias_id),
            format!("Knowledge base: {}", self.knowledge_base_id),
            format!("Data source: {}", self.data_source_id),
            format!("Bucket: {}", self.bucket),
            format!("Collection endpoint: {}", self.collection_endpoint),
            format!("Collaborators: {}", self.collaborators.join(", ")),
        ];
        if let Some(job) = &self.ingestion_job_id {
            lines.push(format!("Uploaded files: {}", self.uploaded_files));
            lines.push(format!("Ingestion job: {}", job));
        }
        lines.push(format!("Elapsed: {:.1}s", self.elapsed.as_secs_f64()));
        lines
    }
}

fn require(value: &str, what: &str) -> Result<(), ProvisionError> {
    if value.is_empty() {
        return Err(ProvisionError::Precondition(format!("{} is empty", what)));
    }
    Ok(())
}

/// Runs deployments against one control plane.
pub struct Orchestrator {
    ctx: Arc<DeploymentContext>,
    adapters: Adapters,
}

impl Orchestrator {
    pub fn new(ctx: Arc<DeploymentContext>, plane: &ControlPlane) -> Self {
        let adapters = Adapters::new(ctx.clone(), plane);
        Self { ctx, adapters }
    }

    pub fn names(&self) -> &ResourceNames {
        &self.ctx.names
    }

    fn enter(&self, stage: DeployStage) {
        info!(stage = %stage, "Entering stage");
    }

    /// Deploy or update the whole stack.
    pub async fn deploy(&self, plan: &DeploymentPlan) -> Result<DeploymentReport, DeployError> {
        let started = Instant::now();
        let names = &self.ctx.names;
        let a = &self.adapters;

        let collaborators = plan.selection.collaborators();
        if collaborators.is_empty() {
            return Err(ProvisionError::Precondition(
                "no collaborators enabled; at least one is required".to_string(),
            ))
            .at(DeployStage::IamRoles);
        }
        for c in &collaborators {
            validate_functions(&c.functions).at(DeployStage::ComputeFunctions)?;
        }
        let package = DeploymentPackage::build(&plan.package).at(DeployStage::ComputeFunctions)?;
        info!(
            region = self.ctx.region(),
            account = self.ctx.account_id(),
            collaborators = collaborators.len(),
            "Starting deployment"
        );

        self.enter(DeployStage::IamRoles);
        let roles = a.iam.ensure_roles().await.at(DeployStage::IamRoles)?;

        self.enter(DeployStage::Storage);
        let bucket = a.storage.ensure_bucket().await.at(DeployStage::Storage)?;

        self.enter(DeployStage::SearchCollection);
        let principals = vec![
            roles.kb_role_arn.clone(),
            roles.agent_role_arn.clone(),
            self.ctx.identity.arn.clone(),
        ];
        let collection = async {
            a.search
                .ensure_collection_policies(&names.collection, &principals)
                .await?;
            let collection = a.search.ensure_collection(&names.collection).await?;
            require(&collection.arn, "collection ARN")?;
            a.iam.ensure_kb_search_access(&collection.arn).await?;
            Ok::<_, ProvisionError>(collection)
        }
        .await
        .at(DeployStage::SearchCollection)?;
        let endpoint = collection.endpoint.clone().unwrap_or_default();

        self.enter(DeployStage::SearchIndex);
        async {
            require(&endpoint, "collection endpoint")?;
            a.search
                .ensure_index(
                    &endpoint,
                    &names.vector_index,
                    self.ctx.config.embedding_dimension,
                    &FieldMapping::default(),
                )
                .await
        }
        .await
        .at(DeployStage::SearchIndex)?;

        self.enter(DeployStage::KnowledgeBase);
        let kb_spec = a.knowledge_bases.spec_for(&roles.kb_role_arn, &collection.arn);
        let kb = a
            .knowledge_bases
            .ensure_knowledge_base(&kb_spec)
            .await
            .at(DeployStage::KnowledgeBase)?;

        self.enter(DeployStage::DataSource);
        let data_source = a
            .knowledge_bases
            .ensure_data_source(&kb.id, &a.storage.bucket_arn())
            .await
            .at(DeployStage::DataSource)?;

        self.enter(DeployStage::ComputeFunctions);
        let mut functions: Vec<(&CollaboratorConfig, FunctionInfo)> = Vec::new();
        for c in &collaborators {
            let function = async {
                let spec = a.functions.spec_for(c, &roles.lambda_role_arn);
                let function = a.functions.ensure_function(&spec, &package).await?;
                require(&function.arn, "function ARN")?;
                a.functions.ensure_invoke_permission(&function.name).await?;
                Ok::<_, ProvisionError>(function)
            }
            .await
            .at(DeployStage::ComputeFunctions)?;
            functions.push((c, function));
        }

        self.enter(DeployStage::SupervisorAgent);
        let supervisor = async {
            let agent = a
                .agents
                .ensure_agent(&a.agents.supervisor_spec(&roles.agent_role_arn))
                .await?;
            a.agents.enable_supervisor_mode(&agent.id).await?;
            Ok::<_, ProvisionError>(agent)
        }
        .await
        .at(DeployStage::SupervisorAgent)?;

        self.enter(DeployStage::CollaboratorAgents);
        let mut links = Vec::new();
        for (c, function) in &functions {
            let link = self
                .setup_collaborator(c, &roles.agent_role_arn, &function.arn)
                .await
                .at(DeployStage::CollaboratorAgents)?;
            links.push(link);
        }

        self.enter(DeployStage::KbAssociation);
        a.agents
            .associate_knowledge_base(&supervisor.id, &kb.id, KB_DESCRIPTION)
            .await
            .at(DeployStage::KbAssociation)?;

        self.enter(DeployStage::CollaboratorAssociation);
        let supervisor_record = async {
            let changes = a.agents.reconcile_collaborators(&supervisor.id, &links).await?;
            if !changes.is_empty() {
                info!(
                    associated = ?changes.associated,
                    disassociated = ?changes.disassociated,
                    "Reconciled collaborators"
                );
            }
            a.agents.prepare(&supervisor.id).await?;
            a.agents.ensure_alias(&supervisor.id, SUPERVISOR_ALIAS_NAME).await
        }
        .await
        .at(DeployStage::CollaboratorAssociation)?;

        let mut uploaded_files = 0;
        let mut ingestion_job_id = None;
        if let Some(data) = &plan.upload_data {
            self.enter(DeployStage::DataUpload);
            uploaded_files = a.storage.upload(data).await.at(DeployStage::DataUpload)?;
            if uploaded_files == 0 {
                warn!(path = %data.display(), "No documents uploaded");
            }

            self.enter(DeployStage::KbSync);
            let job = a
                .knowledge_bases
                .sync(&kb.id, &data_source.id)
                .await
                .at(DeployStage::KbSync)?;
            ingestion_job_id = Some(job.job_id);
        }

        let report = DeploymentReport {
            supervisor: supervisor_record,
            knowledge_base_id: kb.id,
            data_source_id: data_source.id,
            bucket,
            collection_endpoint: endpoint,
            collaborators: links.into_iter().map(|l| l.name).collect(),
            uploaded_files,
            ingestion_job_id,
            elapsed: started.elapsed(),
        };
        info!(
            stage = %DeployStage::Done,
            supervisor = %report.supervisor.agent_id,
            alias = %report.supervisor.alias_id,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Deployment complete"
        );
        Ok(report)
    }

    /// Agent, action group, preparation and alias of one collaborator.
    async fn setup_collaborator(
        &self,
        collaborator: &CollaboratorConfig,
        role_arn: &str,
        function_arn: &str,
    ) -> Result<CollaboratorLink, ProvisionError> {
        let agents = &self.adapters.agents;
        let agent = agents
            .ensure_agent(&agents.collaborator_spec(collaborator, role_arn))
            .await?;
        agents
            .ensure_action_group(
                &agent.id,
                &AgentAdapter::action_group_spec(collaborator, function_arn),
            )
            .await?;
        agents.prepare(&agent.id).await?;
        let record = agents
            .ensure_alias(&agent.id, &ResourceNames::collaborator_alias(&collaborator.name))
            .await?;
        info!(
            collaborator = %collaborator.name,
            agent = %agent.id,
            alias = %record.alias_id,
            "Collaborator ready"
        );

        Ok(CollaboratorLink {
            name: collaborator.name.clone(),
            agent_id: agent.id,
            alias_arn: record.alias_arn,
            instruction: collaborator.collaboration_instruction(),
        })
    }

    /// Send a query to the deployed supervisor through its alias.
    pub async fn ask(&self, query: &str) -> Result<String, ProvisionError> {
        let agents = &self.adapters.agents;
        let supervisor = agents
            .find_by_name(&self.ctx.names.supervisor_agent)
            .await?
            .ok_or_else(|| {
                ProvisionError::Precondition(format!(
                    "supervisor {} is not deployed",
                    self.ctx.names.supervisor_agent
                ))
            })?;
        let alias = agents
            .find_alias(&supervisor.id, SUPERVISOR_ALIAS_NAME)
            .await?
            .ok_or_else(|| {
                ProvisionError::Precondition(format!(
                    "supervisor has no alias {}",
                    SUPERVISOR_ALIAS_NAME
                ))
            })?;
        agents.invoke(&supervisor.id, &alias.id, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing;
    use crate::collaborators::Domain;
    use crate::error::ApiError;
    use crate::provider::MemoryControlPlane;
    use std::collections::BTreeSet;

    fn orchestrator() -> (Arc<MemoryControlPlane>, Orchestrator) {
        let (sim, plane) = testing::plane();
        (sim, Orchestrator::new(testing::context(), &plane))
    }

    fn plan() -> DeploymentPlan {
        DeploymentPlan::new(PackageSource::Inline(b"collaborator-runtime".to_vec()))
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stage_names_match_wire_form() {
        assert_eq!(DeployStage::IamRoles.to_string(), "IAM_ROLES");
        assert_eq!(DeployStage::CollaboratorAssociation.to_string(), "COLLABORATOR_ASSOCIATION");
        assert_eq!(DeployStage::KbSync.to_string(), "KB_SYNC");
    }

    #[tokio::test]
    async fn full_deployment_creates_every_resource() {
        let (sim, orch) = orchestrator();
        let report = orch.deploy(&plan()).await.unwrap();

        assert_eq!(sim.live_functions().len(), 3);
        assert_eq!(sim.live_agents().len(), 4);
        assert_eq!(sim.live_knowledge_bases().len(), 1);
        assert_eq!(sim.live_collections().len(), 1);
        assert_eq!(sim.live_buckets().len(), 1);
        assert_eq!(sim.live_indexes().len(), 1);
        assert_eq!(
            sim.collaborator_names(&orch.names().supervisor_agent),
            set(&["weather-agent", "stock-agent", "news-agent"])
        );
        assert_eq!(report.supervisor.status, "PREPARED");
        assert!(report.ingestion_job_id.is_none());
        assert_eq!(report.collaborators.len(), 3);
    }

    #[tokio::test]
    async fn disabled_collaborator_is_left_out() {
        let (sim, orch) = orchestrator();
        let plan = plan().with_selection(Selection::all().without(Domain::News));
        orch.deploy(&plan).await.unwrap();

        assert_eq!(sim.live_functions().len(), 2);
        assert_eq!(sim.live_agents().len(), 3);
        assert_eq!(
            sim.collaborator_names(&orch.names().supervisor_agent),
            set(&["weather-agent", "stock-agent"])
        );
    }

    #[tokio::test]
    async fn narrowing_the_selection_disassociates_stale_collaborators() {
        let (sim, orch) = orchestrator();
        orch.deploy(&plan()).await.unwrap();
        orch.deploy(&plan().with_selection(Selection::all().without(Domain::Weather)))
            .await
            .unwrap();
        assert_eq!(
            sim.collaborator_names(&orch.names().supervisor_agent),
            set(&["stock-agent", "news-agent"])
        );
    }

    #[tokio::test]
    async fn zero_collaborators_fails_before_any_call() {
        let (sim, orch) = orchestrator();
        let none = Selection {
            weather: false,
            stock: false,
            news: false,
        };
        let err = orch.deploy(&plan().with_selection(none)).await.unwrap_err();
        assert!(matches!(err.source, ProvisionError::Precondition(_)));
        assert_eq!(sim.calls("create_role"), 0);
        assert_eq!(sim.calls("get_role"), 0);
    }

    #[tokio::test]
    async fn failed_run_resumes_without_recreating() {
        let (sim, orch) = orchestrator();
        sim.fail_on(
            "create_function",
            ApiError::throttled("create_function", "rate exceeded"),
        );
        let err = orch.deploy(&plan()).await.unwrap_err();
        assert_eq!(err.stage, DeployStage::ComputeFunctions);
        assert!(sim.live_agents().is_empty());

        sim.clear_faults();
        sim.reset_calls();
        orch.deploy(&plan()).await.unwrap();

        assert_eq!(sim.calls("create_role"), 0);
        assert_eq!(sim.calls("create_policy"), 0);
        assert_eq!(sim.calls("create_bucket"), 0);
        assert_eq!(sim.calls("create_search_policy"), 0);
        assert_eq!(sim.calls("create_collection"), 0);
        assert_eq!(sim.calls("create_index"), 0);
        assert_eq!(sim.calls("create_knowledge_base"), 0);
        assert_eq!(sim.calls("create_data_source"), 0);
        assert_eq!(sim.calls("create_function"), 3);
        assert_eq!(sim.live_agents().len(), 4);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let (sim, orch) = orchestrator();
        let first = orch.deploy(&plan()).await.unwrap();
        sim.reset_calls();
        let second = orch.deploy(&plan()).await.unwrap();

        assert_eq!(first.supervisor.agent_id, second.supervisor.agent_id);
        assert_eq!(first.supervisor.alias_id, second.supervisor.alias_id);
        assert_eq!(first.knowledge_base_id, second.knowledge_base_id);
        for op in ["create_agent", "create_alias", "create_function", "associate_collaborator"] {
            assert_eq!(sim.calls(op), 0, "{} was called again", op);
        }
    }

    #[tokio::test]
    async fn upload_and_sync_run_when_requested() {
        let (sim, orch) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("faq.md"), "# FAQ").unwrap();
        std::fs::write(dir.path().join("terms.txt"), "terms").unwrap();

        let report = orch.deploy(&plan().with_upload(dir.path())).await.unwrap();
        assert_eq!(report.uploaded_files, 2);
        assert!(report.ingestion_job_id.is_some());
        assert_eq!(sim.calls("start_ingestion_job"), 1);
    }

    #[tokio::test]
    async fn missing_upload_directory_fails_at_upload() {
        let (_sim, orch) = orchestrator();
        let err = orch
            .deploy(&plan().with_upload("/definitely/not/here"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, DeployStage::DataUpload);
    }

    #[tokio::test]
    async fn ask_routes_through_the_supervisor() {
        let (_sim, orch) = orchestrator();
        assert!(orch.ask("weather in Paris").await.is_err());

        orch.deploy(&plan()).await.unwrap();
        let answer = orch.ask("What is the weather in Paris").await.unwrap();
        assert!(answer.starts_with("weather-agent answered with get_current_weather"));
    }
}
