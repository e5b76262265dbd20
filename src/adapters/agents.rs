//! Supervisor and collaborator agents: action groups, preparation, aliases,
//! knowledge base and collaborator associations.
//!
//! The service only routes an alias to a version cut from a prepared draft,
//! so every draft change (agent update, action group, association) is
//! followed by `prepare` and an alias update before it takes effect.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Deletion;
use crate::collaborators::{CollaboratorConfig, FunctionSchema};
use crate::context::DeploymentContext;
use crate::error::{ApiError, ApiResultExt, ProvisionError};
use crate::names::TEST_ALIAS_ID;
use crate::provider::{
    ActionGroupInfo, ActionGroupSpec, AgentApi, AgentInfo, AgentSpec, AgentSummary, AliasInfo,
    Collaboration,
};
use crate::wait::{
    wait_for_status, wait_until_deleted, StatusProbe, StatusTarget, DELETING, FAILED_STATUSES,
};

pub const SUPERVISOR_INSTRUCTION: &str =
    "You are a supervisor that intelligently routes queries to specialized agents (weather, stocks, news) based on user needs";
pub const SUPERVISOR_DESCRIPTION: &str =
    "Supervisor agent coordinating weather, stock market, and news information agents";
pub const IDLE_SESSION_TTL_SECS: u32 = 1800;
/// Retention of the supervisor's session-summary memory.
pub const SESSION_MEMORY_DAYS: u32 = 30;

/// Reported while an agent is neither creating, updating nor preparing.
const SETTLED: &str = "NOT_PREPARED|PREPARED";

/// A deployed agent and the alias callers reach it through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub agent_id: String,
    pub alias_id: String,
    pub alias_arn: String,
    pub status: String,
}

/// A collaborator the supervisor should delegate to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorLink {
    pub name: String,
    pub agent_id: String,
    pub alias_arn: String,
    pub instruction: String,
}

/// Names touched by a collaborator reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorChanges {
    pub associated: Vec<String>,
    pub disassociated: Vec<String>,
}

impl CollaboratorChanges {
    pub fn is_empty(&self) -> bool {
        self.associated.is_empty() && self.disassociated.is_empty()
    }
}

fn drifted(current: &AgentInfo, spec: &AgentSpec) -> bool {
    current.role_arn != spec.role_arn
        || current.foundation_model != spec.foundation_model
        || current.instruction != spec.instruction
        || current.collaboration != spec.collaboration
        || current.memory_days != spec.memory_days
}

fn reasons(failures: &[String]) -> Option<String> {
    (!failures.is_empty()).then(|| failures.join("; "))
}

/// Function lists compare equal regardless of function or parameter order.
fn same_functions(live: &[FunctionSchema], desired: &[FunctionSchema]) -> bool {
    fn normalized(functions: &[FunctionSchema]) -> Vec<FunctionSchema> {
        let mut functions = functions.to_vec();
        for f in &mut functions {
            f.parameters.sort_by(|a, b| a.name.cmp(&b.name));
        }
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }
    normalized(live) == normalized(desired)
}

#[derive(Clone)]
pub struct AgentAdapter {
    ctx: Arc<DeploymentContext>,
    api: Arc<dyn AgentApi>,
}

impl AgentAdapter {
    pub fn new(ctx: Arc<DeploymentContext>, api: Arc<dyn AgentApi>) -> Self {
        Self { ctx, api }
    }

    pub fn supervisor_spec(&self, role_arn: &str) -> AgentSpec {
        AgentSpec {
            name: self.ctx.names.supervisor_agent.clone(),
            description: SUPERVISOR_DESCRIPTION.to_string(),
            role_arn: role_arn.to_string(),
            foundation_model: self.ctx.config.foundation_model.clone(),
            instruction: SUPERVISOR_INSTRUCTION.to_string(),
            idle_session_ttl_secs: IDLE_SESSION_TTL_SECS,
            collaboration: Collaboration::SupervisorRouter,
            memory_days: Some(SESSION_MEMORY_DAYS),
        }
    }

    pub fn collaborator_spec(
        &self,
        collaborator: &CollaboratorConfig,
        role_arn: &str,
    ) -> AgentSpec {
        AgentSpec {
            name: self.ctx.names.collaborator_agent(&collaborator.name),
            description: collaborator.description.clone(),
            role_arn: role_arn.to_string(),
            foundation_model: self.ctx.config.foundation_model.clone(),
            instruction: collaborator.instruction.clone(),
            idle_session_ttl_secs: IDLE_SESSION_TTL_SECS,
            collaboration: Collaboration::Disabled,
            memory_days: None,
        }
    }

    pub fn action_group_spec(
        collaborator: &CollaboratorConfig,
        function_arn: &str,
    ) -> ActionGroupSpec {
        ActionGroupSpec {
            name: collaborator.action_group_name.clone(),
            description: collaborator.action_group_description.clone(),
            function_arn: function_arn.to_string(),
            functions: collaborator.functions.clone(),
        }
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<AgentSummary>, ProvisionError> {
        Ok(self
            .api
            .list_agents()
            .await?
            .into_iter()
            .find(|a| a.name == name))
    }

    /// Agents whose name starts with `prefix`.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<AgentSummary>, ProvisionError> {
        Ok(self
            .api
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.name.starts_with(prefix))
            .collect())
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentInfo>, ProvisionError> {
        Ok(self.api.get_agent(agent_id).await.optional()?)
    }

    /// Create the agent, or update it when its configuration drifted, and
    /// wait until no creation or update is in flight.
    pub async fn ensure_agent(&self, spec: &AgentSpec) -> Result<AgentInfo, ProvisionError> {
        let id = match self.find_by_name(&spec.name).await? {
            Some(existing) => {
                self.wait_settled(&existing.id).await?;
                let current = self.api.get_agent(&existing.id).await?;
                if drifted(&current, spec) {
                    self.api.update_agent(&existing.id, spec).await?;
                    info!(agent = %spec.name, id = %existing.id, "Updated agent");
                } else {
                    debug!(agent = %spec.name, id = %existing.id, "Agent up to date");
                }
                existing.id
            }
            None => match self.api.create_agent(spec).await {
                Ok(created) => {
                    info!(agent = %spec.name, id = %created.id, "Created agent");
                    created.id
                }
                Err(e) if e.is_conflict() || e.is_already_exists() => self
                    .find_by_name(&spec.name)
                    .await?
                    .map(|a| a.id)
                    .ok_or_else(|| ProvisionError::from(e))?,
                Err(e) => return Err(e.into()),
            },
        };
        if id.is_empty() {
            return Err(ProvisionError::Precondition(format!(
                "agent {} has no id",
                spec.name
            )));
        }

        self.wait_settled(&id).await?;
        Ok(self.api.get_agent(&id).await?)
    }

    /// Switch an agent to supervisor routing with session-summary memory,
    /// unless it already is one. Returns whether an update was made.
    pub async fn enable_supervisor_mode(&self, agent_id: &str) -> Result<bool, ProvisionError> {
        let current = self.api.get_agent(agent_id).await?;
        if current.collaboration == Collaboration::SupervisorRouter && current.memory_days.is_some()
        {
            debug!(agent = agent_id, "Supervisor mode already enabled");
            return Ok(false);
        }
        let spec = AgentSpec {
            name: current.name.clone(),
            description: SUPERVISOR_DESCRIPTION.to_string(),
            role_arn: current.role_arn.clone(),
            foundation_model: current.foundation_model.clone(),
            instruction: current.instruction.clone(),
            idle_session_ttl_secs: IDLE_SESSION_TTL_SECS,
            collaboration: Collaboration::SupervisorRouter,
            memory_days: Some(current.memory_days.unwrap_or(SESSION_MEMORY_DAYS)),
        };
        self.api.update_agent(agent_id, &spec).await?;
        info!(agent = agent_id, "Enabled supervisor mode");
        self.wait_settled(agent_id).await?;
        Ok(true)
    }

    async fn wait_settled(&self, agent_id: &str) -> Result<(), ProvisionError> {
        let api = &self.api;
        wait_for_status(
            StatusTarget {
                resource: "agent",
                id: agent_id,
                target: SETTLED,
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().agent,
            move || async move {
                let a = api.get_agent(agent_id).await?;
                let status = match a.status.as_str() {
                    "NOT_PREPARED" | "PREPARED" => SETTLED.to_string(),
                    other => other.to_string(),
                };
                Ok::<_, ApiError>(StatusProbe::new(status).with_reason(reasons(&a.failure_reasons)))
            },
        )
        .await
    }

    /// Create the action group, or update it when executor or schema differ.
    pub async fn ensure_action_group(
        &self,
        agent_id: &str,
        spec: &ActionGroupSpec,
    ) -> Result<ActionGroupInfo, ProvisionError> {
        let existing = self
            .api
            .list_action_groups(agent_id)
            .await?
            .into_iter()
            .find(|g| g.name == spec.name);

        match existing {
            Some(group)
                if group.function_arn == spec.function_arn
                    && same_functions(&group.functions, &spec.functions) =>
            {
                debug!(agent = agent_id, action_group = %spec.name, "Action group up to date");
                Ok(group)
            }
            Some(group) => {
                let updated = self
                    .api
                    .update_action_group(agent_id, &group.id, spec)
                    .await?;
                info!(agent = agent_id, action_group = %spec.name, "Updated action group");
                Ok(updated)
            }
            None => {
                let created = self.api.create_action_group(agent_id, spec).await?;
                info!(
                    agent = agent_id,
                    action_group = %spec.name,
                    id = %created.id,
                    "Created action group"
                );
                Ok(created)
            }
        }
    }

    /// Prepare the working draft and wait for `PREPARED`.
    pub async fn prepare(&self, agent_id: &str) -> Result<(), ProvisionError> {
        self.wait_settled(agent_id).await?;
        let status = self.api.prepare_agent(agent_id).await?;
        debug!(agent = agent_id, status = %status, "Preparing agent");

        let api = &self.api;
        wait_for_status(
            StatusTarget {
                resource: "agent",
                id: agent_id,
                target: "PREPARED",
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().agent,
            move || async move {
                let a = api.get_agent(agent_id).await?;
                let reason = reasons(&a.failure_reasons);
                Ok::<_, ApiError>(StatusProbe::new(a.status).with_reason(reason))
            },
        )
        .await?;
        info!(agent = agent_id, "Agent prepared");
        Ok(())
    }

    /// Create the alias, or re-point an existing one at a version cut from
    /// the prepared draft, and wait for `PREPARED`. The agent must have been
    /// prepared first.
    pub async fn ensure_alias(
        &self,
        agent_id: &str,
        alias_name: &str,
    ) -> Result<AgentRecord, ProvisionError> {
        let alias_id = match self.find_alias(agent_id, alias_name).await? {
            Some(alias) => {
                let updated = self.api.update_alias(agent_id, &alias.id, alias_name).await?;
                info!(
                    agent = agent_id,
                    alias = alias_name,
                    version = updated.routing_version.as_deref().unwrap_or("-"),
                    "Updated alias"
                );
                alias.id
            }
            None => {
                let created = self
                    .api
                    .create_alias(agent_id, alias_name, &format!("Alias {}", alias_name))
                    .await?;
                info!(agent = agent_id, alias = alias_name, id = %created.id, "Created alias");
                created.id
            }
        };

        let alias = self.wait_alias(agent_id, &alias_id).await?;
        if alias.arn.is_empty() {
            return Err(ProvisionError::Precondition(format!(
                "alias {} of agent {} has no ARN",
                alias_name, agent_id
            )));
        }
        Ok(AgentRecord {
            agent_id: agent_id.to_string(),
            alias_id: alias.id,
            alias_arn: alias.arn,
            status: alias.status,
        })
    }

    /// A named alias of the agent, never the built-in test alias.
    pub async fn find_alias(
        &self,
        agent_id: &str,
        alias_name: &str,
    ) -> Result<Option<AliasInfo>, ProvisionError> {
        Ok(self
            .api
            .list_aliases(agent_id)
            .await?
            .into_iter()
            .find(|a| a.name == alias_name && a.id != TEST_ALIAS_ID))
    }

    async fn wait_alias(
        &self,
        agent_id: &str,
        alias_id: &str,
    ) -> Result<AliasInfo, ProvisionError> {
        let api = &self.api;
        wait_for_status(
            StatusTarget {
                resource: "agent alias",
                id: alias_id,
                target: "PREPARED",
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().alias,
            move || async move {
                let a = api.get_alias(agent_id, alias_id).await?;
                Ok::<_, ApiError>(StatusProbe::new(a.status))
            },
        )
        .await?;
        Ok(self.api.get_alias(agent_id, alias_id).await?)
    }

    /// Associate a knowledge base with the agent's draft. Returns whether
    /// an association was added.
    pub async fn associate_knowledge_base(
        &self,
        agent_id: &str,
        kb_id: &str,
        description: &str,
    ) -> Result<bool, ProvisionError> {
        let current = self.api.list_agent_knowledge_bases(agent_id).await?;
        if current.iter().any(|k| k == kb_id) {
            debug!(agent = agent_id, knowledge_base = kb_id, "Knowledge base already associated");
            return Ok(false);
        }
        match self
            .api
            .associate_knowledge_base(agent_id, kb_id, description)
            .await
        {
            Ok(()) => {
                info!(agent = agent_id, knowledge_base = kb_id, "Associated knowledge base");
                Ok(true)
            }
            Err(e) if e.is_conflict() || e.is_already_exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Make the supervisor's collaborators exactly `desired`.
    ///
    /// Associations whose name is no longer wanted, or whose alias changed,
    /// are removed first. Each remaining collaborator must be prepared before
    /// it is associated.
    pub async fn reconcile_collaborators(
        &self,
        supervisor_id: &str,
        desired: &[CollaboratorLink],
    ) -> Result<CollaboratorChanges, ProvisionError> {
        let mut changes = CollaboratorChanges::default();
        let current = self.api.list_collaborators(supervisor_id).await?;

        let mut kept = BTreeSet::new();
        for existing in current {
            let wanted = desired
                .iter()
                .any(|d| d.name == existing.name && d.alias_arn == existing.alias_arn);
            if wanted {
                kept.insert(existing.name);
                continue;
            }
            let outcome = Deletion::from_result(
                self.api
                    .disassociate_collaborator(supervisor_id, &existing.id)
                    .await,
            )?;
            if outcome.is_deleted() {
                info!(
                    supervisor = supervisor_id,
                    collaborator = %existing.name,
                    "Disassociated collaborator"
                );
                changes.disassociated.push(existing.name);
            }
        }

        for link in desired.iter().filter(|d| !kept.contains(&d.name)) {
            self.wait_prepared(&link.agent_id).await?;
            match self
                .api
                .associate_collaborator(
                    supervisor_id,
                    &link.name,
                    &link.alias_arn,
                    &link.instruction,
                )
                .await
            {
                Ok(_) => {
                    info!(
                        supervisor = supervisor_id,
                        collaborator = %link.name,
                        "Associated collaborator"
                    );
                    changes.associated.push(link.name.clone());
                }
                Err(e) if e.is_conflict() || e.is_already_exists() => {
                    debug!(collaborator = %link.name, "Collaborator already associated")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(changes)
    }

    async fn wait_prepared(&self, agent_id: &str) -> Result<(), ProvisionError> {
        let api = &self.api;
        wait_for_status(
            StatusTarget {
                resource: "agent",
                id: agent_id,
                target: "PREPARED",
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().agent,
            move || async move {
                let a = api.get_agent(agent_id).await?;
                let reason = reasons(&a.failure_reasons);
                Ok::<_, ApiError>(StatusProbe::new(a.status).with_reason(reason))
            },
        )
        .await
    }

    /// Names of the supervisor's current collaborators.
    pub async fn collaborator_names(
        &self,
        supervisor_id: &str,
    ) -> Result<BTreeSet<String>, ProvisionError> {
        Ok(self
            .api
            .list_collaborators(supervisor_id)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    /// Delete every alias except the built-in test alias, then the agent,
    /// and wait until it is gone. An agent already `DELETING` is only waited
    /// on.
    pub async fn delete(&self, agent_id: &str) -> Result<Deletion, ProvisionError> {
        let Some(agent) = self.get(agent_id).await? else {
            return Ok(Deletion::NotFound);
        };
        let outcome = if agent.status == DELETING {
            debug!(agent = agent_id, "Agent deletion already in progress");
            Deletion::NotFound
        } else {
            let aliases = self.api.list_aliases(agent_id).await.optional()?;
            let aliases = aliases.unwrap_or_default();
            for alias in aliases.into_iter().filter(|a| a.id != TEST_ALIAS_ID) {
                let removed = self.api.delete_alias(agent_id, &alias.id).await;
                if Deletion::from_result(removed)?.is_deleted() {
                    debug!(agent = agent_id, alias = %alias.name, "Deleted alias");
                }
            }
            let outcome = Deletion::from_result(self.api.delete_agent(agent_id).await)?;
            if !outcome.is_deleted() {
                warn!(agent = agent_id, "Agent disappeared before deletion");
            }
            outcome
        };

        let api = &self.api;
        wait_until_deleted("agent", agent_id, &self.ctx.polling().agent, move || async move {
            Ok::<_, ApiError>(api.get_agent(agent_id).await.optional()?.is_some())
        })
        .await?;
        if outcome.is_deleted() {
            info!(agent = agent_id, name = %agent.name, "Deleted agent");
        }
        Ok(outcome)
    }

    /// Send one prompt through an alias in a fresh session.
    pub async fn invoke(
        &self,
        agent_id: &str,
        alias_id: &str,
        input: &str,
    ) -> Result<String, ProvisionError> {
        let session_id = Uuid::new_v4().to_string();
        debug!(agent = agent_id, alias = alias_id, session = %session_id, "Invoking agent");
        Ok(self
            .api
            .invoke_agent(agent_id, alias_id, &session_id, input)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{testing, FunctionAdapter, IamAdapter};
    use crate::collaborators::{collaborator, Domain};
    use crate::provider::MemoryControlPlane;

    const ROLE: &str = "arn:aws:iam::123456789012:role/agent";

    fn adapter() -> (Arc<MemoryControlPlane>, AgentAdapter) {
        let (sim, plane) = testing::plane();
        (sim, AgentAdapter::new(testing::context(), plane.agents))
    }

    fn plain_spec(name: &str) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            description: String::new(),
            role_arn: ROLE.to_string(),
            foundation_model: "amazon.nova-pro-v1:0".to_string(),
            instruction: format!("{} handles requests in its own domain", name),
            idle_session_ttl_secs: IDLE_SESSION_TTL_SECS,
            collaboration: Collaboration::Disabled,
            memory_days: None,
        }
    }

    #[test]
    fn function_order_does_not_count_as_drift() {
        let functions = collaborator(Domain::Weather).functions;
        let mut shuffled = functions.clone();
        shuffled.reverse();
        for f in &mut shuffled {
            f.parameters.reverse();
        }
        assert!(same_functions(&shuffled, &functions));

        shuffled[0].description.push_str(" (changed)");
        assert!(!same_functions(&shuffled, &functions));
    }

    /// A prepared agent with a routable alias.
    async fn aliased(agents: &AgentAdapter, name: &str) -> CollaboratorLink {
        let agent = agents.ensure_agent(&plain_spec(name)).await.unwrap();
        agents.prepare(&agent.id).await.unwrap();
        let record = agents.ensure_alias(&agent.id, &format!("{}-alias", name)).await.unwrap();
        CollaboratorLink {
            name: name.to_string(),
            agent_id: agent.id,
            alias_arn: record.alias_arn,
            instruction: format!("{} handles delegated tasks from supervisor", name),
        }
    }

    #[tokio::test]
    async fn ensure_agent_creates_once_and_updates_on_drift() {
        let (sim, agents) = adapter();
        let spec = plain_spec("alpha");
        let created = agents.ensure_agent(&spec).await.unwrap();
        assert_eq!(created.status, "NOT_PREPARED");

        let again = agents.ensure_agent(&spec).await.unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(sim.calls("create_agent"), 1);
        assert_eq!(sim.calls("update_agent"), 0);

        let mut changed = spec.clone();
        changed.instruction = "new instruction".to_string();
        let updated = agents.ensure_agent(&changed).await.unwrap();
        assert_eq!(updated.instruction, "new instruction");
        assert_eq!(sim.calls("update_agent"), 1);
    }

    #[tokio::test]
    async fn supervisor_mode_is_enabled_once() {
        let (sim, agents) = adapter();
        let agent = agents.ensure_agent(&plain_spec("boss")).await.unwrap();

        assert!(agents.enable_supervisor_mode(&agent.id).await.unwrap());
        assert!(!agents.enable_supervisor_mode(&agent.id).await.unwrap());
        assert_eq!(sim.calls("update_agent"), 1);

        let info = agents.get(&agent.id).await.unwrap().unwrap();
        assert_eq!(info.collaboration, Collaboration::SupervisorRouter);
        assert_eq!(info.memory_days, Some(SESSION_MEMORY_DAYS));
    }

    #[tokio::test]
    async fn alias_is_created_then_repointed() {
        let (sim, agents) = adapter();
        let agent = agents.ensure_agent(&plain_spec("alpha")).await.unwrap();
        agents.prepare(&agent.id).await.unwrap();

        let first = agents.ensure_alias(&agent.id, "alpha-alias").await.unwrap();
        assert_eq!(first.status, "PREPARED");
        assert!(first.alias_arn.ends_with(&first.alias_id));

        agents.prepare(&agent.id).await.unwrap();
        let second = agents.ensure_alias(&agent.id, "alpha-alias").await.unwrap();
        assert_eq!(second.alias_id, first.alias_id);
        assert_eq!(sim.calls("create_alias"), 1);
        assert_eq!(sim.calls("update_alias"), 1);
    }

    #[tokio::test]
    async fn alias_on_unprepared_agent_is_rejected() {
        let (_sim, agents) = adapter();
        let agent = agents.ensure_agent(&plain_spec("alpha")).await.unwrap();
        assert!(agents.ensure_alias(&agent.id, "alpha-alias").await.is_err());
    }

    #[tokio::test]
    async fn action_group_is_created_then_left_alone() {
        let (sim, plane) = testing::plane();
        let ctx = testing::context();
        let roles = IamAdapter::new(ctx.clone(), plane.iam.clone())
            .ensure_roles()
            .await
            .unwrap();
        let functions = FunctionAdapter::new(ctx.clone(), plane.functions.clone());
        let agents = AgentAdapter::new(ctx, plane.agents);

        let weather = collaborator(Domain::Weather);
        let package = crate::package::DeploymentPackage::build(
            &crate::package::PackageSource::Inline(b"runtime".to_vec()),
        )
        .unwrap();
        let function = functions
            .ensure_function(&functions.spec_for(&weather, &roles.lambda_role_arn), &package)
            .await
            .unwrap();

        let agent = agents
            .ensure_agent(&agents.collaborator_spec(&weather, &roles.agent_role_arn))
            .await
            .unwrap();
        let spec = AgentAdapter::action_group_spec(&weather, &function.arn);
        agents.ensure_action_group(&agent.id, &spec).await.unwrap();
        agents.ensure_action_group(&agent.id, &spec).await.unwrap();
        assert_eq!(sim.calls("create_action_group"), 1);
        assert_eq!(sim.calls("update_action_group"), 0);

        let mut fewer = spec.clone();
        fewer.functions.truncate(1);
        let updated = agents.ensure_action_group(&agent.id, &fewer).await.unwrap();
        assert_eq!(updated.functions.len(), 1);
        assert_eq!(sim.calls("update_action_group"), 1);
    }

    #[tokio::test]
    async fn collaborators_are_reconciled_by_set_difference() {
        let (sim, agents) = adapter();
        let supervisor = agents.ensure_agent(&agents.supervisor_spec(ROLE)).await.unwrap();

        let mut links = Vec::new();
        for name in ["a", "b", "c", "d"] {
            links.push(aliased(&agents, name).await);
        }

        let first = agents
            .reconcile_collaborators(&supervisor.id, &links[..3])
            .await
            .unwrap();
        assert_eq!(first.associated, vec!["a", "b", "c"]);
        assert!(first.disassociated.is_empty());

        sim.reset_calls();
        let second = agents
            .reconcile_collaborators(&supervisor.id, &links[1..])
            .await
            .unwrap();
        assert_eq!(second.disassociated, vec!["a"]);
        assert_eq!(second.associated, vec!["d"]);
        assert_eq!(sim.calls("associate_collaborator"), 1);
        assert_eq!(sim.calls("disassociate_collaborator"), 1);

        let names = agents.collaborator_names(&supervisor.id).await.unwrap();
        let expected: BTreeSet<String> = ["b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected);

        let third = agents
            .reconcile_collaborators(&supervisor.id, &links[1..])
            .await
            .unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn knowledge_base_association_requires_existing_base() {
        let (_sim, agents) = adapter();
        let agent = agents.ensure_agent(&plain_spec("alpha")).await.unwrap();
        assert!(agents
            .associate_knowledge_base(&agent.id, "MISSING", "docs")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_removes_aliases_and_is_idempotent() {
        let (sim, agents) = adapter();
        let link = aliased(&agents, "alpha").await;

        assert_eq!(agents.delete(&link.agent_id).await.unwrap(), Deletion::Deleted);
        assert_eq!(agents.delete(&link.agent_id).await.unwrap(), Deletion::NotFound);
        assert_eq!(sim.calls("delete_alias"), 1);
        assert!(sim.live_agents().is_empty());
    }

    #[tokio::test]
    async fn invoke_uses_a_fresh_session() {
        let (_sim, agents) = adapter();
        let link = aliased(&agents, "alpha").await;
        let aliases = agents.api.list_aliases(&link.agent_id).await.unwrap();
        let alias = aliases.iter().find(|a| a.name == "alpha-alias").unwrap();

        let answer = agents.invoke(&link.agent_id, &alias.id, "hello").await.unwrap();
        assert!(!answer.is_empty());
        let again = agents.invoke(&link.agent_id, &alias.id, "hello").await.unwrap();
        assert_eq!(answer, again);
    }
}
