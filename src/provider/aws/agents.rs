use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_bedrockagent::types::{
    ActionGroupExecutor, AgentCollaboration, AgentDescriptor, Function,
    FunctionSchema as WireSchema, KnowledgeBaseState, MemoryConfiguration, MemoryType,
    ParameterDetail, RelayConversationHistory, Type,
};
use aws_sdk_bedrockagentruntime::types::ResponseStream;

use super::{api_error, invalid, missing, AwsControlPlane, DRAFT_VERSION};
use crate::collaborators::{FunctionSchema, ParameterSpec, ParameterType};
use crate::error::ApiError;
use crate::provider::{
    ActionGroupInfo, ActionGroupSpec, AgentApi, AgentInfo, AgentSpec, AgentSummary, AliasInfo,
    Collaboration, CollaboratorInfo,
};

fn collaboration_from(mode: Option<&AgentCollaboration>) -> Collaboration {
    match mode.map(|m| m.as_str()) {
        Some("SUPERVISOR") => Collaboration::Supervisor,
        Some("SUPERVISOR_ROUTER") => Collaboration::SupervisorRouter,
        _ => Collaboration::Disabled,
    }
}

fn parameter_type(kind: &Type) -> ParameterType {
    match kind.as_str() {
        "integer" => ParameterType::Integer,
        "number" => ParameterType::Number,
        "boolean" => ParameterType::Boolean,
        "array" => ParameterType::Array,
        _ => ParameterType::String,
    }
}

fn memory_configuration(
    op: &str,
    days: Option<u32>,
) -> Result<Option<MemoryConfiguration>, ApiError> {
    days.map(|days| {
        MemoryConfiguration::builder()
            .enabled_memory_types(MemoryType::SessionSummary)
            .storage_days(days as i32)
            .build()
            .map_err(|e| invalid(op, e))
    })
    .transpose()
}

fn wire_functions(op: &str, functions: &[FunctionSchema]) -> Result<WireSchema, ApiError> {
    let mut wire = Vec::with_capacity(functions.len());
    for function in functions {
        let mut parameters = HashMap::new();
        for p in &function.parameters {
            let detail = ParameterDetail::builder()
                .description(&p.description)
                .r#type(Type::from(p.kind.as_str()))
                .required(p.required)
                .build()
                .map_err(|e| invalid(op, e))?;
            parameters.insert(p.name.clone(), detail);
        }
        wire.push(
            Function::builder()
                .name(&function.name)
                .description(&function.description)
                .set_parameters(Some(parameters))
                .build()
                .map_err(|e| invalid(op, e))?,
        );
    }
    Ok(WireSchema::Functions(wire))
}

fn schema_functions(schema: Option<&WireSchema>) -> Vec<FunctionSchema> {
    let Some(WireSchema::Functions(functions)) = schema else {
        return Vec::new();
    };
    functions
        .iter()
        .map(|f| {
            let mut parameters: Vec<ParameterSpec> = f
                .parameters()
                .map(|params| {
                    params
                        .iter()
                        .map(|(name, detail)| ParameterSpec {
                            name: name.clone(),
                            description: detail.description().unwrap_or_default().to_string(),
                            kind: parameter_type(detail.r#type()),
                            required: detail.required().unwrap_or(false),
                        })
                        .collect()
                })
                .unwrap_or_default();
            // The wire form is a map; keep comparisons order-independent.
            parameters.sort_by(|a, b| a.name.cmp(&b.name));
            FunctionSchema {
                name: f.name().to_string(),
                description: f.description().unwrap_or_default().to_string(),
                parameters,
            }
        })
        .collect()
}

fn alias_info(alias: &aws_sdk_bedrockagent::types::AgentAlias) -> AliasInfo {
    AliasInfo {
        id: alias.agent_alias_id().to_string(),
        name: alias.agent_alias_name().to_string(),
        arn: alias.agent_alias_arn().to_string(),
        status: alias.agent_alias_status().as_str().to_string(),
        routing_version: alias
            .routing_configuration()
            .first()
            .and_then(|r| r.agent_version())
            .map(str::to_string),
    }
}

impl AwsControlPlane {
    async fn get_action_group(
        &self,
        agent_id: &str,
        action_group_id: &str,
    ) -> Result<ActionGroupInfo, ApiError> {
        let op = "get_agent_action_group";
        let out = self
            .bedrock_agent
            .get_agent_action_group()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .action_group_id(action_group_id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let group = out
            .agent_action_group()
            .ok_or_else(|| missing(op, "action group"))?;
        let function_arn = match group.action_group_executor() {
            Some(ActionGroupExecutor::Lambda(arn)) => arn.clone(),
            _ => String::new(),
        };
        Ok(ActionGroupInfo {
            id: group.action_group_id().to_string(),
            name: group.action_group_name().to_string(),
            function_arn,
            functions: schema_functions(group.function_schema()),
        })
    }
}

#[async_trait]
impl AgentApi for AwsControlPlane {
    async fn list_agents(&self) -> Result<Vec<AgentSummary>, ApiError> {
        let mut agents = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .bedrock_agent
                .list_agents()
                .set_next_token(token.take())
                .send()
                .await
                .map_err(|e| api_error("list_agents", e))?;
            agents.extend(out.agent_summaries().iter().map(|a| AgentSummary {
                id: a.agent_id().to_string(),
                name: a.agent_name().to_string(),
                status: a.agent_status().as_str().to_string(),
            }));
            match out.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => return Ok(agents),
            }
        }
    }

    async fn get_agent(&self, id: &str) -> Result<AgentInfo, ApiError> {
        let op = "get_agent";
        let out = self
            .bedrock_agent
            .get_agent()
            .agent_id(id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let agent = out.agent().ok_or_else(|| missing(op, "agent"))?;
        Ok(AgentInfo {
            id: agent.agent_id().to_string(),
            name: agent.agent_name().to_string(),
            arn: agent.agent_arn().to_string(),
            status: agent.agent_status().as_str().to_string(),
            role_arn: agent.agent_resource_role_arn().to_string(),
            foundation_model: agent.foundation_model().unwrap_or_default().to_string(),
            instruction: agent.instruction().unwrap_or_default().to_string(),
            collaboration: collaboration_from(agent.agent_collaboration()),
            memory_days: agent
                .memory_configuration()
                .and_then(|m| m.storage_days())
                .map(|d| d.max(0) as u32),
            failure_reasons: agent.failure_reasons().to_vec(),
        })
    }

    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentInfo, ApiError> {
        let op = "create_agent";
        let out = self
            .bedrock_agent
            .create_agent()
            .agent_name(&spec.name)
            .description(&spec.description)
            .agent_resource_role_arn(&spec.role_arn)
            .foundation_model(&spec.foundation_model)
            .instruction(&spec.instruction)
            .idle_session_ttl_in_seconds(spec.idle_session_ttl_secs as i32)
            .agent_collaboration(AgentCollaboration::from(spec.collaboration.as_str()))
            .set_memory_configuration(memory_configuration(op, spec.memory_days)?)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let id = out
            .agent()
            .map(|a| a.agent_id().to_string())
            .ok_or_else(|| missing(op, "agent"))?;
        self.get_agent(&id).await
    }

    async fn update_agent(&self, id: &str, spec: &AgentSpec) -> Result<AgentInfo, ApiError> {
        let op = "update_agent";
        self.bedrock_agent
            .update_agent()
            .agent_id(id)
            .agent_name(&spec.name)
            .description(&spec.description)
            .agent_resource_role_arn(&spec.role_arn)
            .foundation_model(&spec.foundation_model)
            .instruction(&spec.instruction)
            .idle_session_ttl_in_seconds(spec.idle_session_ttl_secs as i32)
            .agent_collaboration(AgentCollaboration::from(spec.collaboration.as_str()))
            .set_memory_configuration(memory_configuration(op, spec.memory_days)?)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        self.get_agent(id).await
    }

    async fn delete_agent(&self, id: &str) -> Result<(), ApiError> {
        self.bedrock_agent
            .delete_agent()
            .agent_id(id)
            .skip_resource_in_use_check(false)
            .send()
            .await
            .map_err(|e| api_error("delete_agent", e))?;
        Ok(())
    }

    async fn prepare_agent(&self, id: &str) -> Result<String, ApiError> {
        let out = self
            .bedrock_agent
            .prepare_agent()
            .agent_id(id)
            .send()
            .await
            .map_err(|e| api_error("prepare_agent", e))?;
        Ok(out.agent_status().as_str().to_string())
    }

    async fn list_action_groups(&self, agent_id: &str) -> Result<Vec<ActionGroupInfo>, ApiError> {
        let out = self
            .bedrock_agent
            .list_agent_action_groups()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .send()
            .await
            .map_err(|e| api_error("list_agent_action_groups", e))?;
        let mut groups = Vec::new();
        for summary in out.action_group_summaries() {
            groups.push(self.get_action_group(agent_id, summary.action_group_id()).await?);
        }
        Ok(groups)
    }

    async fn create_action_group(
        &self,
        agent_id: &str,
        spec: &ActionGroupSpec,
    ) -> Result<ActionGroupInfo, ApiError> {
        let op = "create_agent_action_group";
        let out = self
            .bedrock_agent
            .create_agent_action_group()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .action_group_name(&spec.name)
            .description(&spec.description)
            .action_group_executor(ActionGroupExecutor::Lambda(spec.function_arn.clone()))
            .function_schema(wire_functions(op, &spec.functions)?)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let id = out
            .agent_action_group()
            .map(|g| g.action_group_id().to_string())
            .ok_or_else(|| missing(op, "action group"))?;
        self.get_action_group(agent_id, &id).await
    }

    async fn update_action_group(
        &self,
        agent_id: &str,
        action_group_id: &str,
        spec: &ActionGroupSpec,
    ) -> Result<ActionGroupInfo, ApiError> {
        let op = "update_agent_action_group";
        self.bedrock_agent
            .update_agent_action_group()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .action_group_id(action_group_id)
            .action_group_name(&spec.name)
            .description(&spec.description)
            .action_group_executor(ActionGroupExecutor::Lambda(spec.function_arn.clone()))
            .function_schema(wire_functions(op, &spec.functions)?)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        self.get_action_group(agent_id, action_group_id).await
    }

    async fn list_aliases(&self, agent_id: &str) -> Result<Vec<AliasInfo>, ApiError> {
        let out = self
            .bedrock_agent
            .list_agent_aliases()
            .agent_id(agent_id)
            .send()
            .await
            .map_err(|e| api_error("list_agent_aliases", e))?;
        // Summaries carry no ARN.
        let mut aliases = Vec::new();
        for summary in out.agent_alias_summaries() {
            aliases.push(self.get_alias(agent_id, summary.agent_alias_id()).await?);
        }
        Ok(aliases)
    }

    async fn get_alias(&self, agent_id: &str, alias_id: &str) -> Result<AliasInfo, ApiError> {
        let op = "get_agent_alias";
        let out = self
            .bedrock_agent
            .get_agent_alias()
            .agent_id(agent_id)
            .agent_alias_id(alias_id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        out.agent_alias()
            .map(alias_info)
            .ok_or_else(|| missing(op, "alias"))
    }

    async fn create_alias(
        &self,
        agent_id: &str,
        name: &str,
        description: &str,
    ) -> Result<AliasInfo, ApiError> {
        let op = "create_agent_alias";
        let out = self
            .bedrock_agent
            .create_agent_alias()
            .agent_id(agent_id)
            .agent_alias_name(name)
            .description(description)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        out.agent_alias()
            .map(alias_info)
            .ok_or_else(|| missing(op, "alias"))
    }

    async fn update_alias(
        &self,
        agent_id: &str,
        alias_id: &str,
        name: &str,
    ) -> Result<AliasInfo, ApiError> {
        let op = "update_agent_alias";
        let out = self
            .bedrock_agent
            .update_agent_alias()
            .agent_id(agent_id)
            .agent_alias_id(alias_id)
            .agent_alias_name(name)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        out.agent_alias()
            .map(alias_info)
            .ok_or_else(|| missing(op, "alias"))
    }

    async fn delete_alias(&self, agent_id: &str, alias_id: &str) -> Result<(), ApiError> {
        self.bedrock_agent
            .delete_agent_alias()
            .agent_id(agent_id)
            .agent_alias_id(alias_id)
            .send()
            .await
            .map_err(|e| api_error("delete_agent_alias", e))?;
        Ok(())
    }

    async fn list_agent_knowledge_bases(&self, agent_id: &str) -> Result<Vec<String>, ApiError> {
        let out = self
            .bedrock_agent
            .list_agent_knowledge_bases()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .send()
            .await
            .map_err(|e| api_error("list_agent_knowledge_bases", e))?;
        Ok(out
            .agent_knowledge_base_summaries()
            .iter()
            .map(|kb| kb.knowledge_base_id().to_string())
            .collect())
    }

    async fn associate_knowledge_base(
        &self,
        agent_id: &str,
        kb_id: &str,
        description: &str,
    ) -> Result<(), ApiError> {
        self.bedrock_agent
            .associate_agent_knowledge_base()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .knowledge_base_id(kb_id)
            .description(description)
            .knowledge_base_state(KnowledgeBaseState::Enabled)
            .send()
            .await
            .map_err(|e| api_error("associate_agent_knowledge_base", e))?;
        Ok(())
    }

    async fn list_collaborators(&self, agent_id: &str) -> Result<Vec<CollaboratorInfo>, ApiError> {
        let out = self
            .bedrock_agent
            .list_agent_collaborators()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .send()
            .await
            .map_err(|e| api_error("list_agent_collaborators", e))?;
        Ok(out
            .agent_collaborator_summaries()
            .iter()
            .map(|c| CollaboratorInfo {
                id: c.collaborator_id().to_string(),
                name: c.collaborator_name().to_string(),
                alias_arn: c
                    .agent_descriptor()
                    .and_then(|d| d.alias_arn())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn associate_collaborator(
        &self,
        agent_id: &str,
        name: &str,
        alias_arn: &str,
        instruction: &str,
    ) -> Result<CollaboratorInfo, ApiError> {
        let op = "associate_agent_collaborator";
        let out = self
            .bedrock_agent
            .associate_agent_collaborator()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .agent_descriptor(AgentDescriptor::builder().alias_arn(alias_arn).build())
            .collaborator_name(name)
            .collaboration_instruction(instruction)
            .relay_conversation_history(RelayConversationHistory::ToCollaborator)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let collaborator = out
            .agent_collaborator()
            .ok_or_else(|| missing(op, "collaborator"))?;
        Ok(CollaboratorInfo {
            id: collaborator.collaborator_id().to_string(),
            name: name.to_string(),
            alias_arn: alias_arn.to_string(),
        })
    }

    async fn disassociate_collaborator(
        &self,
        agent_id: &str,
        collaborator_id: &str,
    ) -> Result<(), ApiError> {
        self.bedrock_agent
            .disassociate_agent_collaborator()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .collaborator_id(collaborator_id)
            .send()
            .await
            .map_err(|e| api_error("disassociate_agent_collaborator", e))?;
        Ok(())
    }

    async fn invoke_agent(
        &self,
        agent_id: &str,
        alias_id: &str,
        session_id: &str,
        input: &str,
    ) -> Result<String, ApiError> {
        let op = "invoke_agent";
        let mut out = self
            .agent_runtime
            .invoke_agent()
            .agent_id(agent_id)
            .agent_alias_id(alias_id)
            .session_id(session_id)
            .input_text(input)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;

        let mut completion = String::new();
        while let Some(event) = out.completion.recv().await.map_err(|e| api_error(op, e))? {
            if let ResponseStream::Chunk(part) = event {
                if let Some(bytes) = part.bytes() {
                    completion.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                }
            }
        }
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_schemas_survive_the_wire_form() {
        let functions = vec![FunctionSchema::new("get_forecast", "Forecast")
            .required("location", ParameterType::String, "City")
            .optional("days", ParameterType::Integer, "Days ahead")];
        let wire = wire_functions("test", &functions).unwrap();
        let back = schema_functions(Some(&wire));

        assert_eq!(back.len(), 1);
        assert_eq!(back[0].name, "get_forecast");
        let days = back[0].parameters.iter().find(|p| p.name == "days").unwrap();
        assert_eq!(days.kind, ParameterType::Integer);
        assert!(!days.required);
    }

    #[test]
    fn unknown_collaboration_mode_reads_as_disabled() {
        assert_eq!(
            collaboration_from(Some(&AgentCollaboration::from("SUPERVISOR_ROUTER"))),
            Collaboration::SupervisorRouter
        );
        assert_eq!(collaboration_from(None), Collaboration::Disabled);
    }
}
