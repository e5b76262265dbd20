//! IAM roles and managed policies.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Deletion;
use crate::context::DeploymentContext;
use crate::error::{ApiError, ApiResultExt, ProvisionError};
use crate::policy::{self, documents_equal, PolicyDocument, LAMBDA_BASIC_EXECUTION_POLICY_ARN};
use crate::provider::{IamApi, RoleInfo};
use crate::wait::await_consistency;

/// ARNs of the three deployment roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleArnSet {
    pub lambda_role_arn: String,
    pub agent_role_arn: String,
    pub kb_role_arn: String,
}

#[derive(Clone)]
pub struct IamAdapter {
    ctx: Arc<DeploymentContext>,
    api: Arc<dyn IamApi>,
}

impl IamAdapter {
    pub fn new(ctx: Arc<DeploymentContext>, api: Arc<dyn IamApi>) -> Self {
        Self { ctx, api }
    }

    pub fn policy_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:policy/{}", self.ctx.account_id(), name)
    }

    pub async fn get_role(&self, name: &str) -> Result<Option<RoleInfo>, ProvisionError> {
        Ok(self.api.get_role(name).await.optional()?)
    }

    /// Create a role, or bring the trust policy of an existing one in line,
    /// and wait until it is readable.
    pub async fn ensure_role(
        &self,
        name: &str,
        trust: &PolicyDocument,
        description: &str,
    ) -> Result<RoleInfo, ProvisionError> {
        let trust_json = trust.to_json()?;

        if let Some(role) = self.get_role(name).await? {
            debug!(role = name, "Role exists, refreshing trust policy");
            self.api.update_assume_role_policy(name, &trust_json).await?;
            return Ok(role);
        }

        match self.api.create_role(name, &trust_json, description).await {
            Ok(role) => info!(role = name, arn = %role.arn, "Created role"),
            Err(e) if e.is_already_exists() => debug!(role = name, "Role appeared concurrently"),
            Err(e) => return Err(e.into()),
        }

        let api = &self.api;
        await_consistency(
            &format!("role {}", name),
            &self.ctx.polling().consistency,
            move || async move { api.get_role(name).await.optional() },
        )
        .await
    }

    /// Create a managed policy, or publish a new default version when the
    /// live document differs. Returns the policy ARN.
    pub async fn ensure_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
        description: &str,
    ) -> Result<String, ProvisionError> {
        let doc = document.to_json()?;
        let arn = self.policy_arn(name);

        match self.api.get_policy(&arn).await.optional()? {
            Some(existing) => {
                let current = self
                    .api
                    .get_policy_version(&arn, &existing.default_version_id)
                    .await?;
                if documents_equal(&current, &doc) {
                    debug!(policy = name, "Policy up to date");
                    return Ok(arn);
                }
                self.prune_versions(&arn).await?;
                let version = self.api.create_policy_version(&arn, &doc, true).await?;
                info!(policy = name, version = %version.version_id, "Published new policy version");
            }
            None => match self.api.create_policy(name, &doc, description).await {
                Ok(_) => info!(policy = name, "Created policy"),
                Err(e) if e.is_already_exists() => {
                    debug!(policy = name, "Policy appeared concurrently")
                }
                Err(e) => return Err(e.into()),
            },
        }
        Ok(arn)
    }

    async fn prune_versions(&self, arn: &str) -> Result<(), ProvisionError> {
        for version in self.api.list_policy_versions(arn).await? {
            if version.is_default {
                continue;
            }
            self.api
                .delete_policy_version(arn, &version.version_id)
                .await
                .optional()?;
            debug!(policy = arn, version = %version.version_id, "Deleted old policy version");
        }
        Ok(())
    }

    /// Attach a managed policy and wait until the attachment is listed.
    pub async fn attach(&self, role: &str, policy_arn: &str) -> Result<(), ProvisionError> {
        let attached = self.api.list_attached_role_policies(role).await?;
        if attached.iter().any(|a| a == policy_arn) {
            debug!(role, policy = policy_arn, "Policy already attached");
            return Ok(());
        }
        self.api.attach_role_policy(role, policy_arn).await?;
        info!(role, policy = policy_arn, "Attached policy");

        let api = &self.api;
        await_consistency(
            &format!("attachment of {} to {}", policy_arn, role),
            &self.ctx.polling().consistency,
            move || async move {
                let listed = api.list_attached_role_policies(role).await?;
                Ok::<_, ApiError>(listed.iter().any(|a| a == policy_arn).then_some(()))
            },
        )
        .await
    }

    /// Detach every managed policy, drop inline policies, then delete the role.
    pub async fn delete_role(&self, name: &str) -> Result<Deletion, ProvisionError> {
        let Some(attached) = self.api.list_attached_role_policies(name).await.optional()? else {
            return Ok(Deletion::NotFound);
        };
        for arn in attached {
            self.api.detach_role_policy(name, &arn).await.optional()?;
            debug!(role = name, policy = %arn, "Detached policy");
        }
        for inline in self.api.list_role_policies(name).await.optional()?.unwrap_or_default() {
            self.api.delete_role_policy(name, &inline).await.optional()?;
            debug!(role = name, policy = %inline, "Deleted inline policy");
        }
        let outcome = Deletion::from_result(self.api.delete_role(name).await)?;
        if outcome.is_deleted() {
            info!(role = name, "Deleted role");
        }
        Ok(outcome)
    }

    /// Delete a managed policy by name, pruning old versions first.
    pub async fn delete_policy(&self, name: &str) -> Result<Deletion, ProvisionError> {
        let arn = self.policy_arn(name);
        let Some(policy) = self.api.get_policy(&arn).await.optional()? else {
            return Ok(Deletion::NotFound);
        };
        if policy.attachment_count > 0 {
            warn!(
                policy = name,
                attachments = policy.attachment_count,
                "Policy is still attached elsewhere"
            );
        }
        self.prune_versions(&arn).await?;
        let outcome = Deletion::from_result(self.api.delete_policy(&arn).await)?;
        if outcome.is_deleted() {
            info!(policy = name, "Deleted policy");
        }
        Ok(outcome)
    }

    /// Create the function, agent and knowledge-base roles with their
    /// permission policies.
    ///
    /// The knowledge-base search policy needs the collection ARN and is added
    /// later by [`IamAdapter::ensure_kb_search_access`].
    pub async fn ensure_roles(&self) -> Result<RoleArnSet, ProvisionError> {
        let names = &self.ctx.names;
        let region = self.ctx.region();
        let account = self.ctx.account_id();

        let lambda = self
            .ensure_role(
                &names.lambda_role,
                &policy::lambda_trust_policy()?,
                "Execution role for collaborator functions",
            )
            .await?;
        self.attach(&names.lambda_role, LAMBDA_BASIC_EXECUTION_POLICY_ARN)
            .await?;

        let agent = self
            .ensure_role(
                &names.agent_role,
                &policy::agent_trust_policy(region, account)?,
                "Service role for supervisor and collaborator agents",
            )
            .await?;
        let agent_policy = self
            .ensure_policy(
                &names.agent_policy,
                &policy::agent_permissions_policy()?,
                "Model invocation and agent collaboration",
            )
            .await?;
        self.attach(&names.agent_role, &agent_policy).await?;

        let kb = self
            .ensure_role(
                &names.kb_role,
                &policy::kb_trust_policy(region, account)?,
                "Service role for the knowledge base",
            )
            .await?;
        let model_policy = self
            .ensure_policy(
                &names.kb_bedrock_policy,
                &policy::kb_model_policy(&self.ctx.config.embedding_model_arn())?,
                "Embedding model access for the knowledge base",
            )
            .await?;
        self.attach(&names.kb_role, &model_policy).await?;
        let storage_policy = self
            .ensure_policy(
                &names.kb_storage_policy,
                &policy::kb_storage_policy(&names.bucket, account)?,
                "Bucket read access for the knowledge base",
            )
            .await?;
        self.attach(&names.kb_role, &storage_policy).await?;

        Ok(RoleArnSet {
            lambda_role_arn: lambda.arn,
            agent_role_arn: agent.arn,
            kb_role_arn: kb.arn,
        })
    }

    /// Grant the knowledge-base role API access to the collection.
    pub async fn ensure_kb_search_access(
        &self,
        collection_arn: &str,
    ) -> Result<(), ProvisionError> {
        let names = &self.ctx.names;
        let arn = self
            .ensure_policy(
                &names.kb_search_policy,
                &policy::kb_search_policy(collection_arn)?,
                "Vector collection access for the knowledge base",
            )
            .await?;
        self.attach(&names.kb_role, &arn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing;
    use crate::provider::MemoryControlPlane;

    fn adapter() -> (Arc<MemoryControlPlane>, IamAdapter) {
        let (sim, plane) = testing::plane();
        (sim, IamAdapter::new(testing::context(), plane.iam))
    }

    #[tokio::test]
    async fn ensure_roles_is_idempotent() {
        let (sim, iam) = adapter();
        let first = iam.ensure_roles().await.unwrap();
        assert_eq!(sim.live_roles().len(), 3);
        assert_eq!(sim.live_policies().len(), 3);

        sim.reset_calls();
        let second = iam.ensure_roles().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sim.calls("create_role"), 0);
        assert_eq!(sim.calls("create_policy"), 0);
        assert_eq!(sim.calls("attach_role_policy"), 0);
        assert_eq!(sim.calls("create_policy_version"), 0);
    }

    #[tokio::test]
    async fn waits_for_new_role_to_become_visible() {
        let sim = Arc::new(
            MemoryControlPlane::new(testing::REGION, testing::ACCOUNT).with_role_visibility_lag(3),
        );
        let iam = IamAdapter::new(testing::context(), sim.clone());
        let role = iam
            .ensure_role("lagging", &policy::lambda_trust_policy().unwrap(), "")
            .await
            .unwrap();
        assert_eq!(role.name, "lagging");
        assert!(sim.calls("get_role") >= 4);
    }

    #[tokio::test]
    async fn changed_document_publishes_new_version() {
        let (sim, iam) = adapter();
        let first = policy::kb_model_policy("arn:model/a").unwrap();
        let second = policy::kb_model_policy("arn:model/b").unwrap();

        let arn = iam.ensure_policy("p", &first, "").await.unwrap();
        iam.ensure_policy("p", &second, "").await.unwrap();
        assert_eq!(sim.calls("create_policy_version"), 1);

        // Repeated drift never hits the version limit.
        for i in 0..6 {
            let doc = policy::kb_model_policy(&format!("arn:model/{}", i)).unwrap();
            iam.ensure_policy("p", &doc, "").await.unwrap();
        }
        let versions = sim.list_policy_versions(&arn).await.unwrap();
        assert!(versions.len() <= 2);
    }

    #[tokio::test]
    async fn delete_role_detaches_first_and_is_idempotent() {
        let (sim, iam) = adapter();
        iam.ensure_roles().await.unwrap();
        let role = iam.ctx.names.kb_role.clone();

        assert_eq!(iam.delete_role(&role).await.unwrap(), Deletion::Deleted);
        assert_eq!(iam.delete_role(&role).await.unwrap(), Deletion::NotFound);
        assert!(!sim.live_roles().contains(&role));

        let policy = iam.ctx.names.kb_bedrock_policy.clone();
        assert_eq!(iam.delete_policy(&policy).await.unwrap(), Deletion::Deleted);
        assert_eq!(iam.delete_policy(&policy).await.unwrap(), Deletion::NotFound);
    }
}
