//! Collaborator functions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::Deletion;
use crate::collaborators::{ActionRequest, ActionResponse, CollaboratorConfig, DOMAIN_ENV};
use crate::context::DeploymentContext;
use crate::error::{ApiError, ApiResultExt, ProvisionError};
use crate::package::{DeploymentPackage, BOOTSTRAP, CUSTOM_RUNTIME};
use crate::provider::{FunctionApi, FunctionInfo, FunctionSpec, InvokePermission};
use crate::wait::{wait_for_status, StatusProbe, StatusTarget};

pub const DEFAULT_TIMEOUT_SECS: u32 = 300;
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// Service principal that calls action-group functions.
pub const AGENT_SERVICE_PRINCIPAL: &str = "bedrock.amazonaws.com";
const INVOKE_STATEMENT_ID: &str = "allow-agent-invoke";
const INACTIVE: &str = "Inactive";

#[derive(Clone)]
pub struct FunctionAdapter {
    ctx: Arc<DeploymentContext>,
    api: Arc<dyn FunctionApi>,
}

impl FunctionAdapter {
    pub fn new(ctx: Arc<DeploymentContext>, api: Arc<dyn FunctionApi>) -> Self {
        Self { ctx, api }
    }

    /// Desired configuration of the function serving a collaborator.
    pub fn spec_for(&self, collaborator: &CollaboratorConfig, role_arn: &str) -> FunctionSpec {
        let mut environment = BTreeMap::new();
        environment.insert(DOMAIN_ENV.to_string(), collaborator.domain.to_string());
        environment.insert("RUST_LOG".to_string(), "collaborator_runtime=info".to_string());

        FunctionSpec {
            name: self.ctx.names.function(collaborator.domain.as_str()),
            description: format!("Action handler for {}", collaborator.name),
            role_arn: role_arn.to_string(),
            runtime: CUSTOM_RUNTIME.to_string(),
            handler: BOOTSTRAP.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            memory_mb: DEFAULT_MEMORY_MB,
            environment,
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<FunctionInfo>, ProvisionError> {
        Ok(self.api.get_function(name).await.optional()?)
    }

    /// Create the function, or update code and configuration where they
    /// differ, then wait until it is active with no update in flight.
    pub async fn ensure_function(
        &self,
        spec: &FunctionSpec,
        package: &DeploymentPackage,
    ) -> Result<FunctionInfo, ProvisionError> {
        let existing = match self.get(&spec.name).await? {
            Some(existing) => Some(existing),
            None => match self.api.create_function(spec, package.bytes().to_vec()).await {
                Ok(created) => {
                    info!(function = %spec.name, arn = %created.arn, "Created function");
                    None
                }
                Err(e) if e.is_already_exists() => {
                    debug!(function = %spec.name, "Function appeared concurrently");
                    self.get(&spec.name).await?
                }
                Err(e) => return Err(e.into()),
            },
        };

        if let Some(existing) = existing {
            // Idle functions go inactive and only come back after an update.
            let inactive = existing.state == INACTIVE;
            if !inactive {
                self.wait_ready(&spec.name).await?;
            }
            let code_changed = existing.code_sha256 != package.code_sha256();
            if code_changed {
                self.api
                    .update_function_code(&spec.name, package.bytes().to_vec())
                    .await?;
                info!(function = %spec.name, "Updated function code");
                self.wait_ready(&spec.name).await?;
            } else {
                debug!(function = %spec.name, "Function code unchanged");
            }
            if existing.config_drifts_from(spec) {
                self.api.update_function_configuration(spec).await?;
                info!(function = %spec.name, "Updated function configuration");
            } else if inactive && !code_changed {
                self.api.update_function_configuration(spec).await?;
                info!(function = %spec.name, "Reactivating inactive function");
            }
        }

        self.wait_ready(&spec.name).await?;
        self.get(&spec.name).await?.ok_or_else(|| {
            ProvisionError::Precondition(format!("function {} vanished after creation", spec.name))
        })
    }

    /// Wait for state `Active` with no update in progress. `Inactive` is not
    /// terminal; the function is restored by the next update.
    pub async fn wait_ready(&self, name: &str) -> Result<(), ProvisionError> {
        let api = &self.api;
        wait_for_status(
            StatusTarget {
                resource: "function",
                id: name,
                target: "Active",
                failed: &["Failed"],
            },
            &self.ctx.polling().function,
            move || async move {
                let f = api.get_function(name).await?;
                let status = match (f.state.as_str(), f.last_update_status.as_str()) {
                    ("Active", "InProgress") => "Updating".to_string(),
                    ("Active", "Failed") => "Failed".to_string(),
                    (state, _) => state.to_string(),
                };
                Ok::<_, ApiError>(StatusProbe::new(status))
            },
        )
        .await
    }

    /// Let the agent service invoke the function. The statement is removed
    /// and re-added so its source scope always matches this deployment.
    pub async fn ensure_invoke_permission(&self, name: &str) -> Result<(), ProvisionError> {
        let permission = InvokePermission {
            statement_id: INVOKE_STATEMENT_ID.to_string(),
            principal: AGENT_SERVICE_PRINCIPAL.to_string(),
            source_arn: Some(format!(
                "arn:aws:bedrock:{}:{}:agent/*",
                self.ctx.region(),
                self.ctx.account_id()
            )),
        };
        self.api
            .remove_permission(name, INVOKE_STATEMENT_ID)
            .await
            .optional()?;
        match self.api.add_permission(name, &permission).await {
            Ok(()) => debug!(function = name, "Granted agent invoke permission"),
            Err(e) if e.is_conflict() || e.is_already_exists() => {
                debug!(function = name, "Invoke permission already present")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Functions whose name starts with `prefix`.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<FunctionInfo>, ProvisionError> {
        Ok(self
            .api
            .list_functions()
            .await?
            .into_iter()
            .filter(|f| f.name.starts_with(prefix))
            .collect())
    }

    pub async fn delete(&self, name: &str) -> Result<Deletion, ProvisionError> {
        let outcome = Deletion::from_result(self.api.delete_function(name).await)?;
        if outcome.is_deleted() {
            info!(function = name, "Deleted function");
        }
        Ok(outcome)
    }

    /// Invoke a function with an action request.
    pub async fn invoke(
        &self,
        name: &str,
        request: &ActionRequest,
    ) -> Result<ActionResponse, ProvisionError> {
        let payload = serde_json::to_vec(request)?;
        let out = self.api.invoke(name, payload).await?;
        Ok(serde_json::from_slice(&out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing;
    use crate::adapters::IamAdapter;
    use crate::collaborators::{collaborator, Domain, Parameter};
    use crate::package::PackageSource;
    use crate::provider::{ControlPlane, MemoryControlPlane};

    async fn setup() -> (Arc<MemoryControlPlane>, FunctionAdapter, String) {
        let (sim, plane): (Arc<MemoryControlPlane>, ControlPlane) = testing::plane();
        let ctx = testing::context();
        let roles = IamAdapter::new(ctx.clone(), plane.iam.clone())
            .ensure_roles()
            .await
            .unwrap();
        (
            sim,
            FunctionAdapter::new(ctx, plane.functions),
            roles.lambda_role_arn,
        )
    }

    fn package(bytes: &[u8]) -> DeploymentPackage {
        DeploymentPackage::build(&PackageSource::Inline(bytes.to_vec())).unwrap()
    }

    #[tokio::test]
    async fn create_then_rerun_skips_unchanged_code() {
        let (sim, functions, role) = setup().await;
        let spec = functions.spec_for(&collaborator(Domain::Weather), &role);
        let pkg = package(b"runtime-v1");

        let info = functions.ensure_function(&spec, &pkg).await.unwrap();
        assert_eq!(info.state, "Active");
        assert_eq!(info.code_sha256, pkg.code_sha256());

        sim.reset_calls();
        functions.ensure_function(&spec, &pkg).await.unwrap();
        assert_eq!(sim.calls("create_function"), 0);
        assert_eq!(sim.calls("update_function_code"), 0);
        assert_eq!(sim.calls("update_function_configuration"), 0);
    }

    #[tokio::test]
    async fn changed_code_and_config_are_updated() {
        let (sim, functions, role) = setup().await;
        let mut spec = functions.spec_for(&collaborator(Domain::Stock), &role);
        functions.ensure_function(&spec, &package(b"v1")).await.unwrap();

        spec.memory_mb = 1024;
        let info = functions.ensure_function(&spec, &package(b"v2")).await.unwrap();
        assert_eq!(sim.calls("update_function_code"), 1);
        assert_eq!(sim.calls("update_function_configuration"), 1);
        assert_eq!(info.memory_mb, 1024);
        assert_eq!(info.code_sha256, package(b"v2").code_sha256());
    }

    #[tokio::test]
    async fn rerun_reactivates_an_idle_function() {
        let (sim, functions, role) = setup().await;
        let spec = functions.spec_for(&collaborator(Domain::Weather), &role);
        let pkg = package(b"runtime-v1");
        functions.ensure_function(&spec, &pkg).await.unwrap();

        sim.deactivate_function(&spec.name);
        sim.reset_calls();
        let info = functions.ensure_function(&spec, &pkg).await.unwrap();
        assert_eq!(info.state, "Active");
        assert_eq!(sim.calls("update_function_code"), 0);
        assert_eq!(sim.calls("update_function_configuration"), 1);
    }

    #[tokio::test]
    async fn code_update_reactivates_an_idle_function() {
        let (sim, functions, role) = setup().await;
        let spec = functions.spec_for(&collaborator(Domain::Weather), &role);
        functions.ensure_function(&spec, &package(b"runtime-v1")).await.unwrap();

        sim.deactivate_function(&spec.name);
        sim.reset_calls();
        let info = functions
            .ensure_function(&spec, &package(b"runtime-v2"))
            .await
            .unwrap();
        assert_eq!(info.state, "Active");
        assert_eq!(sim.calls("update_function_code"), 1);
        assert_eq!(sim.calls("update_function_configuration"), 0);
    }

    #[tokio::test]
    async fn invoke_permission_can_be_granted_twice() {
        let (_sim, functions, role) = setup().await;
        let spec = functions.spec_for(&collaborator(Domain::News), &role);
        functions.ensure_function(&spec, &package(b"v1")).await.unwrap();

        functions.ensure_invoke_permission(&spec.name).await.unwrap();
        functions.ensure_invoke_permission(&spec.name).await.unwrap();
    }

    #[tokio::test]
    async fn invoke_runs_the_domain_handler() {
        let (_sim, functions, role) = setup().await;
        let spec = functions.spec_for(&collaborator(Domain::Stock), &role);
        functions.ensure_function(&spec, &package(b"v1")).await.unwrap();

        let request = ActionRequest::new(
            "stock-actions",
            "get_company_info",
            vec![Parameter::new("symbol", "GOOGL")],
        );
        let response = functions.invoke(&spec.name, &request).await.unwrap();
        assert_eq!(response.body_json()["name"], "Alphabet Inc.");
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_listing_filters_by_prefix() {
        let (_sim, functions, role) = setup().await;
        for domain in Domain::ALL {
            let spec = functions.spec_for(&collaborator(domain), &role);
            functions.ensure_function(&spec, &package(b"v1")).await.unwrap();
        }
        let prefix = format!("{}-", functions.ctx.names.base_name);
        assert_eq!(functions.list_by_prefix(&prefix).await.unwrap().len(), 3);
        assert!(functions.list_by_prefix("other-").await.unwrap().is_empty());

        let name = functions.ctx.names.function("news");
        assert_eq!(functions.delete(&name).await.unwrap(), Deletion::Deleted);
        assert_eq!(functions.delete(&name).await.unwrap(), Deletion::NotFound);
    }
}
