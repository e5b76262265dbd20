//! Deployment context.
//!
//! Built once per process from the configuration and the caller identity the
//! control plane reports, then shared as `Arc<DeploymentContext>` with every
//! adapter. Nothing below reads the environment again.

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, PollingConfig};
use crate::error::ProvisionError;
use crate::names::ResourceNames;
use crate::provider::{CallerIdentity, IdentityApi};

#[derive(Debug, Clone)]
pub struct DeploymentContext {
    pub config: Config,
    pub identity: CallerIdentity,
    pub names: ResourceNames,
}

impl DeploymentContext {
    /// Ask the control plane who we are and derive every resource name.
    pub async fn discover(
        config: Config,
        identity_api: &dyn IdentityApi,
    ) -> Result<Arc<Self>, ProvisionError> {
        let identity = identity_api.caller_identity().await?;
        info!(
            account_id = %identity.account_id,
            region = %config.region,
            "Discovered caller identity"
        );
        Ok(Arc::new(Self::new(config, identity)?))
    }

    /// Build a context for a known identity; names are validated here so a
    /// bad base name fails before any control-plane call.
    pub fn new(config: Config, identity: CallerIdentity) -> Result<Self, ProvisionError> {
        if identity.account_id.is_empty() {
            return Err(ProvisionError::Precondition(
                "caller identity has no account id".to_string(),
            ));
        }
        let names = ResourceNames::derive(&config.naming, &config.region, &identity.account_id);
        names.validate()?;
        Ok(Self {
            config,
            identity,
            names,
        })
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn account_id(&self) -> &str {
        &self.identity.account_id
    }

    pub fn polling(&self) -> &PollingConfig {
        &self.config.polling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingInputs;
    use crate::provider::MemoryControlPlane;

    #[tokio::test]
    async fn discover_derives_names_from_identity() {
        let plane = MemoryControlPlane::new("eu-west-1", "123456789012");
        let ctx = DeploymentContext::discover(Config::local("eu-west-1"), &plane)
            .await
            .unwrap();

        assert_eq!(ctx.account_id(), "123456789012");
        assert_eq!(ctx.names.suffix, "eu-west-1-123456789012");
        assert_eq!(plane.calls("get_caller_identity"), 1);
    }

    #[test]
    fn invalid_base_name_fails_before_any_call() {
        let mut config = Config::local("us-east-1");
        config.naming = NamingInputs {
            storage_base_name: "Not_A_Bucket".to_string(),
            ..NamingInputs::default()
        };
        let identity = CallerIdentity {
            account_id: "123456789012".to_string(),
            arn: "arn:aws:iam::123456789012:user/me".to_string(),
        };
        assert!(matches!(
            DeploymentContext::new(config, identity),
            Err(ProvisionError::InvalidDefinition(_))
        ));
    }
}
