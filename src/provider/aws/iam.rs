use async_trait::async_trait;

use super::{api_error, missing, AwsControlPlane};
use crate::error::ApiError;
use crate::provider::{IamApi, ManagedPolicyInfo, PolicyVersionInfo, RoleInfo};

fn role_info(role: &aws_sdk_iam::types::Role) -> RoleInfo {
    RoleInfo {
        name: role.role_name().to_string(),
        arn: role.arn().to_string(),
    }
}

fn policy_info(
    op: &str,
    policy: Option<&aws_sdk_iam::types::Policy>,
) -> Result<ManagedPolicyInfo, ApiError> {
    let policy = policy.ok_or_else(|| missing(op, "policy"))?;
    Ok(ManagedPolicyInfo {
        name: policy.policy_name().unwrap_or_default().to_string(),
        arn: policy.arn().ok_or_else(|| missing(op, "policy arn"))?.to_string(),
        default_version_id: policy.default_version_id().unwrap_or_default().to_string(),
        attachment_count: policy.attachment_count().unwrap_or(0).max(0) as u32,
    })
}

#[async_trait]
impl IamApi for AwsControlPlane {
    async fn get_role(&self, name: &str) -> Result<RoleInfo, ApiError> {
        let op = "get_role";
        let out = self
            .iam
            .get_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        out.role().map(role_info).ok_or_else(|| missing(op, "role"))
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        description: &str,
    ) -> Result<RoleInfo, ApiError> {
        let op = "create_role";
        let out = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .description(description)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        out.role().map(role_info).ok_or_else(|| missing(op, "role"))
    }

    async fn update_assume_role_policy(
        &self,
        name: &str,
        trust_policy: &str,
    ) -> Result<(), ApiError> {
        self.iam
            .update_assume_role_policy()
            .role_name(name)
            .policy_document(trust_policy)
            .send()
            .await
            .map_err(|e| api_error("update_assume_role_policy", e))?;
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<(), ApiError> {
        self.iam
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| api_error("delete_role", e))?;
        Ok(())
    }

    async fn get_policy(&self, arn: &str) -> Result<ManagedPolicyInfo, ApiError> {
        let op = "get_policy";
        let out = self
            .iam
            .get_policy()
            .policy_arn(arn)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        policy_info(op, out.policy())
    }

    async fn get_policy_version(&self, arn: &str, version_id: &str) -> Result<String, ApiError> {
        let op = "get_policy_version";
        let out = self
            .iam
            .get_policy_version()
            .policy_arn(arn)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let encoded = out
            .policy_version()
            .and_then(|v| v.document())
            .ok_or_else(|| missing(op, "document"))?;
        // Documents come back URL-encoded.
        urlencoding::decode(encoded)
            .map(|d| d.into_owned())
            .map_err(|e| ApiError::service(op, format!("undecodable policy document: {}", e)))
    }

    async fn create_policy(
        &self,
        name: &str,
        document: &str,
        description: &str,
    ) -> Result<ManagedPolicyInfo, ApiError> {
        let op = "create_policy";
        let out = self
            .iam
            .create_policy()
            .policy_name(name)
            .policy_document(document)
            .description(description)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        policy_info(op, out.policy())
    }

    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_as_default: bool,
    ) -> Result<PolicyVersionInfo, ApiError> {
        let op = "create_policy_version";
        let out = self
            .iam
            .create_policy_version()
            .policy_arn(arn)
            .policy_document(document)
            .set_as_default(set_as_default)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let version = out.policy_version().ok_or_else(|| missing(op, "policy version"))?;
        Ok(PolicyVersionInfo {
            version_id: version.version_id().unwrap_or_default().to_string(),
            is_default: version.is_default_version(),
        })
    }

    async fn list_policy_versions(&self, arn: &str) -> Result<Vec<PolicyVersionInfo>, ApiError> {
        let out = self
            .iam
            .list_policy_versions()
            .policy_arn(arn)
            .send()
            .await
            .map_err(|e| api_error("list_policy_versions", e))?;
        Ok(out
            .versions()
            .iter()
            .map(|v| PolicyVersionInfo {
                version_id: v.version_id().unwrap_or_default().to_string(),
                is_default: v.is_default_version(),
            })
            .collect())
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), ApiError> {
        self.iam
            .delete_policy_version()
            .policy_arn(arn)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| api_error("delete_policy_version", e))?;
        Ok(())
    }

    async fn delete_policy(&self, arn: &str) -> Result<(), ApiError> {
        self.iam
            .delete_policy()
            .policy_arn(arn)
            .send()
            .await
            .map_err(|e| api_error("delete_policy", e))?;
        Ok(())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), ApiError> {
        self.iam
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| api_error("attach_role_policy", e))?;
        Ok(())
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), ApiError> {
        self.iam
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| api_error("detach_role_policy", e))?;
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> Result<Vec<String>, ApiError> {
        let out = self
            .iam
            .list_attached_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(|e| api_error("list_attached_role_policies", e))?;
        Ok(out
            .attached_policies()
            .iter()
            .filter_map(|p| p.policy_arn().map(str::to_string))
            .collect())
    }

    async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, ApiError> {
        let out = self
            .iam
            .list_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(|e| api_error("list_role_policies", e))?;
        Ok(out.policy_names().to_vec())
    }

    async fn delete_role_policy(&self, role: &str, name: &str) -> Result<(), ApiError> {
        self.iam
            .delete_role_policy()
            .role_name(role)
            .policy_name(name)
            .send()
            .await
            .map_err(|e| api_error("delete_role_policy", e))?;
        Ok(())
    }
}
