//! Deterministic resource naming.
//!
//! Every resource name is a pure function of the base names, the region and
//! the account id, so a re-run finds exactly the resources a previous run
//! created.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::NamingInputs;
use crate::error::ProvisionError;

/// Reserved alias id every agent has for its working draft.
pub const TEST_ALIAS_ID: &str = "TSTALIASID";

/// Alias name of the supervisor agent.
pub const SUPERVISOR_ALIAS_NAME: &str = "multi-agent-alias";

/// Key prefix of knowledge documents in the bucket; also the data source's
/// inclusion prefix.
pub const KNOWLEDGE_PREFIX: &str = "knowledge-base/";

/// All names derived for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    pub suffix: String,
    pub base_name: String,
    pub kb_base_name: String,

    pub supervisor_agent: String,
    pub lambda_role: String,
    pub agent_role: String,
    pub agent_policy: String,

    pub kb_role: String,
    pub kb_bedrock_policy: String,
    pub kb_search_policy: String,
    pub kb_storage_policy: String,

    pub knowledge_base: String,
    pub data_source: String,
    pub collection: String,
    pub vector_index: String,

    pub bucket: String,
}

impl ResourceNames {
    /// Derive every name from the base inputs and the caller's identity.
    pub fn derive(inputs: &NamingInputs, region: &str, account_id: &str) -> Self {
        let suffix = format!("{}-{}", region, account_id);
        let base = &inputs.base_name;
        let agent_name = format!("{}-multiagent", base);
        let kb_base = &inputs.kb_base_name;
        let knowledge_base = format!("{}-{}", kb_base, suffix);

        Self {
            supervisor_agent: format!("{}-supervisor", agent_name),
            lambda_role: format!("{}-lambda-role-{}", agent_name, suffix),
            agent_role: format!("{}-agent-role-{}", base, suffix),
            agent_policy: format!("{}-bedrock-allow-{}", agent_name, suffix),

            kb_role: format!("{}-execution-role-{}", kb_base, suffix),
            kb_bedrock_policy: format!("{}-bedrock-allow-{}", kb_base, suffix),
            kb_search_policy: format!("{}-aoss-allow-{}", kb_base, suffix),
            kb_storage_policy: format!("{}-s3-allow-{}", kb_base, suffix),

            data_source: format!("{}-s3-ds", knowledge_base),
            knowledge_base,
            collection: format!("{}-collection", kb_base),
            vector_index: format!("{}-index", kb_base),

            bucket: format!("{}-bucket-{}", inputs.storage_base_name, suffix),

            suffix,
            base_name: base.clone(),
            kb_base_name: kb_base.clone(),
        }
    }

    /// Agent name of a collaborator.
    pub fn collaborator_agent(&self, collaborator: &str) -> String {
        format!("{}-{}", self.base_name, collaborator)
    }

    /// Function name backing a collaborator domain.
    pub fn function(&self, domain: &str) -> String {
        format!("{}-{}-ops", self.base_name, domain)
    }

    /// Alias name of a collaborator agent.
    pub fn collaborator_alias(collaborator: &str) -> String {
        format!("{}-alias", collaborator)
    }

    /// IAM role names in teardown order.
    pub fn roles(&self) -> [&str; 3] {
        [&self.agent_role, &self.lambda_role, &self.kb_role]
    }

    /// Managed policy names in teardown order.
    pub fn policies(&self) -> [&str; 4] {
        [
            &self.agent_policy,
            &self.kb_bedrock_policy,
            &self.kb_search_policy,
            &self.kb_storage_policy,
        ]
    }

    /// Check every name against the platform's naming limits.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        for role in self.roles() {
            check_iam_name("role", role)?;
        }
        for policy in self.policies() {
            check_iam_name("policy", policy)?;
        }
        check_pattern("bucket", &self.bucket, bucket_pattern())?;
        check_pattern("collection", &self.collection, collection_pattern())?;
        check_pattern("index", &self.vector_index, collection_pattern_long())?;
        for agent in [&self.supervisor_agent, &self.knowledge_base, &self.data_source] {
            check_pattern("agent resource", agent, agent_pattern())?;
        }
        Ok(())
    }
}

fn check_iam_name(kind: &str, name: &str) -> Result<(), ProvisionError> {
    static IAM: OnceLock<Regex> = OnceLock::new();
    let re = IAM.get_or_init(|| Regex::new(r"^[\w+=,.@-]{1,64}$").expect("valid regex"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ProvisionError::InvalidDefinition(format!(
            "IAM {} name '{}' must be 1-64 characters of [A-Za-z0-9+=,.@_-]",
            kind, name
        )))
    }
}

fn check_pattern(kind: &str, name: &str, re: &Regex) -> Result<(), ProvisionError> {
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ProvisionError::InvalidDefinition(format!(
            "{} name '{}' does not match {}",
            kind,
            name,
            re.as_str()
        )))
    }
}

fn bucket_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid regex"))
}

fn collection_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{2,31}$").expect("valid regex"))
}

fn collection_pattern_long() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_-]{0,254}$").expect("valid regex"))
}

fn agent_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-zA-Z_-]{1,100}$").expect("valid regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ResourceNames {
        ResourceNames::derive(&NamingInputs::default(), "us-east-1", "123456789012")
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(names(), names());
    }

    #[test]
    fn derived_names_match_scheme() {
        let n = names();
        assert_eq!(n.suffix, "us-east-1-123456789012");
        assert_eq!(n.supervisor_agent, "multi-agent-ai-multiagent-supervisor");
        assert_eq!(n.agent_role, "multi-agent-ai-agent-role-us-east-1-123456789012");
        assert_eq!(n.knowledge_base, "bedrock-agent-kb-us-east-1-123456789012");
        assert_eq!(n.data_source, "bedrock-agent-kb-us-east-1-123456789012-s3-ds");
        assert_eq!(n.collection, "bedrock-agent-kb-collection");
        assert_eq!(n.bucket, "bedrock-agent-bucket-us-east-1-123456789012");
        assert_eq!(n.collaborator_agent("weather-agent"), "multi-agent-ai-weather-agent");
        assert_eq!(n.function("weather"), "multi-agent-ai-weather-ops");
        assert_eq!(ResourceNames::collaborator_alias("news-agent"), "news-agent-alias");
    }

    #[test]
    fn different_identity_yields_different_names() {
        let other = ResourceNames::derive(&NamingInputs::default(), "eu-west-1", "123456789012");
        assert_ne!(names().bucket, other.bucket);
        assert_ne!(names().agent_role, other.agent_role);
    }

    #[test]
    fn default_names_validate() {
        names().validate().unwrap();
    }

    #[test]
    fn overlong_role_name_is_rejected() {
        let inputs = NamingInputs {
            base_name: "a".repeat(40),
            ..NamingInputs::default()
        };
        let n = ResourceNames::derive(&inputs, "us-east-1", "123456789012");
        assert!(matches!(
            n.validate(),
            Err(ProvisionError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn uppercase_bucket_is_rejected() {
        let inputs = NamingInputs {
            storage_base_name: "Agent".to_string(),
            ..NamingInputs::default()
        };
        let n = ResourceNames::derive(&inputs, "us-east-1", "123456789012");
        assert!(n.validate().is_err());
    }
}
