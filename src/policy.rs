//! Typed policy documents.
//!
//! IAM trust/permission policies and the search collection's encryption,
//! network and data-access policies are built as typed values and only
//! serialized to JSON at the adapter boundary. Builders validate their
//! inputs, so a malformed document fails before any control-plane call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisionError;

pub const POLICY_VERSION: &str = "2012-10-17";
pub const LAMBDA_BASIC_EXECUTION_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

/// One or many strings, serialized the way IAM accepts both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn is_empty(&self) -> bool {
        match self {
            OneOrMany::One(s) => s.is_empty(),
            OneOrMany::Many(v) => v.is_empty() || v.iter().any(|s| s.is_empty()),
        }
    }
}

impl From<&str> for OneOrMany {
    fn from(s: &str) -> Self {
        OneOrMany::One(s.to_string())
    }
}

impl From<String> for OneOrMany {
    fn from(s: String) -> Self {
        OneOrMany::One(s)
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(v: Vec<String>) -> Self {
        OneOrMany::Many(v)
    }
}

impl From<Vec<&str>> for OneOrMany {
    fn from(v: Vec<&str>) -> Self {
        OneOrMany::Many(v.into_iter().map(String::from).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrincipal {
    #[serde(rename = "Service")]
    pub service: String,
}

/// One IAM statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<ServicePrincipal>,
    pub action: OneOrMany,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

impl Statement {
    pub fn allow(action: impl Into<OneOrMany>) -> Self {
        Self {
            sid: None,
            effect: Effect::Allow,
            principal: None,
            action: action.into(),
            resource: None,
            condition: None,
        }
    }

    pub fn sid(mut self, sid: &str) -> Self {
        self.sid = Some(sid.to_string());
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.principal = Some(ServicePrincipal {
            service: service.to_string(),
        });
        self
    }

    pub fn resource(mut self, resource: impl Into<OneOrMany>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// An IAM policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// Build and validate a document from statements.
    pub fn new(statement: Vec<Statement>) -> Result<Self, ProvisionError> {
        let doc = Self {
            version: POLICY_VERSION.to_string(),
            statement,
        };
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<(), ProvisionError> {
        if self.statement.is_empty() {
            return Err(ProvisionError::InvalidDefinition(
                "policy document has no statements".to_string(),
            ));
        }
        for (i, s) in self.statement.iter().enumerate() {
            if s.action.is_empty() {
                return Err(ProvisionError::InvalidDefinition(format!(
                    "statement {} has an empty action",
                    i
                )));
            }
            // Trust policies name a principal; permission policies a resource.
            match (&s.principal, &s.resource) {
                (None, None) => {
                    return Err(ProvisionError::InvalidDefinition(format!(
                        "statement {} needs a principal or a resource",
                        i
                    )))
                }
                (_, Some(r)) if r.is_empty() => {
                    return Err(ProvisionError::InvalidDefinition(format!(
                        "statement {} has an empty resource",
                        i
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, ProvisionError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Compare two JSON policy documents ignoring formatting.
pub fn documents_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

// ==================== IAM builders ====================

/// Trust policy for the function execution role.
pub fn lambda_trust_policy() -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![Statement::allow("sts:AssumeRole").service("lambda.amazonaws.com")])
}

/// Trust policy for the agent role, scoped to agents in this account.
pub fn agent_trust_policy(
    region: &str,
    account_id: &str,
) -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![Statement::allow("sts:AssumeRole")
        .service("bedrock.amazonaws.com")
        .condition(serde_json::json!({
            "StringEquals": { "aws:SourceAccount": account_id },
            "ArnLike": { "aws:SourceArn": format!("arn:aws:bedrock:{}:{}:agent/*", region, account_id) }
        }))])
}

/// Trust policy for the knowledge-base role.
pub fn kb_trust_policy(region: &str, account_id: &str) -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![Statement::allow("sts:AssumeRole")
        .service("bedrock.amazonaws.com")
        .condition(serde_json::json!({
            "StringEquals": { "aws:SourceAccount": account_id },
            "ArnLike": {
                "aws:SourceArn": format!("arn:aws:bedrock:{}:{}:knowledge-base/*", region, account_id)
            }
        }))])
}

/// Permissions of the agent role: model invocation, collaboration and retrieval.
pub fn agent_permissions_policy() -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![
        Statement::allow(vec![
            "bedrock:InvokeModel",
            "bedrock:AssociateAgentCollaborator",
            "bedrock:InvokeAgent",
            "bedrock:GetAgent",
            "bedrock:GetAgentAlias",
            "bedrock:ListAgentAliases",
        ])
        .sid("BedrockMultiAgentCollaboration")
        .resource("*"),
        Statement::allow(vec!["bedrock:Retrieve", "bedrock:RetrieveAndGenerate"])
            .sid("BedrockKnowledgeBaseAccess")
            .resource("*"),
    ])
}

/// Knowledge-base permission to invoke the embedding model.
pub fn kb_model_policy(embedding_model_arn: &str) -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![Statement::allow("bedrock:InvokeModel").resource(embedding_model_arn)])
}

/// Knowledge-base read access to the document bucket.
pub fn kb_storage_policy(bucket: &str, account_id: &str) -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![Statement::allow(vec!["s3:GetObject", "s3:ListBucket"])
        .resource(vec![
            format!("arn:aws:s3:::{}", bucket),
            format!("arn:aws:s3:::{}/*", bucket),
        ])
        .condition(serde_json::json!({
            "StringEquals": { "aws:ResourceAccount": account_id }
        }))])
}

/// Knowledge-base API access to the vector collection.
pub fn kb_search_policy(collection_arn: &str) -> Result<PolicyDocument, ProvisionError> {
    PolicyDocument::new(vec![Statement::allow("aoss:APIAccessAll").resource(collection_arn)])
}

// ==================== Search collection policies ====================

/// Kind of policy governing a search collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionPolicyKind {
    Encryption,
    Network,
    /// Data-access policy (a separate API family on the platform)
    Data,
}

impl CollectionPolicyKind {
    pub const ALL: [CollectionPolicyKind; 3] = [
        CollectionPolicyKind::Encryption,
        CollectionPolicyKind::Network,
        CollectionPolicyKind::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionPolicyKind::Encryption => "encryption",
            CollectionPolicyKind::Network => "network",
            CollectionPolicyKind::Data => "data",
        }
    }

    /// Prefix of generated policy names (names are limited to 32 characters).
    pub fn name_prefix(&self) -> &'static str {
        match self {
            CollectionPolicyKind::Encryption => "kb-encrypt",
            CollectionPolicyKind::Network => "kb-network",
            CollectionPolicyKind::Data => "kb-access",
        }
    }
}

impl std::fmt::Display for CollectionPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CollectionRule {
    pub resource: Vec<String>,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionPolicy {
    pub rules: Vec<CollectionRule>,
    #[serde(rename = "AWSOwnedKey")]
    pub aws_owned_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkRule {
    pub rules: Vec<CollectionRule>,
    pub allow_from_public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataAccessRule {
    pub rules: Vec<CollectionRule>,
    pub principal: Vec<String>,
    pub description: String,
}

/// A rendered collection policy ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPolicy {
    pub kind: CollectionPolicyKind,
    pub document: Value,
}

impl CollectionPolicy {
    pub fn to_json(&self) -> Result<String, ProvisionError> {
        Ok(serde_json::to_string(&self.document)?)
    }
}

fn collection_resource(collection: &str) -> Result<String, ProvisionError> {
    if collection.is_empty() {
        return Err(ProvisionError::InvalidDefinition(
            "collection name is empty".to_string(),
        ));
    }
    Ok(format!("collection/{}", collection))
}

/// Encryption with a platform-owned key.
pub fn encryption_policy(collection: &str) -> Result<CollectionPolicy, ProvisionError> {
    let policy = EncryptionPolicy {
        rules: vec![CollectionRule {
            resource: vec![collection_resource(collection)?],
            resource_type: "collection".to_string(),
            permission: None,
        }],
        aws_owned_key: true,
    };
    Ok(CollectionPolicy {
        kind: CollectionPolicyKind::Encryption,
        document: serde_json::to_value(policy)?,
    })
}

/// Network access to the collection endpoint.
pub fn network_policy(collection: &str, public: bool) -> Result<CollectionPolicy, ProvisionError> {
    let policy = vec![NetworkRule {
        rules: vec![CollectionRule {
            resource: vec![collection_resource(collection)?],
            resource_type: "collection".to_string(),
            permission: None,
        }],
        allow_from_public: public,
    }];
    Ok(CollectionPolicy {
        kind: CollectionPolicyKind::Network,
        document: serde_json::to_value(policy)?,
    })
}

/// Data access for the given principals on the collection and its indexes.
pub fn data_access_policy(
    collection: &str,
    principals: &[String],
) -> Result<CollectionPolicy, ProvisionError> {
    if principals.is_empty() || principals.iter().any(|p| p.is_empty()) {
        return Err(ProvisionError::InvalidDefinition(
            "data access policy needs at least one principal".to_string(),
        ));
    }
    let policy = vec![DataAccessRule {
        rules: vec![
            CollectionRule {
                resource: vec![collection_resource(collection)?],
                resource_type: "collection".to_string(),
                permission: Some(
                    [
                        "aoss:CreateCollectionItems",
                        "aoss:DeleteCollectionItems",
                        "aoss:UpdateCollectionItems",
                        "aoss:DescribeCollectionItems",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                ),
            },
            CollectionRule {
                resource: vec![format!("index/{}/*", collection)],
                resource_type: "index".to_string(),
                permission: Some(
                    [
                        "aoss:CreateIndex",
                        "aoss:DeleteIndex",
                        "aoss:UpdateIndex",
                        "aoss:DescribeIndex",
                        "aoss:ReadDocument",
                        "aoss:WriteDocument",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                ),
            },
        ],
        principal: principals.to_vec(),
        description: format!("Data access policy for {}", collection),
    }];
    Ok(CollectionPolicy {
        kind: CollectionPolicyKind::Data,
        document: serde_json::to_value(policy)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_policy_wire_shape() {
        let doc = lambda_trust_policy().unwrap();
        let v: Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(v["Version"], POLICY_VERSION);
        assert_eq!(v["Statement"][0]["Effect"], "Allow");
        assert_eq!(v["Statement"][0]["Principal"]["Service"], "lambda.amazonaws.com");
        assert_eq!(v["Statement"][0]["Action"], "sts:AssumeRole");
        assert!(v["Statement"][0].get("Resource").is_none());
    }

    #[test]
    fn storage_policy_covers_bucket_and_objects() {
        let doc = kb_storage_policy("my-bucket", "123456789012").unwrap();
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            v["Statement"][0]["Resource"],
            serde_json::json!(["arn:aws:s3:::my-bucket", "arn:aws:s3:::my-bucket/*"])
        );
    }

    #[test]
    fn empty_resource_is_rejected_before_any_call() {
        assert!(kb_search_policy("").is_err());
        assert!(PolicyDocument::new(vec![]).is_err());
        let empty = Statement::allow(Vec::<String>::new()).resource("*");
        assert!(PolicyDocument::new(vec![empty]).is_err());
        assert!(PolicyDocument::new(vec![Statement::allow("s3:GetObject")]).is_err());
    }

    #[test]
    fn collection_policies_render_platform_shape() {
        let enc = encryption_policy("kb-collection").unwrap();
        assert_eq!(enc.document["Rules"][0]["Resource"][0], "collection/kb-collection");
        assert_eq!(enc.document["AWSOwnedKey"], true);

        let net = network_policy("kb-collection", true).unwrap();
        assert_eq!(net.document[0]["AllowFromPublic"], true);

        let data = data_access_policy("kb-collection", &["arn:role".to_string()]).unwrap();
        assert_eq!(data.document[0]["Rules"][1]["Resource"][0], "index/kb-collection/*");
        assert_eq!(data.document[0]["Principal"][0], "arn:role");
        assert!(data_access_policy("kb-collection", &[]).is_err());
    }

    #[test]
    fn documents_compare_semantically() {
        assert!(documents_equal(r#"{"a": 1, "b": [1,2]}"#, r#"{"b":[1,2],"a":1}"#));
        assert!(!documents_equal(r#"{"a": 1}"#, r#"{"a": 2}"#));
    }
}
