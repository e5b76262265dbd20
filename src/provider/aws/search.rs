use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_opensearchserverless::types::{AccessPolicyType, CollectionType, SecurityPolicyType};
use aws_sigv4::http_request::{
    sign, PayloadChecksumKind, SignableBody, SignableRequest, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_types::{Document, Number};
use serde_json::Value;
use tracing::debug;

use super::{api_error, missing, AwsControlPlane};
use crate::error::{ApiError, ApiErrorKind};
use crate::policy::CollectionPolicyKind;
use crate::provider::{CollectionInfo, SearchApi, SearchPolicy};

/// Signing name of the serverless search data plane.
const SIGNING_SERVICE: &str = "aoss";

fn security_type(kind: CollectionPolicyKind) -> Option<SecurityPolicyType> {
    match kind {
        CollectionPolicyKind::Encryption => Some(SecurityPolicyType::Encryption),
        CollectionPolicyKind::Network => Some(SecurityPolicyType::Network),
        CollectionPolicyKind::Data => None,
    }
}

/// Policy bodies come back as generic documents; adapters compare JSON text.
fn document_to_json(doc: &Document) -> Value {
    match doc {
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_json(v)))
                .collect(),
        ),
        Document::Array(items) => Value::Array(items.iter().map(document_to_json).collect()),
        Document::Number(Number::PosInt(n)) => Value::from(*n),
        Document::Number(Number::NegInt(n)) => Value::from(*n),
        Document::Number(Number::Float(f)) => Value::from(*f),
        Document::String(s) => Value::String(s.clone()),
        Document::Bool(b) => Value::Bool(*b),
        Document::Null => Value::Null,
    }
}

fn policy(
    kind: CollectionPolicyKind,
    name: Option<&str>,
    version: Option<&str>,
    document: Option<&Document>,
) -> SearchPolicy {
    SearchPolicy {
        name: name.unwrap_or_default().to_string(),
        kind,
        version: version.unwrap_or_default().to_string(),
        document: document
            .map(|d| document_to_json(d).to_string())
            .unwrap_or_default(),
    }
}

fn endpoint_url(endpoint: &str, index: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.starts_with("https://") || base.starts_with("http://") {
        format!("{}/{}", base, index)
    } else {
        format!("https://{}/{}", base, index)
    }
}

impl AwsControlPlane {
    /// Send a SigV4-signed request to a collection endpoint.
    async fn signed_request(
        &self,
        op: &str,
        method: reqwest::Method,
        url: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ApiError> {
        let provider = self
            .sdk_config
            .credentials_provider()
            .ok_or_else(|| ApiError::new(ApiErrorKind::AccessDenied, op, "no credentials"))?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| ApiError::new(ApiErrorKind::AccessDenied, op, e.to_string()))?;
        let identity = credentials.into();

        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SIGNING_SERVICE)
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| ApiError::validation(op, e.to_string()))?
            .into();

        let headers = [("content-type", "application/json")];
        let signable = SignableRequest::new(
            method.as_str(),
            url,
            headers.iter().copied(),
            SignableBody::Bytes(&body),
        )
        .map_err(|e| ApiError::validation(op, e.to_string()))?;
        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| ApiError::validation(op, e.to_string()))?
            .into_parts();

        let mut request = self
            .http
            .request(method, url)
            .header("content-type", "application/json");
        for (name, value) in instructions.headers() {
            request = request.header(name, value);
        }
        request
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::network(op, e.to_string()))
    }
}

#[async_trait]
impl SearchApi for AwsControlPlane {
    async fn list_policies(
        &self,
        kind: CollectionPolicyKind,
        resource: &str,
    ) -> Result<Vec<SearchPolicy>, ApiError> {
        let names: Vec<String> = match security_type(kind) {
            Some(t) => self
                .aoss
                .list_security_policies()
                .r#type(t)
                .resource(resource)
                .send()
                .await
                .map_err(|e| api_error("list_security_policies", e))?
                .security_policy_summaries()
                .iter()
                .filter_map(|p| p.name().map(str::to_string))
                .collect(),
            None => self
                .aoss
                .list_access_policies()
                .r#type(AccessPolicyType::Data)
                .resource(resource)
                .send()
                .await
                .map_err(|e| api_error("list_access_policies", e))?
                .access_policy_summaries()
                .iter()
                .filter_map(|p| p.name().map(str::to_string))
                .collect(),
        };

        // Summaries carry no document.
        let mut policies = Vec::with_capacity(names.len());
        for name in names {
            policies.push(self.get_policy(kind, &name).await?);
        }
        Ok(policies)
    }

    async fn get_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
    ) -> Result<SearchPolicy, ApiError> {
        match security_type(kind) {
            Some(t) => {
                let op = "get_security_policy";
                let out = self
                    .aoss
                    .get_security_policy()
                    .name(name)
                    .r#type(t)
                    .send()
                    .await
                    .map_err(|e| api_error(op, e))?;
                let detail = out
                    .security_policy_detail()
                    .ok_or_else(|| ApiError::not_found(op, format!("{} policy {}", kind, name)))?;
                Ok(policy(kind, detail.name(), detail.policy_version(), detail.policy()))
            }
            None => {
                let op = "get_access_policy";
                let out = self
                    .aoss
                    .get_access_policy()
                    .name(name)
                    .r#type(AccessPolicyType::Data)
                    .send()
                    .await
                    .map_err(|e| api_error(op, e))?;
                let detail = out
                    .access_policy_detail()
                    .ok_or_else(|| ApiError::not_found(op, format!("data policy {}", name)))?;
                Ok(policy(kind, detail.name(), detail.policy_version(), detail.policy()))
            }
        }
    }

    async fn create_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
        document: &str,
        description: &str,
    ) -> Result<SearchPolicy, ApiError> {
        match security_type(kind) {
            Some(t) => {
                let op = "create_security_policy";
                let out = self
                    .aoss
                    .create_security_policy()
                    .name(name)
                    .r#type(t)
                    .policy(document)
                    .description(description)
                    .send()
                    .await
                    .map_err(|e| api_error(op, e))?;
                let detail = out
                    .security_policy_detail()
                    .ok_or_else(|| missing(op, "policy detail"))?;
                Ok(policy(kind, detail.name(), detail.policy_version(), detail.policy()))
            }
            None => {
                let op = "create_access_policy";
                let out = self
                    .aoss
                    .create_access_policy()
                    .name(name)
                    .r#type(AccessPolicyType::Data)
                    .policy(document)
                    .description(description)
                    .send()
                    .await
                    .map_err(|e| api_error(op, e))?;
                let detail = out
                    .access_policy_detail()
                    .ok_or_else(|| missing(op, "policy detail"))?;
                Ok(policy(kind, detail.name(), detail.policy_version(), detail.policy()))
            }
        }
    }

    async fn update_policy(
        &self,
        kind: CollectionPolicyKind,
        name: &str,
        version: &str,
        document: &str,
    ) -> Result<SearchPolicy, ApiError> {
        match security_type(kind) {
            Some(t) => {
                let op = "update_security_policy";
                let out = self
                    .aoss
                    .update_security_policy()
                    .name(name)
                    .r#type(t)
                    .policy_version(version)
                    .policy(document)
                    .send()
                    .await
                    .map_err(|e| api_error(op, e))?;
                let detail = out
                    .security_policy_detail()
                    .ok_or_else(|| missing(op, "policy detail"))?;
                Ok(policy(kind, detail.name(), detail.policy_version(), detail.policy()))
            }
            None => {
                let op = "update_access_policy";
                let out = self
                    .aoss
                    .update_access_policy()
                    .name(name)
                    .r#type(AccessPolicyType::Data)
                    .policy_version(version)
                    .policy(document)
                    .send()
                    .await
                    .map_err(|e| api_error(op, e))?;
                let detail = out
                    .access_policy_detail()
                    .ok_or_else(|| missing(op, "policy detail"))?;
                Ok(policy(kind, detail.name(), detail.policy_version(), detail.policy()))
            }
        }
    }

    async fn delete_policy(&self, kind: CollectionPolicyKind, name: &str) -> Result<(), ApiError> {
        match security_type(kind) {
            Some(t) => {
                self.aoss
                    .delete_security_policy()
                    .name(name)
                    .r#type(t)
                    .send()
                    .await
                    .map_err(|e| api_error("delete_security_policy", e))?;
            }
            None => {
                self.aoss
                    .delete_access_policy()
                    .name(name)
                    .r#type(AccessPolicyType::Data)
                    .send()
                    .await
                    .map_err(|e| api_error("delete_access_policy", e))?;
            }
        }
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> Result<CollectionInfo, ApiError> {
        let op = "batch_get_collection";
        let out = self
            .aoss
            .batch_get_collection()
            .names(name)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let detail = out
            .collection_details()
            .iter()
            .find(|c| c.name() == Some(name))
            .ok_or_else(|| ApiError::not_found(op, format!("collection {}", name)))?;
        Ok(CollectionInfo {
            id: detail.id().unwrap_or_default().to_string(),
            name: name.to_string(),
            arn: detail.arn().unwrap_or_default().to_string(),
            status: detail
                .status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            endpoint: detail.collection_endpoint().map(str::to_string),
        })
    }

    async fn create_collection(
        &self,
        name: &str,
        description: &str,
    ) -> Result<CollectionInfo, ApiError> {
        let op = "create_collection";
        let out = self
            .aoss
            .create_collection()
            .name(name)
            .r#type(CollectionType::Vectorsearch)
            .description(description)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let detail = out
            .create_collection_detail()
            .ok_or_else(|| missing(op, "collection detail"))?;
        Ok(CollectionInfo {
            id: detail.id().unwrap_or_default().to_string(),
            name: name.to_string(),
            arn: detail.arn().unwrap_or_default().to_string(),
            status: detail
                .status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            endpoint: None,
        })
    }

    async fn delete_collection(&self, id: &str) -> Result<(), ApiError> {
        self.aoss
            .delete_collection()
            .id(id)
            .send()
            .await
            .map_err(|e| api_error("delete_collection", e))?;
        Ok(())
    }

    async fn index_exists(&self, endpoint: &str, index: &str) -> Result<bool, ApiError> {
        let op = "index_exists";
        let response = self
            .signed_request(op, reqwest::Method::HEAD, &endpoint_url(endpoint, index), Vec::new())
            .await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            403 => Err(ApiError::new(
                ApiErrorKind::AccessDenied,
                op,
                "data access policy does not cover the caller yet",
            )),
            status => Err(ApiError::service(op, format!("unexpected status {}", status))),
        }
    }

    async fn create_index(
        &self,
        endpoint: &str,
        index: &str,
        body: &Value,
    ) -> Result<(), ApiError> {
        let op = "create_index";
        let payload =
            serde_json::to_vec(body).map_err(|e| ApiError::validation(op, e.to_string()))?;
        let response = self
            .signed_request(op, reqwest::Method::PUT, &endpoint_url(endpoint, index), payload)
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(index, status = status.as_u16(), "Create index response");
        if status.is_success() {
            return Ok(());
        }
        if text.contains("resource_already_exists_exception") {
            return Err(ApiError::already_exists(op, format!("index {} already exists", index)));
        }
        match status.as_u16() {
            400 => Err(ApiError::validation(op, text)),
            403 => Err(ApiError::new(ApiErrorKind::AccessDenied, op, text)),
            429 => Err(ApiError::throttled(op, text)),
            _ => Err(ApiError::service(op, text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn documents_convert_to_json() {
        let doc = Document::Object(HashMap::from([
            (
                "Rules".to_string(),
                Document::Array(vec![Document::String("collection/x".to_string())]),
            ),
            ("AWSOwnedKey".to_string(), Document::Bool(true)),
            ("Count".to_string(), Document::Number(Number::PosInt(2))),
        ]));
        assert_eq!(
            document_to_json(&doc),
            serde_json::json!({"Rules": ["collection/x"], "AWSOwnedKey": true, "Count": 2})
        );
    }

    #[test]
    fn index_urls_accept_bare_hosts() {
        assert_eq!(
            endpoint_url("https://abc.aoss.amazonaws.com/", "idx"),
            "https://abc.aoss.amazonaws.com/idx"
        );
        assert_eq!(
            endpoint_url("abc.aoss.amazonaws.com", "idx"),
            "https://abc.aoss.amazonaws.com/idx"
        );
    }
}
