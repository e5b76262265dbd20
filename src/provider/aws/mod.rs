//! Cloud control plane on the official SDK clients.
//!
//! One client per service, all built from the same loaded SDK config. SDK
//! errors are classified into [`ApiError`] by their error code so the
//! adapters see the same `NotFound`/`AlreadyExists`/`Conflict` outcomes the
//! simulator produces.

mod agents;
mod functions;
mod iam;
mod knowledge_base;
mod search;
mod storage;

use std::fmt;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tracing::info;

use super::{CallerIdentity, IdentityApi};
use crate::error::{ApiError, ApiErrorKind, ProvisionError};

/// Working draft version every agent sub-resource is edited on.
const DRAFT_VERSION: &str = "DRAFT";

pub struct AwsControlPlane {
    region: String,
    sdk_config: SdkConfig,
    sts: aws_sdk_sts::Client,
    iam: aws_sdk_iam::Client,
    s3: aws_sdk_s3::Client,
    lambda: aws_sdk_lambda::Client,
    aoss: aws_sdk_opensearchserverless::Client,
    bedrock_agent: aws_sdk_bedrockagent::Client,
    agent_runtime: aws_sdk_bedrockagentruntime::Client,
    http: reqwest::Client,
}

impl AwsControlPlane {
    /// Load credentials and region settings from the environment and build
    /// every service client.
    pub async fn connect(region: &str) -> Result<Self, ProvisionError> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        if sdk_config.credentials_provider().is_none() {
            return Err(ProvisionError::Precondition(
                "no cloud credentials found in the environment".to_string(),
            ));
        }
        info!(region = %region, "Connected cloud control plane");

        Ok(Self {
            region: region.to_string(),
            sts: aws_sdk_sts::Client::new(&sdk_config),
            iam: aws_sdk_iam::Client::new(&sdk_config),
            s3: aws_sdk_s3::Client::new(&sdk_config),
            lambda: aws_sdk_lambda::Client::new(&sdk_config),
            aoss: aws_sdk_opensearchserverless::Client::new(&sdk_config),
            bedrock_agent: aws_sdk_bedrockagent::Client::new(&sdk_config),
            agent_runtime: aws_sdk_bedrockagentruntime::Client::new(&sdk_config),
            http: reqwest::Client::new(),
            sdk_config,
        })
    }
}

/// Classify an SDK error by its service error code.
///
/// Every SDK crate re-exports the same `SdkError`, so this serves all clients.
fn api_error<E, R>(operation: &str, err: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: fmt::Debug,
{
    let kind = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            ApiErrorKind::Network
        }
        _ => classify_code(err.code().unwrap_or_default()),
    };
    let message = match err.message() {
        Some(m) => m.to_string(),
        None => DisplayErrorContext(&err).to_string(),
    };
    ApiError::new(kind, operation, message)
}

fn classify_code(code: &str) -> ApiErrorKind {
    match code {
        "NoSuchEntity" | "ResourceNotFoundException" | "NoSuchBucket" | "NoSuchKey"
        | "NotFound" => ApiErrorKind::NotFound,
        "EntityAlreadyExists" | "BucketAlreadyOwnedByYou" | "BucketAlreadyExists" => {
            ApiErrorKind::AlreadyExists
        }
        "ConflictException" | "ResourceConflictException" | "DeleteConflict"
        | "ResourceInUseException" | "BucketNotEmpty" => ApiErrorKind::Conflict,
        "Throttling" | "ThrottlingException" | "TooManyRequestsException" | "SlowDown"
        | "RequestLimitExceeded" => ApiErrorKind::Throttled,
        "ValidationException" | "ValidationError" | "MalformedPolicyDocument"
        | "InvalidParameterValueException" | "InvalidInput" | "InvalidRequest"
        | "InvalidRequestContentException" | "LimitExceeded" | "ServiceQuotaExceededException" => {
            ApiErrorKind::Validation
        }
        "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" => {
            ApiErrorKind::AccessDenied
        }
        _ => ApiErrorKind::Service,
    }
}

/// A response was missing a field the call always returns.
fn missing(operation: &str, field: &str) -> ApiError {
    ApiError::service(operation, format!("response has no {}", field))
}

/// A request builder rejected its input.
fn invalid(operation: &str, err: impl fmt::Display) -> ApiError {
    ApiError::validation(operation, err.to_string())
}

#[async_trait]
impl IdentityApi for AwsControlPlane {
    async fn caller_identity(&self) -> Result<CallerIdentity, ApiError> {
        let op = "get_caller_identity";
        let out = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        Ok(CallerIdentity {
            account_id: out.account().ok_or_else(|| missing(op, "account"))?.to_string(),
            arn: out.arn().unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_classified() {
        assert_eq!(classify_code("NoSuchEntity"), ApiErrorKind::NotFound);
        assert_eq!(classify_code("ResourceNotFoundException"), ApiErrorKind::NotFound);
        assert_eq!(classify_code("EntityAlreadyExists"), ApiErrorKind::AlreadyExists);
        assert_eq!(classify_code("ConflictException"), ApiErrorKind::Conflict);
        assert_eq!(classify_code("ThrottlingException"), ApiErrorKind::Throttled);
        assert_eq!(classify_code("MalformedPolicyDocument"), ApiErrorKind::Validation);
        assert_eq!(classify_code("AccessDeniedException"), ApiErrorKind::AccessDenied);
        assert_eq!(classify_code("InternalFailure"), ApiErrorKind::Service);
    }
}
