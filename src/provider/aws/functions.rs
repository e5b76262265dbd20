use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{Environment, FunctionCode, FunctionConfiguration, Runtime};

use super::{api_error, missing, AwsControlPlane};
use crate::error::ApiError;
use crate::provider::{FunctionApi, FunctionInfo, FunctionSpec, InvokePermission};

const INVOKE_ACTION: &str = "lambda:InvokeFunction";

fn function_info(config: &FunctionConfiguration) -> FunctionInfo {
    FunctionInfo {
        name: config.function_name().unwrap_or_default().to_string(),
        arn: config.function_arn().unwrap_or_default().to_string(),
        state: config
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        last_update_status: config
            .last_update_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        code_sha256: config.code_sha256().unwrap_or_default().to_string(),
        role_arn: config.role().unwrap_or_default().to_string(),
        runtime: config
            .runtime()
            .map(|r| r.as_str().to_string())
            .unwrap_or_default(),
        handler: config.handler().unwrap_or_default().to_string(),
        timeout_secs: config.timeout().unwrap_or(0).max(0) as u32,
        memory_mb: config.memory_size().unwrap_or(0).max(0) as u32,
        environment: config
            .environment()
            .and_then(|e| e.variables())
            .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
    }
}

fn environment(vars: &BTreeMap<String, String>) -> Environment {
    Environment::builder()
        .set_variables(Some(vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
        .build()
}

#[async_trait]
impl FunctionApi for AwsControlPlane {
    async fn get_function(&self, name: &str) -> Result<FunctionInfo, ApiError> {
        let op = "get_function";
        let out = self
            .lambda
            .get_function()
            .function_name(name)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        out.configuration()
            .map(function_info)
            .ok_or_else(|| missing(op, "configuration"))
    }

    async fn create_function(
        &self,
        spec: &FunctionSpec,
        package: Vec<u8>,
    ) -> Result<FunctionInfo, ApiError> {
        self.lambda
            .create_function()
            .function_name(&spec.name)
            .description(&spec.description)
            .role(&spec.role_arn)
            .runtime(Runtime::from(spec.runtime.as_str()))
            .handler(&spec.handler)
            .timeout(spec.timeout_secs as i32)
            .memory_size(spec.memory_mb as i32)
            .environment(environment(&spec.environment))
            .code(FunctionCode::builder().zip_file(Blob::new(package)).build())
            .send()
            .await
            .map_err(|e| api_error("create_function", e))?;
        self.get_function(&spec.name).await
    }

    async fn update_function_code(
        &self,
        name: &str,
        package: Vec<u8>,
    ) -> Result<FunctionInfo, ApiError> {
        self.lambda
            .update_function_code()
            .function_name(name)
            .zip_file(Blob::new(package))
            .send()
            .await
            .map_err(|e| api_error("update_function_code", e))?;
        self.get_function(name).await
    }

    async fn update_function_configuration(
        &self,
        spec: &FunctionSpec,
    ) -> Result<FunctionInfo, ApiError> {
        self.lambda
            .update_function_configuration()
            .function_name(&spec.name)
            .description(&spec.description)
            .role(&spec.role_arn)
            .runtime(Runtime::from(spec.runtime.as_str()))
            .handler(&spec.handler)
            .timeout(spec.timeout_secs as i32)
            .memory_size(spec.memory_mb as i32)
            .environment(environment(&spec.environment))
            .send()
            .await
            .map_err(|e| api_error("update_function_configuration", e))?;
        self.get_function(&spec.name).await
    }

    async fn list_functions(&self) -> Result<Vec<FunctionInfo>, ApiError> {
        let mut functions = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .lambda
                .list_functions()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| api_error("list_functions", e))?;
            functions.extend(out.functions().iter().map(function_info));
            match out.next_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => return Ok(functions),
            }
        }
    }

    async fn delete_function(&self, name: &str) -> Result<(), ApiError> {
        self.lambda
            .delete_function()
            .function_name(name)
            .send()
            .await
            .map_err(|e| api_error("delete_function", e))?;
        Ok(())
    }

    async fn add_permission(
        &self,
        name: &str,
        permission: &InvokePermission,
    ) -> Result<(), ApiError> {
        self.lambda
            .add_permission()
            .function_name(name)
            .statement_id(&permission.statement_id)
            .action(INVOKE_ACTION)
            .principal(&permission.principal)
            .set_source_arn(permission.source_arn.clone())
            .send()
            .await
            .map_err(|e| api_error("add_permission", e))?;
        Ok(())
    }

    async fn remove_permission(&self, name: &str, statement_id: &str) -> Result<(), ApiError> {
        self.lambda
            .remove_permission()
            .function_name(name)
            .statement_id(statement_id)
            .send()
            .await
            .map_err(|e| api_error("remove_permission", e))?;
        Ok(())
    }

    async fn invoke(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, ApiError> {
        let op = "invoke";
        let out = self
            .lambda
            .invoke()
            .function_name(name)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let body = out.payload().map(|b| b.as_ref().to_vec()).unwrap_or_default();
        if let Some(kind) = out.function_error() {
            return Err(ApiError::service(
                op,
                format!("{}: {}", kind, String::from_utf8_lossy(&body)),
            ));
        }
        Ok(body)
    }
}
