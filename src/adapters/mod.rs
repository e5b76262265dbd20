//! Idempotent resource adapters.
//!
//! An adapter wraps one control-plane family and turns raw calls into
//! create-or-update and delete operations that are safe to repeat:
//!
//! - every create probes by name first and reuses what exists
//! - `AlreadyExists` from a create is success; the existing resource is read back
//! - `NotFound` from a delete is success ([`Deletion::NotFound`])
//! - everything else propagates as [`ProvisionError`]
//!
//! Asynchronous transitions are waited on through [`crate::wait`].

pub mod agents;
pub mod functions;
pub mod iam;
pub mod knowledge_base;
pub mod search;
pub mod storage;

use std::sync::Arc;

use crate::context::DeploymentContext;
use crate::error::ApiError;
use crate::provider::ControlPlane;

pub use agents::{AgentAdapter, AgentRecord, CollaboratorChanges, CollaboratorLink};
pub use functions::FunctionAdapter;
pub use iam::{IamAdapter, RoleArnSet};
pub use knowledge_base::KnowledgeBaseAdapter;
pub use search::SearchAdapter;
pub use storage::StorageAdapter;

/// Outcome of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    NotFound,
}

impl Deletion {
    /// Map a delete call's result, treating `NotFound` as success.
    pub fn from_result(result: Result<(), ApiError>) -> Result<Self, ApiError> {
        match result {
            Ok(()) => Ok(Deletion::Deleted),
            Err(e) if e.is_not_found() => Ok(Deletion::NotFound),
            Err(e) => Err(e),
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Deletion::Deleted)
    }
}

/// Every adapter, built over one control plane and one context.
#[derive(Clone)]
pub struct Adapters {
    pub iam: IamAdapter,
    pub storage: StorageAdapter,
    pub functions: FunctionAdapter,
    pub search: SearchAdapter,
    pub knowledge_bases: KnowledgeBaseAdapter,
    pub agents: AgentAdapter,
}

impl Adapters {
    pub fn new(ctx: Arc<DeploymentContext>, plane: &ControlPlane) -> Self {
        Self {
            iam: IamAdapter::new(ctx.clone(), plane.iam.clone()),
            storage: StorageAdapter::new(ctx.clone(), plane.storage.clone()),
            functions: FunctionAdapter::new(ctx.clone(), plane.functions.clone()),
            search: SearchAdapter::new(ctx.clone(), plane.search.clone()),
            knowledge_bases: KnowledgeBaseAdapter::new(ctx.clone(), plane.knowledge_bases.clone()),
            agents: AgentAdapter::new(ctx, plane.agents.clone()),
        }
    }
}

/// Shared fixture: a simulator, its control plane and a context over it.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::config::Config;
    use crate::context::DeploymentContext;
    use crate::provider::{CallerIdentity, ControlPlane, MemoryControlPlane};

    pub const REGION: &str = "us-east-1";
    pub const ACCOUNT: &str = "123456789012";

    pub fn plane() -> (Arc<MemoryControlPlane>, ControlPlane) {
        let sim = Arc::new(MemoryControlPlane::new(REGION, ACCOUNT));
        let plane = ControlPlane::from_backend(sim.clone());
        (sim, plane)
    }

    pub fn context() -> Arc<DeploymentContext> {
        let identity = CallerIdentity {
            account_id: ACCOUNT.to_string(),
            arn: format!("arn:aws:iam::{}:user/tester", ACCOUNT),
        };
        Arc::new(DeploymentContext::new(Config::local(REGION), identity).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_treats_not_found_as_success() {
        assert_eq!(Deletion::from_result(Ok(())).unwrap(), Deletion::Deleted);
        assert_eq!(
            Deletion::from_result(Err(ApiError::not_found("delete_role", "gone"))).unwrap(),
            Deletion::NotFound
        );
        assert!(Deletion::from_result(Err(ApiError::conflict("delete_role", "attached"))).is_err());
    }
}
