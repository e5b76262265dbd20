//! Knowledge base, its bucket data source and ingestion.

use std::sync::Arc;

use tracing::{debug, info};

use super::Deletion;
use crate::context::DeploymentContext;
use crate::error::{ApiError, ApiResultExt, ProvisionError};
use crate::names::KNOWLEDGE_PREFIX;
use crate::provider::{
    ChunkingConfig, DataSourceSpec, DataSourceSummary, FieldMapping, IngestionJob,
    KnowledgeBaseApi, KnowledgeBaseInfo, KnowledgeBaseSpec, KnowledgeBaseSummary,
};
use crate::wait::{
    wait_for_status, wait_until_deleted, StatusProbe, StatusTarget, DELETING, FAILED_STATUSES,
};

/// Description of the knowledge base and of its association with the supervisor.
pub const KB_DESCRIPTION: &str = "Knowledge base agent for document retrieval and Q&A";

/// Fixed-size chunking used for every uploaded document.
pub const DEFAULT_CHUNKING: ChunkingConfig = ChunkingConfig {
    max_tokens: 500,
    overlap_percentage: 10,
};

#[derive(Clone)]
pub struct KnowledgeBaseAdapter {
    ctx: Arc<DeploymentContext>,
    api: Arc<dyn KnowledgeBaseApi>,
}

impl KnowledgeBaseAdapter {
    pub fn new(ctx: Arc<DeploymentContext>, api: Arc<dyn KnowledgeBaseApi>) -> Self {
        Self { ctx, api }
    }

    /// Desired knowledge base over the deployment's collection and index.
    pub fn spec_for(&self, role_arn: &str, collection_arn: &str) -> KnowledgeBaseSpec {
        let names = &self.ctx.names;
        KnowledgeBaseSpec {
            name: names.knowledge_base.clone(),
            description: KB_DESCRIPTION.to_string(),
            role_arn: role_arn.to_string(),
            embedding_model_arn: self.ctx.config.embedding_model_arn(),
            collection_arn: collection_arn.to_string(),
            vector_index: names.vector_index.clone(),
            fields: FieldMapping::default(),
        }
    }

    pub async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<KnowledgeBaseSummary>, ProvisionError> {
        Ok(self
            .api
            .list_knowledge_bases()
            .await?
            .into_iter()
            .find(|kb| kb.name == name))
    }

    pub async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<KnowledgeBaseSummary>, ProvisionError> {
        Ok(self
            .api
            .list_knowledge_bases()
            .await?
            .into_iter()
            .filter(|kb| kb.name.starts_with(prefix))
            .collect())
    }

    /// Create the knowledge base if needed and wait until it is `ACTIVE`.
    pub async fn ensure_knowledge_base(
        &self,
        spec: &KnowledgeBaseSpec,
    ) -> Result<KnowledgeBaseInfo, ProvisionError> {
        let id = match self.find_by_name(&spec.name).await? {
            Some(existing) => {
                debug!(knowledge_base = %spec.name, id = %existing.id, "Knowledge base exists");
                existing.id
            }
            None => match self.api.create_knowledge_base(spec).await {
                Ok(created) => {
                    info!(knowledge_base = %spec.name, id = %created.id, "Created knowledge base");
                    created.id
                }
                Err(e) if e.is_conflict() || e.is_already_exists() => self
                    .find_by_name(&spec.name)
                    .await?
                    .map(|kb| kb.id)
                    .ok_or_else(|| ProvisionError::from(e))?,
                Err(e) => return Err(e.into()),
            },
        };
        if id.is_empty() {
            return Err(ProvisionError::Precondition(format!(
                "knowledge base {} has no id",
                spec.name
            )));
        }

        let api = &self.api;
        let kb_id = id.as_str();
        wait_for_status(
            StatusTarget {
                resource: "knowledge base",
                id: kb_id,
                target: "ACTIVE",
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().knowledge_base,
            move || async move {
                let kb = api.get_knowledge_base(kb_id).await?;
                let reason =
                    (!kb.failure_reasons.is_empty()).then(|| kb.failure_reasons.join("; "));
                Ok::<_, ApiError>(StatusProbe::new(kb.status).with_reason(reason))
            },
        )
        .await?;

        Ok(self.api.get_knowledge_base(&id).await?)
    }

    /// Bucket data source over the knowledge prefix with fixed-size chunking.
    pub async fn ensure_data_source(
        &self,
        kb_id: &str,
        bucket_arn: &str,
    ) -> Result<DataSourceSummary, ProvisionError> {
        let name = &self.ctx.names.data_source;
        let existing = self.api.list_data_sources(kb_id).await?;
        if let Some(ds) = existing.into_iter().find(|d| &d.name == name) {
            debug!(data_source = %name, id = %ds.id, "Data source exists");
            return Ok(ds);
        }

        let spec = DataSourceSpec {
            name: name.clone(),
            bucket_arn: bucket_arn.to_string(),
            inclusion_prefixes: vec![KNOWLEDGE_PREFIX.to_string()],
            chunking: DEFAULT_CHUNKING,
        };
        match self.api.create_data_source(kb_id, &spec).await {
            Ok(ds) => {
                info!(data_source = %name, id = %ds.id, "Created data source");
                Ok(ds)
            }
            Err(e) if e.is_conflict() || e.is_already_exists() => self
                .api
                .list_data_sources(kb_id)
                .await?
                .into_iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| e.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Start an ingestion job and wait for it to complete.
    pub async fn sync(&self, kb_id: &str, ds_id: &str) -> Result<IngestionJob, ProvisionError> {
        let job = self.api.start_ingestion_job(kb_id, ds_id).await?;
        info!(knowledge_base = kb_id, job = %job.job_id, "Started ingestion job");

        let api = &self.api;
        let job_id = job.job_id.as_str();
        wait_for_status(
            StatusTarget {
                resource: "ingestion job",
                id: job_id,
                target: "COMPLETE",
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().ingestion,
            move || async move {
                let j = api.get_ingestion_job(kb_id, ds_id, job_id).await?;
                let reason = (!j.failure_reasons.is_empty()).then(|| j.failure_reasons.join("; "));
                Ok::<_, ApiError>(StatusProbe::new(j.status).with_reason(reason))
            },
        )
        .await?;

        let done = self.api.get_ingestion_job(kb_id, ds_id, &job.job_id).await?;
        info!(knowledge_base = kb_id, job = %done.job_id, "Ingestion complete");
        Ok(done)
    }

    /// Delete the data sources, then the knowledge base, and wait until it
    /// is gone. A knowledge base already `DELETING` is only waited on.
    pub async fn delete(&self, kb_id: &str) -> Result<Deletion, ProvisionError> {
        let Some(kb) = self.api.get_knowledge_base(kb_id).await.optional()? else {
            return Ok(Deletion::NotFound);
        };
        let outcome = if kb.status == DELETING {
            debug!(knowledge_base = kb_id, "Knowledge base deletion already in progress");
            Deletion::NotFound
        } else {
            let sources = self.api.list_data_sources(kb_id).await.optional()?;
            for ds in sources.unwrap_or_default() {
                let removed = self.api.delete_data_source(kb_id, &ds.id).await;
                if Deletion::from_result(removed)?.is_deleted() {
                    debug!(knowledge_base = kb_id, data_source = %ds.name, "Deleted data source");
                }
            }
            Deletion::from_result(self.api.delete_knowledge_base(kb_id).await)?
        };

        let api = &self.api;
        let polling = &self.ctx.polling().knowledge_base;
        wait_until_deleted("knowledge base", kb_id, polling, move || async move {
            Ok::<_, ApiError>(api.get_knowledge_base(kb_id).await.optional()?.is_some())
        })
        .await?;
        if outcome.is_deleted() {
            info!(knowledge_base = kb_id, name = %kb.name, "Deleted knowledge base");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{testing, SearchAdapter};
    use crate::provider::MemoryControlPlane;

    /// Collection and index the knowledge base points at.
    async fn setup() -> (Arc<MemoryControlPlane>, KnowledgeBaseAdapter, KnowledgeBaseSpec) {
        let (sim, plane) = testing::plane();
        let ctx = testing::context();
        let search = SearchAdapter::new(ctx.clone(), plane.search.clone());
        let names = &ctx.names;
        search
            .ensure_collection_policies(
                &names.collection,
                &["arn:aws:iam::123456789012:role/kb".to_string()],
            )
            .await
            .unwrap();
        let collection = search.ensure_collection(&names.collection).await.unwrap();
        search
            .ensure_index(
                collection.endpoint.as_deref().unwrap(),
                &names.vector_index,
                1536,
                &FieldMapping::default(),
            )
            .await
            .unwrap();

        let kbs = KnowledgeBaseAdapter::new(ctx.clone(), plane.knowledge_bases);
        let spec = kbs.spec_for("arn:aws:iam::123456789012:role/kb", &collection.arn);
        (sim, kbs, spec)
    }

    #[tokio::test]
    async fn knowledge_base_and_data_source_are_idempotent() {
        let (sim, kbs, spec) = setup().await;
        let kb = kbs.ensure_knowledge_base(&spec).await.unwrap();
        assert_eq!(kb.status, "ACTIVE");
        let ds = kbs.ensure_data_source(&kb.id, "arn:aws:s3:::bucket").await.unwrap();

        sim.reset_calls();
        let again = kbs.ensure_knowledge_base(&spec).await.unwrap();
        let ds_again = kbs.ensure_data_source(&kb.id, "arn:aws:s3:::bucket").await.unwrap();
        assert_eq!(again.id, kb.id);
        assert_eq!(ds_again.id, ds.id);
        assert_eq!(sim.calls("create_knowledge_base"), 0);
        assert_eq!(sim.calls("create_data_source"), 0);
    }

    #[tokio::test]
    async fn missing_index_is_rejected() {
        let (_sim, kbs, mut spec) = setup().await;
        spec.vector_index = "no-such-index".to_string();
        let err = kbs.ensure_knowledge_base(&spec).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Api(_)));
    }

    #[tokio::test]
    async fn sync_waits_for_completion() {
        let (sim, kbs, spec) = setup().await;
        let kb = kbs.ensure_knowledge_base(&spec).await.unwrap();
        let ds = kbs.ensure_data_source(&kb.id, "arn:aws:s3:::bucket").await.unwrap();

        let job = kbs.sync(&kb.id, &ds.id).await.unwrap();
        assert_eq!(job.status, "COMPLETE");
        assert!(sim.calls("get_ingestion_job") >= 3);
    }

    #[tokio::test]
    async fn failed_ingestion_is_reported() {
        let (sim, kbs, spec) = setup().await;
        let kb = kbs.ensure_knowledge_base(&spec).await.unwrap();
        let ds = kbs.ensure_data_source(&kb.id, "arn:aws:s3:::bucket").await.unwrap();

        sim.fail_on(
            "start_ingestion_job",
            ApiError::validation("start_ingestion_job", "data source is busy"),
        );
        assert!(kbs.sync(&kb.id, &ds.id).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_data_sources_and_is_idempotent() {
        let (sim, kbs, spec) = setup().await;
        let kb = kbs.ensure_knowledge_base(&spec).await.unwrap();
        kbs.ensure_data_source(&kb.id, "arn:aws:s3:::bucket").await.unwrap();

        assert_eq!(kbs.delete(&kb.id).await.unwrap(), Deletion::Deleted);
        assert_eq!(kbs.delete(&kb.id).await.unwrap(), Deletion::NotFound);
        assert!(sim.live_knowledge_bases().is_empty());
    }
}
