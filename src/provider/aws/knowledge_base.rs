use async_trait::async_trait;
use aws_sdk_bedrockagent::types::{
    ChunkingConfiguration, ChunkingStrategy, DataSourceConfiguration, DataSourceType,
    FixedSizeChunkingConfiguration, KnowledgeBaseConfiguration, KnowledgeBaseStorageType,
    KnowledgeBaseType, OpenSearchServerlessConfiguration, OpenSearchServerlessFieldMapping,
    S3DataSourceConfiguration, StorageConfiguration, VectorIngestionConfiguration,
    VectorKnowledgeBaseConfiguration,
};

use super::{api_error, invalid, missing, AwsControlPlane};
use crate::error::ApiError;
use crate::provider::{
    DataSourceSpec, DataSourceSummary, IngestionJob, KnowledgeBaseApi, KnowledgeBaseInfo,
    KnowledgeBaseSpec, KnowledgeBaseSummary,
};

fn knowledge_base_configuration(
    op: &str,
    spec: &KnowledgeBaseSpec,
) -> Result<(KnowledgeBaseConfiguration, StorageConfiguration), ApiError> {
    let vector = VectorKnowledgeBaseConfiguration::builder()
        .embedding_model_arn(&spec.embedding_model_arn)
        .build()
        .map_err(|e| invalid(op, e))?;
    let kb = KnowledgeBaseConfiguration::builder()
        .r#type(KnowledgeBaseType::Vector)
        .vector_knowledge_base_configuration(vector)
        .build()
        .map_err(|e| invalid(op, e))?;

    let fields = OpenSearchServerlessFieldMapping::builder()
        .vector_field(&spec.fields.vector)
        .text_field(&spec.fields.text)
        .metadata_field(&spec.fields.metadata)
        .build()
        .map_err(|e| invalid(op, e))?;
    let search = OpenSearchServerlessConfiguration::builder()
        .collection_arn(&spec.collection_arn)
        .vector_index_name(&spec.vector_index)
        .field_mapping(fields)
        .build()
        .map_err(|e| invalid(op, e))?;
    let storage = StorageConfiguration::builder()
        .r#type(KnowledgeBaseStorageType::OpensearchServerless)
        .opensearch_serverless_configuration(search)
        .build()
        .map_err(|e| invalid(op, e))?;
    Ok((kb, storage))
}

fn data_source_configuration(
    op: &str,
    spec: &DataSourceSpec,
) -> Result<(DataSourceConfiguration, VectorIngestionConfiguration), ApiError> {
    let s3 = S3DataSourceConfiguration::builder()
        .bucket_arn(&spec.bucket_arn)
        .set_inclusion_prefixes(Some(spec.inclusion_prefixes.clone()))
        .build()
        .map_err(|e| invalid(op, e))?;
    let source = DataSourceConfiguration::builder()
        .r#type(DataSourceType::S3)
        .s3_configuration(s3)
        .build()
        .map_err(|e| invalid(op, e))?;

    let fixed = FixedSizeChunkingConfiguration::builder()
        .max_tokens(spec.chunking.max_tokens as i32)
        .overlap_percentage(spec.chunking.overlap_percentage as i32)
        .build()
        .map_err(|e| invalid(op, e))?;
    let chunking = ChunkingConfiguration::builder()
        .chunking_strategy(ChunkingStrategy::FixedSize)
        .fixed_size_chunking_configuration(fixed)
        .build()
        .map_err(|e| invalid(op, e))?;
    let ingestion = VectorIngestionConfiguration::builder()
        .chunking_configuration(chunking)
        .build();
    Ok((source, ingestion))
}

fn ingestion_job(
    op: &str,
    job: Option<&aws_sdk_bedrockagent::types::IngestionJob>,
) -> Result<IngestionJob, ApiError> {
    let job = job.ok_or_else(|| missing(op, "ingestion job"))?;
    Ok(IngestionJob {
        job_id: job.ingestion_job_id().to_string(),
        status: job.status().as_str().to_string(),
        failure_reasons: job.failure_reasons().to_vec(),
    })
}

#[async_trait]
impl KnowledgeBaseApi for AwsControlPlane {
    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseSummary>, ApiError> {
        let mut summaries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .bedrock_agent
                .list_knowledge_bases()
                .set_next_token(token.take())
                .send()
                .await
                .map_err(|e| api_error("list_knowledge_bases", e))?;
            summaries.extend(out.knowledge_base_summaries().iter().map(|kb| KnowledgeBaseSummary {
                id: kb.knowledge_base_id().to_string(),
                name: kb.name().to_string(),
                status: kb.status().as_str().to_string(),
            }));
            match out.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => return Ok(summaries),
            }
        }
    }

    async fn get_knowledge_base(&self, id: &str) -> Result<KnowledgeBaseInfo, ApiError> {
        let op = "get_knowledge_base";
        let out = self
            .bedrock_agent
            .get_knowledge_base()
            .knowledge_base_id(id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let kb = out.knowledge_base().ok_or_else(|| missing(op, "knowledge base"))?;
        Ok(KnowledgeBaseInfo {
            id: kb.knowledge_base_id().to_string(),
            name: kb.name().to_string(),
            arn: kb.knowledge_base_arn().to_string(),
            status: kb.status().as_str().to_string(),
            failure_reasons: kb.failure_reasons().to_vec(),
        })
    }

    async fn create_knowledge_base(
        &self,
        spec: &KnowledgeBaseSpec,
    ) -> Result<KnowledgeBaseInfo, ApiError> {
        let op = "create_knowledge_base";
        let (config, storage) = knowledge_base_configuration(op, spec)?;
        let out = self
            .bedrock_agent
            .create_knowledge_base()
            .name(&spec.name)
            .description(&spec.description)
            .role_arn(&spec.role_arn)
            .knowledge_base_configuration(config)
            .storage_configuration(storage)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let kb = out.knowledge_base().ok_or_else(|| missing(op, "knowledge base"))?;
        Ok(KnowledgeBaseInfo {
            id: kb.knowledge_base_id().to_string(),
            name: kb.name().to_string(),
            arn: kb.knowledge_base_arn().to_string(),
            status: kb.status().as_str().to_string(),
            failure_reasons: kb.failure_reasons().to_vec(),
        })
    }

    async fn delete_knowledge_base(&self, id: &str) -> Result<(), ApiError> {
        self.bedrock_agent
            .delete_knowledge_base()
            .knowledge_base_id(id)
            .send()
            .await
            .map_err(|e| api_error("delete_knowledge_base", e))?;
        Ok(())
    }

    async fn list_data_sources(&self, kb_id: &str) -> Result<Vec<DataSourceSummary>, ApiError> {
        let out = self
            .bedrock_agent
            .list_data_sources()
            .knowledge_base_id(kb_id)
            .send()
            .await
            .map_err(|e| api_error("list_data_sources", e))?;
        Ok(out
            .data_source_summaries()
            .iter()
            .map(|ds| DataSourceSummary {
                id: ds.data_source_id().to_string(),
                name: ds.name().to_string(),
                status: ds.status().as_str().to_string(),
            })
            .collect())
    }

    async fn create_data_source(
        &self,
        kb_id: &str,
        spec: &DataSourceSpec,
    ) -> Result<DataSourceSummary, ApiError> {
        let op = "create_data_source";
        let (source, ingestion) = data_source_configuration(op, spec)?;
        let out = self
            .bedrock_agent
            .create_data_source()
            .knowledge_base_id(kb_id)
            .name(&spec.name)
            .data_source_configuration(source)
            .vector_ingestion_configuration(ingestion)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        let ds = out.data_source().ok_or_else(|| missing(op, "data source"))?;
        Ok(DataSourceSummary {
            id: ds.data_source_id().to_string(),
            name: ds.name().to_string(),
            status: ds.status().as_str().to_string(),
        })
    }

    async fn delete_data_source(&self, kb_id: &str, ds_id: &str) -> Result<(), ApiError> {
        self.bedrock_agent
            .delete_data_source()
            .knowledge_base_id(kb_id)
            .data_source_id(ds_id)
            .send()
            .await
            .map_err(|e| api_error("delete_data_source", e))?;
        Ok(())
    }

    async fn start_ingestion_job(
        &self,
        kb_id: &str,
        ds_id: &str,
    ) -> Result<IngestionJob, ApiError> {
        let op = "start_ingestion_job";
        let out = self
            .bedrock_agent
            .start_ingestion_job()
            .knowledge_base_id(kb_id)
            .data_source_id(ds_id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        ingestion_job(op, out.ingestion_job())
    }

    async fn get_ingestion_job(
        &self,
        kb_id: &str,
        ds_id: &str,
        job_id: &str,
    ) -> Result<IngestionJob, ApiError> {
        let op = "get_ingestion_job";
        let out = self
            .bedrock_agent
            .get_ingestion_job()
            .knowledge_base_id(kb_id)
            .data_source_id(ds_id)
            .ingestion_job_id(job_id)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        ingestion_job(op, out.ingestion_job())
    }
}
