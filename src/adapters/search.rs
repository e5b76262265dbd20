//! Vector search collection, its security policies and the vector index.
//!
//! Policy names carry a creation timestamp, so they are never looked up by
//! name. Each kind is reconciled by listing the policies that cover the
//! collection:
//!
//! - a policy with an equal document is reused
//! - otherwise the first covering policy is updated with its version token
//! - with no covering policy a new one is created
//!
//! A `Conflict` on update or create means someone else changed the set in
//! between; the listing is repeated a bounded number of times.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::Deletion;
use crate::context::DeploymentContext;
use crate::error::{ApiError, ApiResultExt, ProvisionError};
use crate::policy::{self, documents_equal, CollectionPolicy, CollectionPolicyKind};
use crate::provider::{CollectionInfo, FieldMapping, SearchApi, SearchPolicy};
use crate::wait::{
    await_consistency, wait_for_status, wait_until_deleted, StatusProbe, StatusTarget, DELETING,
    FAILED_STATUSES,
};

const RECONCILE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SearchAdapter {
    ctx: Arc<DeploymentContext>,
    api: Arc<dyn SearchApi>,
}

/// Mapping of a knn vector index with an hnsw/faiss graph on l2 distance.
pub fn index_body(dimension: u32, fields: &FieldMapping) -> Value {
    json!({
        "settings": {
            "index": {
                "knn": true,
                "knn.algo_param.ef_search": 512
            }
        },
        "mappings": {
            "properties": {
                fields.vector.as_str(): {
                    "type": "knn_vector",
                    "dimension": dimension,
                    "method": {
                        "name": "hnsw",
                        "engine": "faiss",
                        "parameters": { "ef_construction": 512, "m": 16 },
                        "space_type": "l2"
                    }
                },
                fields.text.as_str(): { "type": "text" },
                fields.metadata.as_str(): { "type": "text", "index": false }
            }
        }
    })
}

fn policy_name(kind: CollectionPolicyKind) -> String {
    format!(
        "{}-{}",
        kind.name_prefix(),
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    )
}

impl SearchAdapter {
    pub fn new(ctx: Arc<DeploymentContext>, api: Arc<dyn SearchApi>) -> Self {
        Self { ctx, api }
    }

    /// Reconcile one policy kind for a collection.
    pub async fn ensure_policy(
        &self,
        collection: &str,
        desired: &CollectionPolicy,
    ) -> Result<SearchPolicy, ProvisionError> {
        let kind = desired.kind;
        let document = desired.to_json()?;
        let resource = format!("collection/{}", collection);
        let mut last_conflict: Option<ApiError> = None;

        for attempt in 0..RECONCILE_ATTEMPTS {
            let covering = self.api.list_policies(kind, &resource).await?;

            if let Some(same) = covering
                .iter()
                .find(|p| documents_equal(&p.document, &document))
            {
                debug!(kind = %kind, policy = %same.name, "Collection policy up to date");
                return Ok(same.clone());
            }

            let result = match covering.first() {
                Some(stale) => {
                    info!(kind = %kind, policy = %stale.name, "Updating collection policy");
                    self.api
                        .update_policy(kind, &stale.name, &stale.version, &document)
                        .await
                }
                None => {
                    let name = policy_name(kind);
                    info!(kind = %kind, policy = %name, "Creating collection policy");
                    self.api
                        .create_policy(
                            kind,
                            &name,
                            &document,
                            &format!("{} policy for {}", kind, collection),
                        )
                        .await
                }
            };

            match result {
                Ok(policy) => return Ok(policy),
                Err(e) if e.is_conflict() || e.is_already_exists() => {
                    warn!(kind = %kind, attempt, "Collection policy changed concurrently: {}", e);
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_conflict
            .map(ProvisionError::from)
            .unwrap_or_else(|| {
                ProvisionError::Precondition(format!("could not reconcile {} policy", kind))
            }))
    }

    /// Encryption, network and data-access policies for the collection.
    ///
    /// `principals` are the ARNs granted data access.
    pub async fn ensure_collection_policies(
        &self,
        collection: &str,
        principals: &[String],
    ) -> Result<(), ProvisionError> {
        self.ensure_policy(collection, &policy::encryption_policy(collection)?)
            .await?;
        self.ensure_policy(collection, &policy::network_policy(collection, true)?)
            .await?;
        self.ensure_policy(collection, &policy::data_access_policy(collection, principals)?)
            .await?;
        Ok(())
    }

    pub async fn get_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionInfo>, ProvisionError> {
        Ok(self.api.get_collection(name).await.optional()?)
    }

    /// Create the collection if needed and wait until it is `ACTIVE` with an
    /// endpoint.
    pub async fn ensure_collection(&self, name: &str) -> Result<CollectionInfo, ProvisionError> {
        if self.get_collection(name).await?.is_none() {
            match self
                .api
                .create_collection(name, "Vector store for the agent knowledge base")
                .await
            {
                Ok(c) => info!(collection = name, id = %c.id, "Created collection"),
                Err(e) if e.is_conflict() || e.is_already_exists() => {
                    debug!(collection = name, "Collection appeared concurrently")
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            debug!(collection = name, "Collection exists");
        }

        let api = &self.api;
        wait_for_status(
            StatusTarget {
                resource: "collection",
                id: name,
                target: "ACTIVE",
                failed: FAILED_STATUSES,
            },
            &self.ctx.polling().collection,
            move || async move {
                let c = api.get_collection(name).await?;
                Ok::<_, ApiError>(StatusProbe::new(c.status))
            },
        )
        .await?;

        let collection = self.get_collection(name).await?.ok_or_else(|| {
            ProvisionError::Precondition(format!("collection {} vanished after creation", name))
        })?;
        match collection.endpoint.as_deref() {
            Some(e) if !e.is_empty() => Ok(collection),
            _ => Err(ProvisionError::Precondition(format!(
                "collection {} has no endpoint",
                name
            ))),
        }
    }

    /// Create the vector index if absent and wait until it is visible.
    pub async fn ensure_index(
        &self,
        endpoint: &str,
        index: &str,
        dimension: u32,
        fields: &FieldMapping,
    ) -> Result<(), ProvisionError> {
        if self.api.index_exists(endpoint, index).await? {
            debug!(index, "Vector index exists");
            return Ok(());
        }
        match self
            .api
            .create_index(endpoint, index, &index_body(dimension, fields))
            .await
        {
            Ok(()) => info!(index, dimension, "Created vector index"),
            Err(e) if e.is_already_exists() => debug!(index, "Vector index appeared concurrently"),
            Err(e) => return Err(e.into()),
        }

        let api = &self.api;
        await_consistency(
            &format!("index {}", index),
            &self.ctx.polling().consistency,
            move || async move {
                Ok::<_, ApiError>(api.index_exists(endpoint, index).await?.then_some(()))
            },
        )
        .await
    }

    /// Delete the collection and wait until it is gone, so the policies
    /// covering it can be removed. A collection already `DELETING` is only
    /// waited on.
    pub async fn delete_collection(&self, name: &str) -> Result<Deletion, ProvisionError> {
        let Some(collection) = self.get_collection(name).await? else {
            return Ok(Deletion::NotFound);
        };
        let outcome = if collection.status == DELETING {
            debug!(collection = name, "Collection deletion already in progress");
            Deletion::NotFound
        } else {
            Deletion::from_result(self.api.delete_collection(&collection.id).await)?
        };

        let api = &self.api;
        let polling = &self.ctx.polling().collection;
        wait_until_deleted("collection", name, polling, move || async move {
            Ok::<_, ApiError>(api.get_collection(name).await.optional()?.is_some())
        })
        .await?;
        if outcome.is_deleted() {
            info!(collection = name, id = %collection.id, "Deleted collection");
        }
        Ok(outcome)
    }

    /// Delete every policy of every kind covering the collection; returns
    /// the names of the deleted policies.
    pub async fn delete_policies(&self, collection: &str) -> Result<Vec<String>, ProvisionError> {
        let resource = format!("collection/{}", collection);
        let mut deleted = Vec::new();
        for kind in CollectionPolicyKind::ALL {
            for policy in self.api.list_policies(kind, &resource).await? {
                let removed = self.api.delete_policy(kind, &policy.name).await;
                let outcome = Deletion::from_result(removed)?;
                if outcome.is_deleted() {
                    info!(kind = %kind, policy = %policy.name, "Deleted collection policy");
                    deleted.push(policy.name);
                }
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing;
    use crate::provider::MemoryControlPlane;

    fn adapter() -> (Arc<MemoryControlPlane>, SearchAdapter) {
        let (sim, plane) = testing::plane();
        (sim, SearchAdapter::new(testing::context(), plane.search))
    }

    fn principals() -> Vec<String> {
        vec!["arn:aws:iam::123456789012:role/kb".to_string()]
    }

    #[test]
    fn index_body_uses_field_names_and_dimension() {
        let body = index_body(1024, &FieldMapping::default());
        assert_eq!(body["mappings"]["properties"]["vector"]["dimension"], 1024);
        assert_eq!(
            body["mappings"]["properties"]["vector"]["method"]["engine"],
            "faiss"
        );
        assert_eq!(body["mappings"]["properties"]["metadata"]["index"], false);
        assert_eq!(body["settings"]["index"]["knn"], true);
    }

    #[tokio::test]
    async fn policies_are_reused_when_unchanged() {
        let (sim, search) = adapter();
        search
            .ensure_collection_policies("kb-collection", &principals())
            .await
            .unwrap();
        assert_eq!(sim.live_search_policies().len(), 3);

        sim.reset_calls();
        search
            .ensure_collection_policies("kb-collection", &principals())
            .await
            .unwrap();
        assert_eq!(sim.calls("create_search_policy"), 0);
        assert_eq!(sim.calls("update_search_policy"), 0);
    }

    #[tokio::test]
    async fn drifted_policy_is_updated_in_place() {
        let (sim, search) = adapter();
        search
            .ensure_collection_policies("kb-collection", &principals())
            .await
            .unwrap();

        let mut more = principals();
        more.push("arn:aws:iam::123456789012:role/agent".to_string());
        search
            .ensure_collection_policies("kb-collection", &more)
            .await
            .unwrap();

        assert_eq!(sim.calls("update_search_policy"), 1);
        assert_eq!(sim.live_search_policies().len(), 3);
    }

    #[tokio::test]
    async fn conflicting_update_is_retried_then_reported() {
        let (sim, search) = adapter();
        let first = policy::network_policy("kb-collection", true).unwrap();
        search.ensure_policy("kb-collection", &first).await.unwrap();

        sim.fail_on(
            "update_search_policy",
            ApiError::conflict("update_search_policy", "version mismatch"),
        );
        let second = policy::network_policy("kb-collection", false).unwrap();
        let err = search.ensure_policy("kb-collection", &second).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Api(ref e) if e.is_conflict()));
        assert_eq!(sim.calls("update_search_policy"), RECONCILE_ATTEMPTS as u32);
    }

    #[tokio::test]
    async fn collection_index_and_teardown() {
        let (sim, search) = adapter();
        search
            .ensure_collection_policies("kb-collection", &principals())
            .await
            .unwrap();
        let collection = search.ensure_collection("kb-collection").await.unwrap();
        assert_eq!(collection.status, "ACTIVE");
        let endpoint = collection.endpoint.unwrap();

        let fields = FieldMapping::default();
        search.ensure_index(&endpoint, "kb-index", 1536, &fields).await.unwrap();
        search.ensure_index(&endpoint, "kb-index", 1536, &fields).await.unwrap();
        assert_eq!(sim.calls("create_index"), 1);

        sim.reset_calls();
        search.ensure_collection("kb-collection").await.unwrap();
        assert_eq!(sim.calls("create_collection"), 0);

        assert_eq!(search.delete_collection("kb-collection").await.unwrap(), Deletion::Deleted);
        assert_eq!(search.delete_collection("kb-collection").await.unwrap(), Deletion::NotFound);
        assert_eq!(search.delete_policies("kb-collection").await.unwrap().len(), 3);
        assert!(search.delete_policies("kb-collection").await.unwrap().is_empty());
        assert!(sim.live_indexes().is_empty());
    }
}
