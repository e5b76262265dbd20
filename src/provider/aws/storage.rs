use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration, Delete,
    ObjectIdentifier, VersioningConfiguration,
};

use super::{api_error, invalid, AwsControlPlane};
use crate::error::ApiError;
use crate::provider::{ObjectVersion, StorageApi};

/// Region that rejects an explicit location constraint.
const DEFAULT_LOCATION: &str = "us-east-1";

#[async_trait]
impl StorageApi for AwsControlPlane {
    async fn head_bucket(&self, bucket: &str) -> Result<(), ApiError> {
        self.s3
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| api_error("head_bucket", e))?;
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), ApiError> {
        let location = (region != DEFAULT_LOCATION).then(|| {
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build()
        });
        self.s3
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(location)
            .send()
            .await
            .map_err(|e| api_error("create_bucket", e))?;
        Ok(())
    }

    async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> Result<(), ApiError> {
        let status = if enabled {
            BucketVersioningStatus::Enabled
        } else {
            BucketVersioningStatus::Suspended
        };
        self.s3
            .put_bucket_versioning()
            .bucket(bucket)
            .versioning_configuration(VersioningConfiguration::builder().status(status).build())
            .send()
            .await
            .map_err(|e| api_error("put_bucket_versioning", e))?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ApiError> {
        self.s3
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| api_error("put_object", e))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, ApiError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .s3
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| api_error("list_objects", e))?;
            keys.extend(out.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            match out.next_continuation_token() {
                Some(next) if out.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => return Ok(keys),
            }
        }
    }

    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectVersion>, ApiError> {
        let mut versions = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let out = self
                .s3
                .list_object_versions()
                .bucket(bucket)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(|e| api_error("list_object_versions", e))?;

            versions.extend(out.versions().iter().filter_map(|v| {
                Some(ObjectVersion {
                    key: v.key()?.to_string(),
                    version_id: v.version_id().map(str::to_string),
                    is_delete_marker: false,
                })
            }));
            versions.extend(out.delete_markers().iter().filter_map(|m| {
                Some(ObjectVersion {
                    key: m.key()?.to_string(),
                    version_id: m.version_id().map(str::to_string),
                    is_delete_marker: true,
                })
            }));

            if !out.is_truncated().unwrap_or(false) {
                return Ok(versions);
            }
            key_marker = out.next_key_marker().map(str::to_string);
            version_marker = out.next_version_id_marker().map(str::to_string);
        }
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: &[ObjectVersion],
    ) -> Result<usize, ApiError> {
        let op = "delete_objects";
        if objects.is_empty() {
            return Ok(0);
        }
        let identifiers = objects
            .iter()
            .map(|o| {
                ObjectIdentifier::builder()
                    .key(&o.key)
                    .set_version_id(o.version_id.clone())
                    .build()
                    .map_err(|e| invalid(op, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .build()
            .map_err(|e| invalid(op, e))?;

        let out = self
            .s3
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| api_error(op, e))?;
        if let Some(failed) = out.errors().first() {
            return Err(ApiError::service(
                op,
                format!(
                    "{} objects not deleted, first {}: {}",
                    out.errors().len(),
                    failed.key().unwrap_or_default(),
                    failed.message().unwrap_or_default()
                ),
            ));
        }
        Ok(out.deleted().len())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ApiError> {
        self.s3
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| api_error("delete_bucket", e))?;
        Ok(())
    }
}
