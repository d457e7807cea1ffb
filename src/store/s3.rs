//! Amazon S3 object store.
//!
//! Containers are buckets and objects are keys:
//! ```text
//! s3://{container}/session-{sessionId}.json
//! ```

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

use super::config::S3StoreConfig;
use super::{ErrorCode, ObjectStore, Result, StoreError, StoreType};

/// S3-based object store.
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store.
    ///
    /// Uses default credentials from the environment (AWS_ACCESS_KEY_ID,
    /// AWS_SECRET_ACCESS_KEY, or IAM role).
    pub async fn new() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
        }
    }

    /// Create from configuration, honoring a custom endpoint and region
    /// (for S3-compatible services like MinIO).
    pub async fn from_config(config: &S3StoreConfig) -> Self {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Self::new().await;
        };

        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            config_loader = config_loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint)
            .force_path_style(true) // Required for MinIO and most S3-compatible services
            .build();

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    /// Create with explicit client (for testing).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Map an S3 error code onto the classifier's codes.
fn error_code(code: Option<&str>) -> ErrorCode {
    match code {
        Some("SlowDown") | Some("ServiceUnavailable") | Some("Throttling") => ErrorCode::ServerBusy,
        Some("InternalError") => ErrorCode::InternalError,
        Some("RequestTimeout") => ErrorCode::OperationTimedOut,
        Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists") => {
            ErrorCode::ContainerAlreadyExists
        }
        Some("NoSuchBucket") => ErrorCode::ContainerNotFound,
        Some("NoSuchKey") | Some("NotFound") => ErrorCode::ObjectNotFound,
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
            ErrorCode::AuthorizationFailure
        }
        Some("InvalidBucketName") | Some("KeyTooLongError") => ErrorCode::InvalidResourceName,
        Some(other) => ErrorCode::Other(other.to_string()),
        None => ErrorCode::Other("Unknown".to_string()),
    }
}

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err {
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let service_err = context.err();
            StoreError::service(
                status,
                error_code(service_err.code()),
                service_err
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| service_err.to_string()),
            )
        }
        SdkError::TimeoutError(_) => {
            StoreError::service(408, ErrorCode::OperationTimedOut, "S3 request timed out")
        }
        other => StoreError::Transport(other.to_string()),
    }
}

/// `head_*` calls answer 404 with no error body; treat that as absence.
fn is_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool {
    matches!(err, SdkError::ServiceError(context) if context.raw().status().as_u16() == 404)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn container_exists(&self, container: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(container).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_sdk_error(e)),
        }
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        self.client
            .create_bucket()
            .bucket(container)
            .send()
            .await
            .map_err(map_sdk_error)?;
        debug!(bucket = %container, "Created bucket");
        Ok(())
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(container)
            .key(name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_sdk_error(e)),
        }
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(container)
            .key(name)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn put(&self, container: &str, name: &str, body: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(container)
            .key(name)
            .content_type("application/json")
            .body(ByteStream::from(body.to_vec()))
            .send()
            .await
            .map_err(map_sdk_error)?;

        debug!(bucket = %container, key = %name, size = body.len(), "Stored object in S3");
        Ok(())
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(container)
            .key(name)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transport(format!("S3 body read failed: {}", e)))?
            .into_bytes()
            .to_vec();

        Ok(body)
    }

    fn store_type(&self) -> StoreType {
        StoreType::S3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(error_code(Some("SlowDown")), ErrorCode::ServerBusy);
        assert_eq!(error_code(Some("InternalError")), ErrorCode::InternalError);
        assert_eq!(error_code(Some("RequestTimeout")), ErrorCode::OperationTimedOut);
        assert_eq!(error_code(Some("AccessDenied")), ErrorCode::AuthorizationFailure);
        assert_eq!(
            error_code(Some("BucketAlreadyOwnedByYou")),
            ErrorCode::ContainerAlreadyExists
        );
        assert_eq!(
            error_code(Some("Mystery")),
            ErrorCode::Other("Mystery".to_string())
        );
    }

    #[test]
    fn test_mapped_codes_classify() {
        let busy = StoreError::service(503, error_code(Some("SlowDown")), "slow down");
        assert!(busy.is_retryable());

        let denied = StoreError::service(403, error_code(Some("AccessDenied")), "denied");
        assert!(!denied.is_retryable());
    }
}
