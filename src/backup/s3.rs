use crate::backup::BackupStream;
use crate::config::S3BackupConfig;
use crate::error::{config_error, environment_error, AppResult};
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::info;

/// Backup object in an S3-compatible bucket
#[derive(Debug, Clone)]
pub struct S3Source {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
    /// Key actually fetched, once a prefix has been resolved
    resolved: Arc<OnceCell<String>>,
}

impl S3Source {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            endpoint,
            resolved: Arc::new(OnceCell::new()),
        }
    }

    /// Credentials come from the environment variables the config names
    pub fn from_config(config: &S3BackupConfig) -> AppResult<Self> {
        let access_key = std::env::var(&config.access_key_env).map_err(|_| {
            config_error(format!(
                "S3 access key environment variable {} is not set",
                config.access_key_env
            ))
        })?;
        let secret_key = std::env::var(&config.secret_key_env).map_err(|_| {
            config_error(format!(
                "S3 secret key environment variable {} is not set",
                config.secret_key_env
            ))
        })?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
        if let Some(endpoint) = &config.endpoint {
            // Custom endpoints address buckets by path
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| config_error(format!("invalid S3 configuration: {}", e)))?;

        Ok(Self::new(
            Arc::new(store),
            config.bucket.clone(),
            config.prefix.clone(),
            config.endpoint.clone(),
        ))
    }

    pub async fn acquire(&self) -> AppResult<BackupStream> {
        let key = if self.prefix.ends_with('/') {
            let latest = self.find_latest().await?;
            info!(
                "Selected latest backup s3://{}/{} (modified {})",
                self.bucket, latest.location, latest.last_modified
            );
            latest.location.to_string()
        } else {
            self.prefix.clone()
        };

        let location = ObjectPath::from(key.as_str());
        let result = self.store.get(&location).await.map_err(|e| {
            environment_error(format!(
                "failed to get object s3://{}/{}: {}",
                self.bucket, key, e
            ))
        })?;
        let _ = self.resolved.set(key);

        let body = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(body)))
    }

    async fn find_latest(&self) -> AppResult<ObjectMeta> {
        let prefix = ObjectPath::from(self.prefix.as_str());
        let mut listing = self.store.list(Some(&prefix));
        let mut latest: Option<ObjectMeta> = None;

        while let Some(meta) = listing.try_next().await.map_err(|e| {
            environment_error(format!(
                "failed to list s3://{}/{}: {}",
                self.bucket, self.prefix, e
            ))
        })? {
            if latest.as_ref().map_or(true, |l| meta.last_modified > l.last_modified) {
                latest = Some(meta);
            }
        }

        latest.ok_or_else(|| {
            environment_error(format!("no objects found in s3://{}/{}", self.bucket, self.prefix))
        })
    }

    pub fn identifier(&self) -> String {
        let key = self.resolved.get().unwrap_or(&self.prefix);
        match &self.endpoint {
            Some(endpoint) => format!("s3://{}/{} (endpoint: {})", self.bucket, key, endpoint),
            None => format!("s3://{}/{}", self.bucket, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, EXIT_ENVIRONMENT};
    use object_store::memory::InMemory;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn bucket(objects: &[(&str, &[u8])]) -> Arc<dyn ObjectStore> {
        let store = InMemory::new();
        for (key, body) in objects {
            store
                .put(&ObjectPath::from(*key), body.to_vec().into())
                .await
                .unwrap();
            // Distinct modification times
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Arc::new(store)
    }

    async fn read_all(mut stream: BackupStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_prefix_resolves_to_newest_object() {
        let store = bucket(&[
            ("billing/2026-10-17.dump", b"older"),
            ("billing/2026-10-18.dump", b"newest"),
            ("other/2026-10-19.dump", b"unrelated"),
        ])
        .await;
        let source = S3Source::new(store, "backups", "billing/", Some("http://minio:9000".into()));
        assert_eq!(
            source.identifier(),
            "s3://backups/billing/ (endpoint: http://minio:9000)"
        );

        let body = read_all(source.acquire().await.unwrap()).await;

        assert_eq!(body, b"newest");
        assert_eq!(
            source.identifier(),
            "s3://backups/billing/2026-10-18.dump (endpoint: http://minio:9000)"
        );
    }

    #[tokio::test]
    async fn test_exact_key_is_fetched() {
        let store = bucket(&[("app.dump", b"PGDMP"), ("zzz.dump", b"later")]).await;
        let source = S3Source::new(store, "backups", "app.dump", None);

        assert_eq!(read_all(source.acquire().await.unwrap()).await, b"PGDMP");
        assert_eq!(source.identifier(), "s3://backups/app.dump");
    }

    #[tokio::test]
    async fn test_empty_prefix_and_missing_key_are_environment_errors() {
        let store = bucket(&[("app.dump", b"PGDMP")]).await;

        let err = S3Source::new(store.clone(), "backups", "billing/", None)
            .acquire()
            .await
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), EXIT_ENVIRONMENT);
        assert!(err.to_string().contains("no objects found in s3://backups/billing/"));

        let err = S3Source::new(store, "backups", "gone.dump", None)
            .acquire()
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("failed to get object s3://backups/gone.dump"));
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let mut config = S3BackupConfig {
            endpoint: Some("http://minio:9000".into()),
            bucket: "backups".into(),
            region: "us-east-1".into(),
            access_key_env: "RESTORABLE_TEST_S3_UNSET_KEY".into(),
            secret_key_env: "RESTORABLE_TEST_S3_SECRET".into(),
            prefix: "billing/".into(),
        };
        let err = S3Source::from_config(&config).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("RESTORABLE_TEST_S3_UNSET_KEY is not set"));

        std::env::set_var("RESTORABLE_TEST_S3_KEY", "minioadmin");
        std::env::set_var("RESTORABLE_TEST_S3_SECRET", "minioadmin");
        config.access_key_env = "RESTORABLE_TEST_S3_KEY".into();
        let source = S3Source::from_config(&config).unwrap();
        assert_eq!(
            source.identifier(),
            "s3://backups/billing/ (endpoint: http://minio:9000)"
        );
    }
}
