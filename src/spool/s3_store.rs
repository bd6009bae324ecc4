//! S3 Object Store Implementation
//!
//! Amazon S3 and compatible services through the `object_store` crate.
//! The spool is thread based, so the store owns a small tokio runtime and
//! blocks on each request.
//!
//! One client is built lazily per (bucket, encryption) pair since
//! server-side encryption is client configuration in `object_store`.

use crate::spool::config::StoreConfig;
use crate::spool::object_store::{read_body, ObjectMetadata, ObjectStore, ObjectStoreError};
use bytes::Bytes;
use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey, S3EncryptionConfigKey};
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore as ObjectStoreTrait, PutPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

type ClientKey = (String, Option<String>);

pub struct S3ObjectStore {
    config: StoreConfig,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    handle: tokio::runtime::Handle,
    clients: Mutex<HashMap<ClientKey, Arc<dyn ObjectStoreTrait>>>,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("region", &self.config.region)
            .field("endpoint", &self.config.endpoint)
            .field("clients", &self.clients.lock().len())
            .finish()
    }
}

impl S3ObjectStore {
    /// Credentials come from the config, falling back to
    /// AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
    pub fn new(config: StoreConfig) -> Result<Self, ObjectStoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("spool-s3")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        info!(
            region = %config.region,
            endpoint = ?config.endpoint,
            max_connections = config.max_connections,
            allow_http = config.allow_http(),
            "S3 object store ready"
        );

        Ok(S3ObjectStore {
            config,
            runtime: Mutex::new(Some(runtime)),
            handle,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn client(
        &self,
        bucket: &str,
        sse: Option<&str>,
    ) -> Result<Arc<dyn ObjectStoreTrait>, ObjectStoreError> {
        let key = (bucket.to_string(), sse.map(str::to_string));
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client: Arc<dyn ObjectStoreTrait> = Arc::new(self.build_client(bucket, sse)?);
        clients.insert(key, client.clone());
        debug!(bucket = %bucket, sse = ?sse, "Built S3 client");
        Ok(client)
    }

    fn build_client(
        &self,
        bucket: &str,
        sse: Option<&str>,
    ) -> Result<object_store::aws::AmazonS3, ObjectStoreError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&self.config.region);

        // Custom endpoint for S3-compatible services (MinIO)
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        builder = builder.with_client_options(
            ClientOptions::new()
                .with_allow_http(self.config.allow_http())
                .with_pool_max_idle_per_host(self.config.max_connections),
        );

        let access_key = self
            .config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok());
        let secret_key = self
            .config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok());
        if let Some(access_key) = access_key {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = secret_key {
            builder = builder.with_secret_access_key(secret_key);
        }

        if let Some(sse) = sse {
            builder = builder.with_config(
                AmazonS3ConfigKey::Encryption(S3EncryptionConfigKey::ServerSideEncryption),
                sse,
            );
        }

        builder
            .build()
            .map_err(|e| ObjectStoreError::Other(format!("failed to create S3 client: {}", e)))
    }
}

fn map_error(err: object_store::Error) -> ObjectStoreError {
    match err {
        object_store::Error::NotFound { path, .. } => ObjectStoreError::NotFound(path),
        other => ObjectStoreError::Unavailable(other.to_string()),
    }
}

impl ObjectStore for S3ObjectStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        if self.runtime.lock().is_none() {
            return Err(ObjectStoreError::Unavailable("S3 store is shut down".to_string()));
        }
        let client = self.client(bucket, metadata.server_side_encryption.as_deref())?;
        let data = Bytes::from(read_body(body, metadata)?);
        let path = ObjectPath::from(key);

        self.handle
            .block_on(client.put(&path, PutPayload::from(data)))
            .map_err(map_error)?;
        Ok(())
    }

    fn shutdown(&self) {
        self.clients.lock().clear();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StoreConfig {
        StoreConfig {
            endpoint: Some("http://127.0.0.1:9".to_string()),
            access_key_id: Some("test".to_string()),
            secret_access_key: Some("test".to_string()),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_clients_cached_per_bucket_and_encryption() {
        let store = S3ObjectStore::new(config()).unwrap();

        store.client("a", None).unwrap();
        store.client("a", None).unwrap();
        store.client("a", Some("AES256")).unwrap();
        store.client("b", None).unwrap();
        assert_eq!(store.client_count(), 3);

        store.shutdown();
        assert_eq!(store.client_count(), 0);
        store.shutdown();
    }
}
