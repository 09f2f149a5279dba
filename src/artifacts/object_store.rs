//! S3-compatible artifact store.
//!
//! The SDK is async; every call blocks on a private runtime so the store fits
//! the synchronous [`ArtifactStore`] contract used by executor workers.

use std::future::Future;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::debug;

use crate::config::S3Config;

use super::{ArtifactError, ArtifactRef, ArtifactStore, WriteReservations, validate_name};

pub struct ObjectStoreArtifactStore {
    client: Client,
    bucket: String,
    prefix: String,
    runtime: Option<Arc<Runtime>>,
    reservations: WriteReservations,
}

impl Drop for ObjectStoreArtifactStore {
    fn drop(&mut self) {
        // A runtime must not be dropped from inside another runtime's context.
        if let Some(runtime) = self.runtime.take() {
            let _ = std::thread::spawn(move || drop(runtime));
        }
    }
}

impl ObjectStoreArtifactStore {
    pub fn connect(config: &S3Config) -> Result<Self, ArtifactError> {
        if config.bucket.trim().is_empty() {
            return Err(ArtifactError::Backend("bucket must be set".to_string()));
        }
        let prefix = normalize_prefix(config.prefix.as_deref().unwrap_or(""))?;
        let runtime = Runtime::new().map_err(|err| ArtifactError::Backend(err.to_string()))?;
        let region = config.region.clone();
        let endpoint = config.endpoint.clone();
        let shared_config = block_on(&runtime, async move {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = region {
                loader = loader.region(Region::new(region));
            }
            if let Some(endpoint) = endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            Ok(loader.load().await)
        })?;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            prefix,
            runtime: Some(Arc::new(runtime)),
            reservations: WriteReservations::default(),
        })
    }

    fn key_for(&self, name: &str) -> Result<String, ArtifactError> {
        validate_name(name)?;
        Ok(format!("{}{}", self.prefix, name))
    }

    fn runtime(&self) -> Result<&Runtime, ArtifactError> {
        self.runtime
            .as_deref()
            .ok_or_else(|| ArtifactError::Backend("object store runtime closed".to_string()))
    }
}

impl ArtifactStore for ObjectStoreArtifactStore {
    fn exists(&self, name: &str) -> Result<bool, ArtifactError> {
        let key = self.key_for(name)?;
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        block_on(self.runtime()?, async move {
            match client.head_object().bucket(bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(err) => {
                    let service = err.into_service_error();
                    if service.is_not_found() {
                        Ok(false)
                    } else {
                        Err(ArtifactError::Backend(service.to_string()))
                    }
                }
            }
        })
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, ArtifactError> {
        let key = self.key_for(name)?;
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let name = name.to_string();
        block_on(self.runtime()?, async move {
            let output = match client.get_object().bucket(bucket).key(key).send().await {
                Ok(output) => output,
                Err(err) => {
                    let service = err.into_service_error();
                    return Err(if service.is_no_such_key() {
                        ArtifactError::NotFound { name }
                    } else {
                        ArtifactError::Backend(service.to_string())
                    });
                }
            };
            let body = output
                .body
                .collect()
                .await
                .map_err(|err| ArtifactError::Backend(err.to_string()))?;
            Ok(body.into_bytes().to_vec())
        })
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), ArtifactError> {
        let key = self.key_for(name)?;
        let _reservation = self.reservations.reserve(name)?;
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let body = ByteStream::from(data.to_vec());
        block_on(self.runtime()?, async move {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|err| ArtifactError::Backend(err.to_string()))?;
            Ok(())
        })?;
        debug!(artifact = name, bytes = data.len(), "Artifact uploaded");
        Ok(())
    }

    fn locate(&self, name: &str) -> Result<ArtifactRef, ArtifactError> {
        let key = self.key_for(name)?;
        Ok(ArtifactRef {
            name: name.to_string(),
            location_hint: format!("s3://{}/{}", self.bucket, key),
        })
    }
}

fn block_on<F, T>(runtime: &Runtime, future: F) -> Result<T, ArtifactError>
where
    F: Future<Output = Result<T, ArtifactError>> + Send + 'static,
    T: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) {
            return tokio::task::block_in_place(|| handle.block_on(future));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        std::thread::spawn(move || {
            let result = Runtime::new()
                .map_err(|err| ArtifactError::Backend(err.to_string()))
                .and_then(|runtime| runtime.block_on(future));
            let _ = tx.send(result);
        });
        return rx.recv().unwrap_or_else(|_| {
            Err(ArtifactError::Backend(
                "object store thread terminated".to_string(),
            ))
        });
    }
    runtime.block_on(future)
}

fn normalize_prefix(raw: &str) -> Result<String, ArtifactError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    validate_name(trimmed)?;
    Ok(format!("{trimmed}/"))
}
