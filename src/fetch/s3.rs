//! S3-compatible object-store downloads.
//!
//! Locators are either `s3://bucket/key` or an endpoint URL in path style,
//! `https://endpoint/bucket/key`, where scheme and host become the endpoint
//! override. Explicit credentials apply to this request only; otherwise the
//! ambient AWS environment/role credentials are used.

use std::path::Path;

use futures::StreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::partial_path;
use crate::error::FetchError;

/// Parsed object-store locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub key: String,
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let invalid = |reason: &str| FetchError::InvalidLocator {
            locator: raw.to_string(),
            reason: reason.to_string(),
        };

        let (endpoint, path) = if let Some(rest) = raw.strip_prefix("s3://") {
            (None, rest.to_string())
        } else {
            let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
            let host = url
                .host_str()
                .ok_or_else(|| invalid("URL has no host"))?;
            let endpoint = match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            };
            (Some(endpoint), url.path().trim_start_matches('/').to_string())
        };

        let (bucket, key) = path.split_once('/').unwrap_or((path.as_str(), ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        if key.is_empty() {
            return Err(invalid("missing object key"));
        }
        Ok(Self {
            endpoint,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Store builder for `locator`. Explicit credentials replace the ambient AWS
/// configuration entirely; only the region is still taken from the environment.
fn store_builder(locator: &Locator, credentials: Option<(&str, &str)>) -> AmazonS3Builder {
    let mut builder = match credentials {
        Some((access_key, secret_key)) => {
            let mut builder = AmazonS3Builder::new()
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
            let region =
                std::env::var("AWS_REGION").or_else(|_| std::env::var("AWS_DEFAULT_REGION"));
            if let Ok(region) = region {
                builder = builder.with_region(region);
            }
            builder
        }
        None => AmazonS3Builder::from_env(),
    }
    .with_bucket_name(&locator.bucket);
    if let Some(endpoint) = &locator.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }
    builder
}

pub async fn download(
    locator: &str,
    credentials: Option<(&str, &str)>,
    target: &Path,
) -> Result<(), FetchError> {
    let parsed = Locator::parse(locator)?;
    let store_err = |reason: String| FetchError::ObjectStore {
        locator: locator.to_string(),
        reason,
    };

    let store = store_builder(&parsed, credentials)
        .build()
        .map_err(|e| store_err(e.to_string()))?;

    let object = store
        .get(&object_store::path::Path::from(parsed.key.as_str()))
        .await
        .map_err(|e| store_err(e.to_string()))?;
    let mut stream = object.into_stream();

    let partial = partial_path(target);
    let result = async {
        let mut file = File::create(&partial)
            .await
            .map_err(|e| FetchError::io(&partial, e))?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| store_err(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(&partial, e))?;
        }
        file.flush().await.map_err(|e| FetchError::io(&partial, e))?;
        tokio::fs::rename(&partial, target)
            .await
            .map_err(|e| FetchError::io(target, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}
