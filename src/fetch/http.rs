//! Streaming HTTP(S) downloads.

use std::path::Path;

use reqwest::header::AUTHORIZATION;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::{HttpAuth, partial_path};
use crate::error::FetchError;

/// GET `url` into `target`, writing the body chunk by chunk.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    auth: &HttpAuth<'_>,
    target: &Path,
) -> Result<(), FetchError> {
    let http_err = |reason: String| FetchError::Http {
        url: url.to_string(),
        reason,
    };

    let mut request = client.get(url);
    request = match auth {
        HttpAuth::Basic { login, password } => request.basic_auth(login, Some(password)),
        HttpAuth::Header(value) => request.header(AUTHORIZATION, *value),
        HttpAuth::Custom(headers) => headers
            .iter()
            .fold(request, |req, (name, value)| req.header(name, value)),
        HttpAuth::Anonymous => request,
    };

    let mut resp = request.send().await.map_err(|e| http_err(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(http_err(format!("server returned {status}")));
    }

    let partial = partial_path(target);
    let result = async {
        let mut file = File::create(&partial)
            .await
            .map_err(|e| FetchError::io(&partial, e))?;
        while let Some(chunk) = resp.chunk().await.map_err(|e| http_err(e.to_string()))? {
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
