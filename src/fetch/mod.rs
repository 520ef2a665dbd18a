//! File acquisition: materialize a task's `fetchFiles` inside its working
//! directory before execution.
//!
//! For every reference the target path is resolved and checked against the
//! working directory first; an escaping path fails the whole task. An
//! existing target is left untouched. Otherwise exactly one source is used,
//! by precedence: git clone, object store, HTTP GET.

pub mod git;
pub mod http;
pub mod s3;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::protocol::FileReference;
use crate::error::FetchError;

/// Connect timeout for HTTP downloads.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a file reference comes from, after precedence is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Source<'a> {
    Git {
        url: &'a str,
    },
    ObjectStore {
        locator: &'a str,
        credentials: Option<(&'a str, &'a str)>,
    },
    Http {
        url: &'a str,
        auth: HttpAuth<'a>,
    },
}

/// Exactly one auth strategy for an HTTP download.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpAuth<'a> {
    Basic { login: &'a str, password: &'a str },
    Header(&'a str),
    Custom(&'a BTreeMap<String, String>),
    Anonymous,
}

/// Pick the acquisition method for a reference.
pub fn select_source(reference: &FileReference) -> Option<Source<'_>> {
    let login_password = match (&reference.http_login, &reference.http_password) {
        (Some(login), Some(password)) if !login.is_empty() && !password.is_empty() => {
            Some((login.as_str(), password.as_str()))
        }
        _ => None,
    };

    if let Some(url) = non_empty(&reference.git_clone) {
        return Some(Source::Git { url });
    }
    if let Some(locator) = non_empty(&reference.s3_file) {
        return Some(Source::ObjectStore {
            locator,
            credentials: login_password,
        });
    }
    let url = non_empty(&reference.get)?;
    let auth = if let Some((login, password)) = login_password {
        HttpAuth::Basic { login, password }
    } else if let Some(header) = non_empty(&reference.http_auth_header) {
        HttpAuth::Header(header)
    } else if let Some(headers) = reference.custom_header.as_ref().filter(|h| !h.is_empty()) {
        HttpAuth::Custom(headers)
    } else {
        HttpAuth::Anonymous
    };
    Some(Source::Http { url, auth })
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Normalize `.` and `..` lexically, without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                } else if !components
                    .last()
                    .is_some_and(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
                {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest,
/// so symlinks inside the working directory cannot point the target elsewhere.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = ancestor.canonicalize() {
            let mut result = canonical;
            for part in tail.into_iter().rev() {
                result = result.join(part);
            }
            return result;
        }
        if let Some(name) = ancestor.file_name() {
            tail.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolve `relative` against `workdir`, rejecting anything that lands outside
/// it (or on the working directory itself).
pub fn resolve_target(workdir: &Path, relative: &str) -> Result<PathBuf, FetchError> {
    let base = workdir
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(workdir));
    let joined = normalize_lexical(&base.join(relative));
    let checked = canonicalize_existing_prefix(&joined);

    if checked == base || !checked.starts_with(&base) {
        return Err(FetchError::PathEscapes(relative.to_string()));
    }
    Ok(joined)
}

/// Runs file acquisition for tasks.
#[derive(Clone)]
pub struct FileFetcher {
    http: reqwest::Client,
}

impl FileFetcher {
    /// `verify_tls = false` accepts self-signed and otherwise invalid
    /// certificates for HTTP downloads.
    pub fn new(verify_tls: bool) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Http {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    /// Acquire every reference in order. The first failure aborts the rest.
    pub async fn prepare(
        &self,
        workdir: &Path,
        references: &[FileReference],
    ) -> Result<(), FetchError> {
        for reference in references {
            self.acquire(workdir, reference).await?;
        }
        Ok(())
    }

    /// Acquire one reference. Returns `false` when the target already existed.
    pub async fn acquire(
        &self,
        workdir: &Path,
        reference: &FileReference,
    ) -> Result<bool, FetchError> {
        let target = resolve_target(workdir, &reference.path)?;

        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| FetchError::io(&target, e))?
        {
            debug!(path = %target.display(), "Target exists, skipping acquisition");
            return Ok(false);
        }

        let source = select_source(reference).ok_or_else(|| FetchError::NoMethod {
            path: reference.path.clone(),
        })?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }

        match source {
            Source::Git { url } => {
                info!(url, path = %target.display(), "Cloning repository");
                git::clone(url, &target).await?;
            }
            Source::ObjectStore {
                locator,
                credentials,
            } => {
                info!(locator, path = %target.display(), "Downloading from object store");
                s3::download(locator, credentials, &target).await?;
            }
            Source::Http { url, auth } => {
                info!(url, path = %target.display(), "Downloading via HTTP GET");
                http::download(&self.http, url, &auth, &target).await?;
            }
        }
        Ok(true)
    }
}

/// Sibling path used while a download is in flight, so a partial file never
/// satisfies the existence check on a later attempt.
pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}
