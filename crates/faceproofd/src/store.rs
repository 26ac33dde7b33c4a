//! Signed-URL file store contract.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid storage path {0:?}")]
    InvalidPath(String),
    #[error("file store misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Turns storage paths into time-limited URLs.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn signed_url(
        &self,
        path: &str,
        permission: Permission,
        ttl: Duration,
    ) -> Result<String, StoreError>;
}

/// Joins storage paths onto a fixed base URL and appends the permission and
/// expiry as query parameters. Suitable for stores that authorise by
/// network location rather than by signature.
#[derive(Debug, Clone)]
pub struct BaseUrlFileStore {
    base: Url,
}

impl BaseUrlFileStore {
    pub fn new(base: &str) -> Result<Self, StoreError> {
        let mut base = Url::parse(base).map_err(|e| StoreError::Config(format!("{base:?}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(StoreError::Config(format!(
                "unsupported scheme {:?}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }
}

#[async_trait]
impl FileStore for BaseUrlFileStore {
    async fn signed_url(
        &self,
        path: &str,
        permission: Permission,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|seg| seg == "..") {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut url = self
            .base
            .join(relative)
            .map_err(|_| StoreError::InvalidPath(path.to_string()))?;

        let expires = chrono::Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        url.query_pairs_mut()
            .append_pair("permission", permission.as_str())
            .append_pair("expires", &expires.timestamp().to_string());
        Ok(url.into())
    }
}
