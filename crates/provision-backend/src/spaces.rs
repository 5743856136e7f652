//! Archive store backed by an S3-compatible Spaces bucket
//!
//! Archives live at `https://{bucket}.{region}.digitaloceanspaces.com/{prefix}/{id}.tar.gz`
//! and are public-read, so probing is a plain HTTP `HEAD`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ArchiveError;
use crate::traits::ArchiveStore;

/// Spaces bucket location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpacesConfig {
    pub bucket: String,
    pub region: String,
    /// Key prefix under which archives are stored
    pub prefix: String,
}

impl SpacesConfig {
    pub fn new(bucket: &str, region: &str) -> Self {
        SpacesConfig {
            bucket: bucket.to_string(),
            region: region.to_string(),
            prefix: "snapshots".to_string(),
        }
    }

    /// Read `SPACES_BUCKET` / `SPACES_REGION`; `None` unless both are set.
    pub fn from_env() -> Option<Self> {
        let bucket = std::env::var("SPACES_BUCKET").ok().filter(|b| !b.is_empty())?;
        let region = std::env::var("SPACES_REGION").ok().filter(|r| !r.is_empty())?;
        Some(Self::new(&bucket, &region))
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_matches('/').to_string();
        self
    }

    pub fn endpoint(&self) -> String {
        format!(
            "https://{}.{}.digitaloceanspaces.com",
            self.bucket, self.region
        )
    }
}

/// HTTP client for the archive bucket
pub struct SpacesArchiveStore {
    config: SpacesConfig,
    http_client: reqwest::Client,
}

impl SpacesArchiveStore {
    pub fn new(config: SpacesConfig) -> Result<Self, ArchiveError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("provision-backend/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(SpacesArchiveStore {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &SpacesConfig {
        &self.config
    }
}

#[async_trait]
impl ArchiveStore for SpacesArchiveStore {
    fn archive_url(&self, archive_id: &str) -> String {
        if self.config.prefix.is_empty() {
            format!("{}/{}.tar.gz", self.config.endpoint(), archive_id)
        } else {
            format!(
                "{}/{}/{}.tar.gz",
                self.config.endpoint(),
                self.config.prefix,
                archive_id
            )
        }
    }

    async fn probe(&self, archive_id: &str) -> Result<Option<u64>, ArchiveError> {
        let url = self.archive_url(archive_id);
        debug!(url = %url, "probing archive");

        let response = self.http_client.head(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ArchiveError::NotFound(archive_id.to_string()));
        }
        if !status.is_success() {
            return Err(ArchiveError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.content_length())
    }
}
