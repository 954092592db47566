// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// S3 backend implementation

use super::backend::ObjectStore;
use crate::config::S3Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::{debug, info, warn};

/// S3 bucket store. Credentials come from the default AWS provider chain
/// (environment, profile or instance role).
pub struct S3Backend {
    client: Client,
    bucket: String,
    folders: Vec<String>,
}

impl S3Backend {
    pub async fn new(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let client = match &config.endpoint {
            Some(endpoint) => {
                info!("Using custom S3 endpoint: {}", endpoint);
                let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                    .endpoint_url(endpoint)
                    .force_path_style(true) // MinIO and friends
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&sdk_config),
        };

        Ok(Self::with_client(client, config.bucket, config.folders))
    }

    /// Create with an explicit client
    pub fn with_client(client: Client, bucket: impl Into<String>, folders: Vec<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            folders,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_folder(&self, folder: &str) -> Result<()> {
        let key = folder_marker(folder);

        let exists = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .is_ok();

        if exists {
            debug!("Folder '{}' already exists in '{}'", key, self.bucket);
            return Ok(());
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to create folder '{}': {}", key, e))?;

        info!("Created folder '{}' in bucket '{}'", key, self.bucket);
        Ok(())
    }
}

/// Folder marker key: always exactly one trailing slash
pub fn folder_marker(folder: &str) -> String {
    format!("{}/", folder.trim_end_matches('/'))
}

#[async_trait]
impl ObjectStore for S3Backend {
    async fn initialize(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| anyhow!("Bucket '{}' is not reachable: {}", self.bucket, e))?;

        info!("Connected to bucket '{}'", self.bucket);

        for folder in &self.folders {
            self.ensure_folder(folder).await?;
        }
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("S3 upload of '{}' failed: {}", key, e))?;

        info!("Uploaded {} to s3://{}/{}", path.display(), self.bucket, key);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Health check failed for bucket '{}': {}", self.bucket, e);
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_marker() {
        assert_eq!(folder_marker("BFA1"), "BFA1/");
        assert_eq!(folder_marker("BFA1/"), "BFA1/");
        assert_eq!(folder_marker("BFA1//"), "BFA1/");
    }
}
