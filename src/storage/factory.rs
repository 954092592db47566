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

// Backend factory for creating object stores from configuration

use super::backend::ObjectStore;
use super::filesystem::FilesystemBackend;
use super::s3::S3Backend;
use crate::config::StorageConfig;
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;

pub struct BackendFactory;

impl BackendFactory {
    /// Create object store from configuration
    pub async fn create(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
        match config.backend.as_str() {
            "s3" => {
                let backend_config = config
                    .backend_config
                    .as_s3()
                    .ok_or_else(|| anyhow!("S3 config missing"))?;

                let backend = S3Backend::new(backend_config.clone()).await?;
                Ok(Arc::new(backend))
            }

            "filesystem" => {
                let backend_config = config
                    .backend_config
                    .as_filesystem()
                    .ok_or_else(|| anyhow!("Filesystem config missing"))?;

                let backend = FilesystemBackend::new(backend_config.clone())?;
                Ok(Arc::new(backend))
            }

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: s3, filesystem",
                unknown
            ),
        }
    }
}
