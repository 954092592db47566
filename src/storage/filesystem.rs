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

// Filesystem backend implementation

use super::backend::ObjectStore;
use crate::config::FilesystemConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Object store rooted at a local directory; keys map to relative paths.
pub struct FilesystemBackend {
    base_path: PathBuf,
    folders: Vec<String>,
}

impl FilesystemBackend {
    pub fn new(config: FilesystemConfig) -> Result<Self> {
        info!(
            "Initializing filesystem backend at: {}",
            config.base_path.display()
        );

        Ok(Self {
            base_path: config.base_path,
            folders: config.folders,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve an object key to a path under the base directory
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid object key: '{}'", key);
        }
        Ok(self.base_path.join(relative))
    }

    /// Ensure base directory exists
    async fn ensure_base_directory(&self) -> Result<()> {
        if !self.base_path.exists() {
            info!("Creating base directory: {}", self.base_path.display());
            fs::create_dir_all(&self.base_path)
                .await
                .context("Failed to create base directory")?;
        } else {
            info!(
                "Base directory already exists: {}",
                self.base_path.display()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    async fn initialize(&self) -> Result<()> {
        self.ensure_base_directory().await?;

        for folder in &self.folders {
            let dir = self.object_path(folder.trim_end_matches('/'))?;
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create folder '{}'", folder))?;
            debug!("Folder '{}' ready", folder);
        }
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create object directory")?;
        }

        let data = fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        // Write beside the target and rename so a reader never sees half an object
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{}.part", file_name));

        let mut file = fs::File::create(&temp)
            .await
            .with_context(|| format!("Failed to create file: {}", temp.display()))?;
        file.write_all(&data).await.context("Failed to write data")?;
        file.flush().await.context("Failed to flush data")?;
        file.sync_all().await.context("Failed to sync data")?;
        drop(file);

        fs::rename(&temp, &target)
            .await
            .with_context(|| format!("Failed to move object into place: {}", target.display()))?;

        info!(
            "Stored {} bytes as '{}' in {}",
            data.len(),
            key,
            self.base_path.display()
        );

        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        // Check if base directory is accessible and writable
        match fs::metadata(&self.base_path).await {
            Ok(metadata) if metadata.is_dir() => {
                let test_file = self.base_path.join(".health_check_test");
                match fs::File::create(&test_file).await {
                    Ok(mut f) => {
                        if let Err(e) = f.write_all(b"test").await {
                            warn!("Health check failed - cannot write: {}", e);
                            return Ok(false);
                        }
                        if let Err(e) = fs::remove_file(&test_file).await {
                            debug!(
                                "Health check could not remove {}: {}",
                                test_file.display(),
                                e
                            );
                        }
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Health check failed - cannot create file: {}", e);
                        Ok(false)
                    }
                }
            }
            Ok(_) => {
                warn!(
                    "Health check failed - base path is not a directory: {}",
                    self.base_path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access base path {}: {}",
                    self.base_path.display(),
                    e
                );
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "filesystem"
    }
}
