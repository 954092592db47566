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

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use super::dispatch::{DispatchOutcome, EventHandler};
use crate::event::{Event, EventKind};
use crate::sampler::BatchFileName;
use crate::storage::ObjectStore;

/// Key prefix for files whose name does not follow the batch pattern.
pub const UNCLASSIFIED_PREFIX: &str = "Unclassified";

/// Destination key for a local batch file. Depends only on the file name,
/// so a redelivered event overwrites the same object.
pub fn object_key(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let folder = match BatchFileName::parse(file_name) {
        Some(batch) => batch.source_id,
        None => UNCLASSIFIED_PREFIX.to_string(),
    };
    Some(format!("{}/{}", folder, file_name))
}

/// Uploads BATCH_CREATED files to an object store.
pub struct UploadHandler {
    store: Arc<dyn ObjectStore>,
    max_retries: u32,
    archive_dir: Option<PathBuf>,
}

impl UploadHandler {
    pub fn new(store: Arc<dyn ObjectStore>, max_retries: u32, archive_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            max_retries,
            archive_dir,
        }
    }

    async fn archive(&self, path: &Path, dir: &Path) {
        let Some(file_name) = path.file_name() else {
            return;
        };
        let target = dir.join(file_name);

        if let Err(e) = fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "cannot create archive directory");
            return;
        }

        // rename fails across filesystems; fall back to copy + remove
        let moved = match fs::rename(path, &target).await {
            Ok(()) => Ok(()),
            Err(_) => match fs::copy(path, &target).await {
                Ok(_) => fs::remove_file(path).await,
                Err(e) => Err(e),
            },
        };

        match moved {
            Ok(()) => info!(from = %path.display(), to = %target.display(), "batch archived"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to archive batch"),
        }
    }
}

#[async_trait]
impl EventHandler for UploadHandler {
    fn name(&self) -> &str {
        "upload"
    }

    async fn handle(&self, event: &Event) -> DispatchOutcome {
        if event.kind != EventKind::BatchCreated {
            return DispatchOutcome::Rejected(format!(
                "{} events are not routed to the uploader",
                event.kind
            ));
        }

        let Some(path) = event.file_path() else {
            return DispatchOutcome::Rejected("missing file_path".to_string());
        };
        let Some(key) = object_key(&path) else {
            return DispatchOutcome::Rejected(format!(
                "no usable file name in '{}'",
                path.display()
            ));
        };

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return DispatchOutcome::Rejected(format!("'{}' is not a file", path.display()))
            }
            Err(e) => {
                return DispatchOutcome::Rejected(format!(
                    "batch file '{}' unavailable: {}",
                    path.display(),
                    e
                ))
            }
        }

        if let Err(e) = self
            .store
            .put_with_retry(&key, &path, self.max_retries)
            .await
        {
            return DispatchOutcome::Retryable(format!("{:#}", e));
        }

        info!(
            key = %key,
            backend = self.store.backend_type(),
            "batch uploaded"
        );

        if let Some(dir) = &self.archive_dir {
            self.archive(&path, dir).await;
        }

        DispatchOutcome::Delivered
    }
}
