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

// Object store trait for batch uploads

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Durable object store the upload consumer delivers batch files to.
///
/// Writes are keyed: putting the same key twice overwrites the object, which
/// keeps redelivered batches idempotent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Initialize the backend (check bucket, create folder markers)
    async fn initialize(&self) -> Result<()>;

    /// Upload a local file under `key`
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Upload with bounded retries and exponential backoff
    ///
    /// # Arguments
    /// * `key` - Destination object key
    /// * `path` - Local file to upload
    /// * `max_retries` - Retries after the first attempt
    async fn put_with_retry(&self, key: &str, path: &Path, max_retries: u32) -> Result<()> {
        use tokio::time::{sleep, Duration};
        use tracing::{info, warn};

        let mut attempt = 0;
        let mut delay = Duration::from_millis(100);

        loop {
            match self.put_file(key, path).await {
                Ok(_) => {
                    if attempt > 0 {
                        info!("Uploaded '{}' after {} retries", key, attempt);
                    }
                    return Ok(());
                }
                Err(e) if attempt < max_retries => {
                    warn!(
                        "Upload of '{}' failed (attempt {}/{}): {:#}. Retrying in {:?}",
                        key,
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    delay *= 2; // Exponential backoff
                    delay = delay.min(Duration::from_secs(30)); // Cap at 30 seconds
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Upload of '{}' failed after {} attempts: {:#}",
                        key,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Health check
    async fn health_check(&self) -> Result<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}
