use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, ApiResult, AutoretouchClient, ExecutionStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CONCURRENCY: usize = 8;
const BATCH_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Runs images through a workflow and stores the results on disk.
#[derive(Clone)]
pub struct ImageProcessor {
    client: AutoretouchClient,
    organization_id: Option<Uuid>,
    labels: BTreeMap<String, String>,
    poll_interval: Duration,
    concurrency: usize,
}

/// Result of one file in a batch run.
#[derive(Debug)]
pub struct BatchItem {
    pub path: PathBuf,
    /// `Ok(false)` when the execution finished as `FAILED`.
    pub result: ApiResult<bool>,
}

impl ImageProcessor {
    pub fn new(client: AutoretouchClient) -> Self {
        Self {
            client,
            organization_id: None,
            labels: BTreeMap::new(),
            poll_interval: POLL_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_organization(mut self, organization_id: Option<Uuid>) -> Self {
        self.organization_id = organization_id;
        self
    }

    /// Labels attached to every execution started by this processor.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of images processed at the same time in a batch.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Start an execution for `image_path`, wait for it to finish and write
    /// the result to `output_dir` under the input file name.
    ///
    /// Returns `false` when the execution failed on the server.
    pub async fn process_image(
        &self,
        image_path: &Path,
        workflow_id: Uuid,
        output_dir: &Path,
    ) -> ApiResult<bool> {
        let organization = self.organization_id;
        let execution_id = self
            .client
            .create_execution_for_image_file(
                workflow_id,
                image_path,
                &self.labels,
                None,
                organization,
            )
            .await?;
        debug!(%execution_id, path = %image_path.display(), "execution started");

        let execution = loop {
            let execution = self
                .client
                .execution_details(execution_id, organization)
                .await?;
            if execution.status.is_terminal() {
                break execution;
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        if execution.status == ExecutionStatus::Failed {
            warn!(%execution_id, path = %image_path.display(), "execution failed");
            return Ok(false);
        }

        let result = match execution.result_path.as_deref() {
            Some(result_path) => self.client.download_result(result_path, organization).await?,
            None => {
                self.client
                    .download_result_blocking(execution_id, organization)
                    .await?
            }
        };

        let file_name = image_path
            .file_name()
            .ok_or_else(|| ApiError::MissingFileName(image_path.display().to_string()))?;
        tokio::fs::create_dir_all(output_dir).await?;
        let target = output_dir.join(file_name);
        tokio::fs::write(&target, result).await?;
        info!(%execution_id, target = %target.display(), "result written");
        Ok(true)
    }

    /// Process every `.jpg`, `.jpeg` and `.png` file directly inside
    /// `image_dir`. Items are returned in completion order.
    pub async fn process_batch(
        &self,
        workflow_id: Uuid,
        image_dir: &Path,
        target_dir: &Path,
    ) -> ApiResult<Vec<BatchItem>> {
        let images = batch_images(image_dir).await?;
        info!(count = images.len(), dir = %image_dir.display(), "processing batch");

        let items = stream::iter(images)
            .map(|path| async move {
                let result = self.process_image(&path, workflow_id, target_dir).await;
                if let Err(err) = &result {
                    warn!(path = %path.display(), error = %err, "image processing failed");
                }
                BatchItem { path, result }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;
        Ok(items)
    }
}

async fn batch_images(image_dir: &Path) -> ApiResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(image_dir).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_batch_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn is_batch_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| BATCH_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{CredentialManager, OAuthClient};
    use crate::config::ApiConfig;
    use httpmock::prelude::*;

    const ORG: &str = "9f8e7d6c-5b4a-4392-8170-6f5e4d3c2b1a";
    const WORKFLOW: &str = "0b5e2f4a-8c1d-4e0f-9a3b-6d7c8e9f0a1b";
    const EXECUTION: &str = "7a1c4d4e-5f27-4a55-9d4d-3f7f0d7e8a11";

    fn processor(server: &MockServer) -> ImageProcessor {
        let config = ApiConfig::new(
            &server.base_url(),
            &server.base_url(),
            "client",
            "offline_access",
            "https://api.example.com",
        )
        .unwrap();
        let manager = CredentialManager::new(OAuthClient::new(config.clone()).unwrap())
            .with_refresh_token("refresh")
            .with_persistence(false)
            .with_device_flow(false);
        let client = AutoretouchClient::new(config, Arc::new(manager)).unwrap();
        ImageProcessor::new(client)
            .with_organization(Some(Uuid::parse_str(ORG).unwrap()))
            .with_poll_interval(Duration::from_millis(10))
    }

    fn mock_backend(server: &MockServer, status: &str) {
        server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "access",
                "expires_in": 3600
            }));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/workflow/execution/create")
                .query_param("workflow", WORKFLOW)
                .query_param("organization", ORG);
            then.status(201).body(EXECUTION);
        });
        let details = serde_json::json!({
            "id": EXECUTION,
            "workflow": WORKFLOW,
            "organizationId": ORG,
            "status": status,
            "resultPath": "/image/def/result.png"
        });
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v1/workflow/execution/{EXECUTION}"));
            then.status(200).json_body_obj(&details);
        });
    }

    #[tokio::test]
    async fn completed_execution_writes_result_under_input_name() {
        let server = MockServer::start();
        mock_backend(&server, "COMPLETED");
        let download = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/image/def/result.png")
                .query_param("organization", ORG);
            then.status(200).body("retouched");
        });

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let image = input.path().join("shoe.jpg");
        std::fs::write(&image, b"raw").unwrap();
        let target_dir = output.path().join("nested");

        let ok = processor(&server)
            .process_image(&image, Uuid::parse_str(WORKFLOW).unwrap(), &target_dir)
            .await
            .unwrap();

        assert!(ok);
        download.assert();
        assert_eq!(
            std::fs::read(target_dir.join("shoe.jpg")).unwrap(),
            b"retouched"
        );
    }

    #[tokio::test]
    async fn failed_execution_returns_false_without_download() {
        let server = MockServer::start();
        mock_backend(&server, "FAILED");
        let download = server.mock(|when, then| {
            when.method(GET).path("/v1/image/def/result.png");
            then.status(200).body("retouched");
        });

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let image = input.path().join("shoe.png");
        std::fs::write(&image, b"raw").unwrap();

        let ok = processor(&server)
            .process_image(&image, Uuid::parse_str(WORKFLOW).unwrap(), output.path())
            .await
            .unwrap();

        assert!(!ok);
        download.assert_hits(0);
        assert!(!output.path().join("shoe.png").exists());
    }

    #[tokio::test]
    async fn batch_processes_only_supported_images() {
        let server = MockServer::start();
        mock_backend(&server, "COMPLETED");
        server.mock(|when, then| {
            when.method(GET).path("/v1/image/def/result.png");
            then.status(200).body("retouched");
        });

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for name in ["a.jpg", "b.JPEG", "c.png", "notes.txt"] {
            std::fs::write(input.path().join(name), b"raw").unwrap();
        }
        std::fs::create_dir(input.path().join("sub.png")).unwrap();

        let mut items = processor(&server)
            .with_concurrency(2)
            .process_batch(Uuid::parse_str(WORKFLOW).unwrap(), input.path(), output.path())
            .await
            .unwrap();
        items.sort_by(|a, b| a.path.cmp(&b.path));

        let names: Vec<_> = items
            .iter()
            .map(|item| item.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.jpg", "b.JPEG", "c.png"]);
        assert!(items.iter().all(|item| matches!(item.result, Ok(true))));
        assert!(output.path().join("c.png").exists());
        assert!(!output.path().join("notes.txt").exists());
    }

    #[test]
    fn batch_extension_filter() {
        assert!(is_batch_image(Path::new("x/a.jpg")));
        assert!(is_batch_image(Path::new("a.PNG")));
        assert!(!is_batch_image(Path::new("a.webp")));
        assert!(!is_batch_image(Path::new("jpg")));
    }
}
