use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{CredentialManager, Credentials};
use crate::config::{ApiConfig, DEFAULT_USER_AGENT};

use super::{ApiError, ApiResult, Organization, Page, Workflow, WorkflowExecution};

const PAGE_LIMIT: &str = "50";
const PAGE_OFFSET: &str = "0";

/// REST client for the autoRetouch API.
///
/// Every authenticated call goes through [`AutoretouchClient::authorized`],
/// which asks the shared [`CredentialManager`] for a valid token right before
/// the request is sent.
#[derive(Clone)]
pub struct AutoretouchClient {
    http: Client,
    config: ApiConfig,
    credentials: Arc<CredentialManager>,
    organization_id: Option<Uuid>,
}

impl AutoretouchClient {
    pub fn new(config: ApiConfig, credentials: Arc<CredentialManager>) -> ApiResult<Self> {
        Self::with_user_agent(config, credentials, DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(
        config: ApiConfig,
        credentials: Arc<CredentialManager>,
        user_agent: &str,
    ) -> ApiResult<Self> {
        let http = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            http,
            config,
            credentials,
            organization_id: None,
        })
    }

    /// Organization used for every call, overriding per-call values.
    pub fn with_default_organization(mut self, organization_id: Option<Uuid>) -> Self {
        self.organization_id = organization_id;
        self
    }

    pub fn default_organization(&self) -> Option<Uuid> {
        self.organization_id
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub async fn login(&self) -> ApiResult<Credentials> {
        Ok(self.credentials.ensure_valid().await?)
    }

    pub async fn logout(&self) -> ApiResult<StatusCode> {
        Ok(self.credentials.revoke().await?)
    }

    /// Status of the unauthenticated health endpoint; non-2xx is not an error here.
    pub async fn health(&self) -> ApiResult<StatusCode> {
        let response = self.http.get(self.config.root_url("health")?).send().await?;
        Ok(response.status())
    }

    /// Health endpoint below the versioned API root (`{base_url}/v1/health`).
    pub async fn health_current(&self) -> ApiResult<StatusCode> {
        let response = self.http.get(self.config.api_url("health")?).send().await?;
        Ok(response.status())
    }

    pub async fn organizations(&self) -> ApiResult<Page<Organization>> {
        let request = self
            .http
            .get(self.config.api_url("organization")?)
            .query(&[("limit", PAGE_LIMIT), ("offset", PAGE_OFFSET)]);
        let response = self.send_authorized(request).await?;
        parse_json(response).await
    }

    pub async fn workflows(&self, organization_id: Option<Uuid>) -> ApiResult<Page<Workflow>> {
        let organization = self.organization(organization_id)?;
        let request = self.http.get(self.config.api_url("workflow")?).query(&[
            ("limit", PAGE_LIMIT),
            ("offset", PAGE_OFFSET),
            ("organization", organization.as_str()),
        ]);
        let response = self.send_authorized(request).await?;
        parse_json(response).await
    }

    pub async fn workflow_executions(
        &self,
        workflow_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Page<WorkflowExecution>> {
        let organization = self.organization(organization_id)?;
        let workflow = workflow_id.to_string();
        let request = self
            .http
            .get(self.config.api_url("workflow/execution")?)
            .query(&[
                ("workflow", workflow.as_str()),
                ("limit", PAGE_LIMIT),
                ("offset", PAGE_OFFSET),
                ("organization", organization.as_str()),
            ]);
        let response = self.send_authorized(request).await?;
        parse_json(response).await
    }

    /// Upload an image file and return its content hash.
    pub async fn upload_image(
        &self,
        path: &Path,
        organization_id: Option<Uuid>,
    ) -> ApiResult<String> {
        let (bytes, name) = read_image(path).await?;
        let mime = content_type_for(&name);
        self.upload_image_bytes(bytes, &name, mime, organization_id)
            .await
    }

    pub async fn upload_image_bytes(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        organization_id: Option<Uuid>,
    ) -> ApiResult<String> {
        let organization = self.organization(organization_id)?;
        let form = image_form(bytes, file_name, mime_type)?;
        let request = self
            .http
            .post(self.config.api_url("upload")?)
            .query(&[("organization", organization.as_str())])
            .multipart(form);
        let response = self.send_authorized(request).await?;
        let hash = trim_body(&response.text().await?);
        debug!(%hash, file_name, "image uploaded");
        Ok(hash)
    }

    /// Start an execution by uploading the image together with the request.
    pub async fn create_execution_for_image_file(
        &self,
        workflow_id: Uuid,
        path: &Path,
        labels: &BTreeMap<String, String>,
        workflow_version: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Uuid> {
        let (bytes, name) = read_image(path).await?;
        let form = image_form(bytes, &name, content_type_for(&name))?;
        let request = self
            .http
            .post(self.config.api_url("workflow/execution/create")?)
            .query(&self.create_query(workflow_id, workflow_version, labels, organization_id)?)
            .multipart(form);
        let response = self.send_authorized(request).await?;
        parse_execution_id(&response.text().await?)
    }

    /// Start an execution for an image that was uploaded before.
    pub async fn create_execution_for_image_reference(
        &self,
        workflow_id: Uuid,
        content_hash: &str,
        image_name: &str,
        labels: &BTreeMap<String, String>,
        workflow_version: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Uuid> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ImageReference<'a> {
            name: &'a str,
            content_hash: &'a str,
            content_type: &'a str,
        }

        #[derive(Serialize)]
        struct CreateRequest<'a> {
            image: ImageReference<'a>,
            #[serde(skip_serializing_if = "Option::is_none")]
            labels: Option<&'a BTreeMap<String, String>>,
        }

        let body = CreateRequest {
            image: ImageReference {
                name: image_name,
                content_hash,
                content_type: content_type_for(image_name),
            },
            labels: (!labels.is_empty()).then_some(labels),
        };
        let empty = BTreeMap::new();
        let request = self
            .http
            .post(self.config.api_url("workflow/execution/create")?)
            .query(&self.create_query(workflow_id, workflow_version, &empty, organization_id)?)
            .json(&body);
        let response = self.send_authorized(request).await?;
        parse_execution_id(&response.text().await?)
    }

    pub async fn execution_details(
        &self,
        execution_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> ApiResult<WorkflowExecution> {
        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .get(
                self.config
                    .api_url(&format!("workflow/execution/{execution_id}"))?,
            )
            .query(&[("organization", organization.as_str())]);
        let response = self.send_authorized(request).await?;
        parse_json(response).await
    }

    /// Raw body of the execution status event stream.
    pub async fn execution_status(
        &self,
        execution_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> ApiResult<String> {
        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .get(
                self.config
                    .api_url(&format!("workflow/execution/{execution_id}/status"))?,
            )
            .header(ACCEPT, "text/event-stream")
            .query(&[("organization", organization.as_str())]);
        let response = self.send_authorized(request).await?;
        Ok(response.text().await?)
    }

    pub async fn download_image(
        &self,
        content_hash: &str,
        image_name: &str,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Vec<u8>> {
        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .get(
                self.config
                    .api_url(&format!("image/{content_hash}/{image_name}"))?,
            )
            .query(&[("organization", organization.as_str())]);
        let response = self.send_authorized(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Default result of an execution; the server holds the request until it is ready.
    pub async fn download_result_blocking(
        &self,
        execution_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Vec<u8>> {
        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .get(
                self.config
                    .api_url(&format!("workflow/execution/{execution_id}/result/default"))?,
            )
            .query(&[("organization", organization.as_str())]);
        let response = self.send_authorized(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Download by the `resultPath` of an execution, e.g. `/image/<hash>/<name>`.
    pub async fn download_result(
        &self,
        result_path: &str,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Vec<u8>> {
        if !result_path.starts_with("/image/") {
            return Err(ApiError::InvalidResultPath(result_path.to_owned()));
        }
        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .get(self.config.api_url(result_path)?)
            .query(&[("organization", organization.as_str())]);
        let response = self.send_authorized(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> ApiResult<StatusCode> {
        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .post(
                self.config
                    .api_url(&format!("workflow/execution/{execution_id}/retry"))?,
            )
            .query(&[("organization", organization.as_str())]);
        let response = self.send_authorized(request).await?;
        Ok(response.status())
    }

    pub async fn send_feedback(
        &self,
        execution_id: Uuid,
        thumbs_up: bool,
        expected_images_content_hashes: &[String],
        organization_id: Option<Uuid>,
    ) -> ApiResult<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Feedback<'a> {
            thumbs_up: bool,
            expected_images: &'a [String],
        }

        let organization = self.organization(organization_id)?;
        let request = self
            .http
            .post(
                self.config
                    .api_url(&format!("workflow/execution/{execution_id}/feedback"))?,
            )
            .query(&[("organization", organization.as_str())])
            .json(&Feedback {
                thumbs_up,
                expected_images: expected_images_content_hashes,
            });
        self.send_authorized(request).await?;
        Ok(())
    }

    /// Attach a bearer token that stays valid for at least the refresh window.
    async fn authorized(&self, request: RequestBuilder) -> ApiResult<RequestBuilder> {
        let credentials = self.credentials.ensure_valid().await?;
        Ok(request.header(AUTHORIZATION, credentials.bearer()))
    }

    async fn send_authorized(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = self.authorized(request).await?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = status.canonical_reason().unwrap_or("unknown").to_owned();
            return Err(ApiError::HttpStatus {
                status,
                reason,
                body,
            });
        }
        Ok(response)
    }

    fn organization(&self, organization_id: Option<Uuid>) -> ApiResult<String> {
        self.organization_id
            .or(organization_id)
            .map(|id| id.to_string())
            .ok_or(ApiError::MissingOrganization)
    }

    fn create_query(
        &self,
        workflow_id: Uuid,
        workflow_version: Option<Uuid>,
        labels: &BTreeMap<String, String>,
        organization_id: Option<Uuid>,
    ) -> ApiResult<Vec<(String, String)>> {
        let mut query = vec![("workflow".to_owned(), workflow_id.to_string())];
        if let Some(version) = workflow_version {
            query.push(("version".to_owned(), version.to_string()));
        }
        query.push(("organization".to_owned(), self.organization(organization_id)?));
        for (key, value) in labels {
            query.push((format!("label[{key}]"), value.clone()));
        }
        Ok(query)
    }
}

/// MIME type sent for an image file name.
pub fn content_type_for(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("tif" | "tiff") => "image/tiff",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

async fn read_image(path: &Path) -> ApiResult<(Vec<u8>, String)> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ApiError::MissingFileName(path.display().to_string()))?
        .to_owned();
    let bytes = tokio::fs::read(path).await?;
    Ok((bytes, name))
}

fn image_form(bytes: Vec<u8>, file_name: &str, mime_type: &str) -> ApiResult<Form> {
    let part = Part::bytes(bytes)
        .file_name(file_name.to_owned())
        .mime_str(mime_type)?;
    Ok(Form::new().part("file", part))
}

async fn parse_json<R: DeserializeOwned>(response: Response) -> ApiResult<R> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn trim_body(body: &str) -> String {
    body.trim().trim_matches('"').to_owned()
}

fn parse_execution_id(body: &str) -> ApiResult<Uuid> {
    let trimmed = trim_body(body);
    Uuid::parse_str(&trimmed).map_err(|_| ApiError::InvalidExecutionId(trimmed))
}
