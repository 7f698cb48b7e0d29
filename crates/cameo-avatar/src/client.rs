//! HTTP client for the remote avatarization task API.
//!
//! Tasks are created with the face attached either inline (`fileData`, a data
//! URI) or by reference after a `POST /files` + `PUT upload_url` upload.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AvatarError, AvatarResult};

pub const DEFAULT_BASE_URL: &str = "https://api.manus.ai/v1";
pub const DEFAULT_AGENT_PROFILE: &str = "manus-1.6";
const TASK_MODE: &str = "agent";
const API_KEY_HEADER: &str = "API_KEY";
const FALLBACK_MIME: &str = "image/png";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the task API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub agent_profile: String,
    /// Attach images inline instead of through the upload flow.
    pub use_file_data: bool,
    /// Upper bound for any single request, body included.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ApiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            agent_profile: DEFAULT_AGENT_PROFILE.to_string(),
            use_file_data: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A base64 `data:` URI split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl DataUri {
    /// Parse `data:<mime>;base64,<payload>`.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix("data:")?;
        let (mime, payload) = rest.split_once(";base64,")?;
        if mime.is_empty() {
            return None;
        }
        let bytes = STANDARD.decode(payload.trim()).ok()?;
        Some(Self {
            mime: mime.to_string(),
            bytes,
        })
    }

    pub fn encode(mime: &str, bytes: &[u8]) -> String {
        format!("data:{mime};base64,{}", STANDARD.encode(bytes))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    prompt: &'a str,
    agent_profile: &'a str,
    task_mode: &'a str,
    attachments: Vec<Attachment<'a>>,
    interactive_mode: bool,
}

#[derive(Debug, Serialize)]
struct Attachment<'a> {
    filename: &'a str,
    #[serde(rename = "fileData", skip_serializing_if = "Option::is_none")]
    file_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    task_id: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileRecord {
    id: Option<String>,
    upload_url: Option<String>,
}

/// Task as reported by `GET /tasks/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteTask {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputMessage>,
}

impl RemoteTask {
    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }

    pub fn is_failed(&self) -> bool {
        self.status.as_deref() == Some("failed")
    }

    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failed()
    }

    pub fn failure_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "Task failed".to_string())
    }

    /// The last `output_file` item that carries a download URL.
    pub fn output_file(&self) -> Option<&OutputItem> {
        self.output
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|item| item.kind == "output_file" && item.file_url.is_some())
            .last()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputMessage {
    #[serde(default)]
    pub content: Vec<OutputItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "fileUrl", default)]
    pub file_url: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

/// Thin typed wrapper over the task API.
#[derive(Debug, Clone)]
pub struct AvatarClient {
    http: Client,
    config: ApiConfig,
}

impl AvatarClient {
    pub fn new(config: ApiConfig) -> AvatarResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AvatarError::MissingApiKey);
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        self.http
            .request(method, url)
            .header(API_KEY_HEADER, &self.config.api_key)
    }

    async fn send_json<T: DeserializeOwned>(&self, what: &str, request: RequestBuilder) -> AvatarResult<T> {
        let response = checked(what, request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    /// Create a task for `image` (a data URI) and return its id.
    pub async fn create_task(&self, prompt: &str, filename: &str, image: &str) -> AvatarResult<String> {
        let created: CreatedTask = if self.config.use_file_data {
            self.post_task(prompt, filename, Some(image), None).await?
        } else {
            let parsed = DataUri::parse(image).ok_or(AvatarError::InvalidDataUri)?;
            let file_id = self.upload(filename, &parsed).await?;
            self.post_task(prompt, filename, None, Some(&file_id)).await?
        };

        let task_id = created
            .task_id
            .or(created.id)
            .filter(|id| !id.is_empty())
            .ok_or(AvatarError::TaskCreation)?;
        info!(task_id = %task_id, inline = self.config.use_file_data, "avatar task created");
        Ok(task_id)
    }

    async fn post_task(
        &self,
        prompt: &str,
        filename: &str,
        file_data: Option<&str>,
        file_id: Option<&str>,
    ) -> AvatarResult<CreatedTask> {
        let body = CreateTaskRequest {
            prompt,
            agent_profile: &self.config.agent_profile,
            task_mode: TASK_MODE,
            attachments: vec![Attachment {
                filename,
                file_data,
                file_id,
            }],
            interactive_mode: false,
        };
        self.send_json("POST /tasks", self.request(Method::POST, "/tasks").json(&body))
            .await
    }

    /// Register a file and upload its bytes; returns the file id.
    async fn upload(&self, filename: &str, data: &DataUri) -> AvatarResult<String> {
        let record: FileRecord = self
            .send_json(
                "POST /files",
                self.request(Method::POST, "/files")
                    .json(&serde_json::json!({ "filename": filename })),
            )
            .await?;
        let (Some(id), Some(upload_url)) = (record.id, record.upload_url) else {
            return Err(AvatarError::FileRecord);
        };

        let put = self
            .http
            .put(&upload_url)
            .header(reqwest::header::CONTENT_TYPE, data.mime.as_str())
            .body(data.bytes.clone());
        checked("Upload", put.send().await?).await?;
        debug!(file_id = %id, bytes = data.bytes.len(), "face uploaded");
        Ok(id)
    }

    pub async fn get_task(&self, task_id: &str) -> AvatarResult<RemoteTask> {
        if !is_valid_task_id(task_id) {
            return Err(AvatarError::InvalidTaskId);
        }
        let path = format!("/tasks/{task_id}");
        let what = format!("GET {path}");
        self.send_json(&what, self.request(Method::GET, &path)).await
    }

    /// Download a task's output file and inline it as a data URI.
    ///
    /// The MIME type is the item's own, then the response's, then PNG.
    pub async fn fetch_output(&self, url: &str, mime_hint: Option<&str>) -> AvatarResult<String> {
        let response = checked("Avatar fetch", self.http.get(url).send().await?).await?;
        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        let mime = mime_hint
            .map(str::to_string)
            .or(header_mime)
            .unwrap_or_else(|| FALLBACK_MIME.to_string());
        Ok(DataUri::encode(&mime, &bytes))
    }
}

/// Task ids are opaque tokens; anything that could change the request path is refused.
pub fn is_valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id != "."
        && task_id != ".."
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Turn a non-success response into [`AvatarError::Http`].
async fn checked(what: &str, response: Response) -> AvatarResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AvatarError::http(what, status.as_u16(), &body))
}
