//! Avatarization service: keyed task cache, request coalescing, and polling.
//!
//! A request is keyed by `sha256(prompt | image data URI)`. A completed result
//! or a still-pending task under that key is reused for an hour; a failed task
//! is remembered but a new request for the same key starts a fresh task.

use std::sync::Arc;
use std::time::Duration;

use cameo_core::cache::{SingleFlight, TtlCache, RESULT_TTL};
use cameo_core::cutout::{tighten_to_content, CUTOUT_PAD_RATIO};
use cameo_core::raster::{decode_image, encode_png};
use image::RgbaImage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::client::{ApiConfig, AvatarClient, DataUri, RemoteTask};
use crate::error::{AvatarError, AvatarResult};
use crate::poll::{wait_for_task, Backoff};

pub const DEFAULT_PROMPT: &str =
    "cute baby pixar style avatar face, big eyes, soft skin, 3d cartoon, clean background, helmet friendly";
/// How long a submit request waits for its task before answering "pending".
pub const SUBMIT_WAIT: Duration = Duration::from_secs(20);
pub const FOLLOW_UP_ROUNDS: usize = 20;

/// Errors are shared between coalesced callers.
pub type SharedError = Arc<AvatarError>;

#[derive(Debug, Clone)]
pub struct AvatarSettings {
    pub api: ApiConfig,
    pub prompt: String,
    /// Bumped whenever `prompt` changes so cached composites are not reused.
    pub prompt_version: u32,
    pub submit_wait: Duration,
    pub submit_backoff: Backoff,
    pub follow_up_backoff: Backoff,
    pub follow_up_rounds: usize,
    pub cache_ttl: Duration,
}

impl AvatarSettings {
    pub fn new(api: ApiConfig) -> Self {
        Self {
            api,
            prompt: DEFAULT_PROMPT.to_string(),
            prompt_version: 1,
            submit_wait: SUBMIT_WAIT,
            submit_backoff: Backoff::SUBMIT,
            follow_up_backoff: Backoff::FOLLOW_UP,
            follow_up_rounds: FOLLOW_UP_ROUNDS,
            cache_ttl: RESULT_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
}

/// Cached view of one remote task.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarTask {
    pub task_id: String,
    pub state: TaskState,
    /// Data URI of the stylized image once completed.
    pub result: Option<String>,
}

/// What a submit or status request resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum AvatarOutcome {
    Completed {
        task_id: String,
        avatar_data_url: String,
        reused: bool,
    },
    Pending {
        task_id: String,
        reused: bool,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

impl AvatarOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            AvatarOutcome::Completed { task_id, .. }
            | AvatarOutcome::Pending { task_id, .. }
            | AvatarOutcome::Failed { task_id, .. } => task_id,
        }
    }
}

/// Cache key for a prompt and image data URI.
pub fn task_key(prompt: &str, image_data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b"|");
    hasher.update(image_data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Upload name used when the caller does not supply one.
pub fn default_filename() -> String {
    format!("face-{}.png", chrono::Utc::now().timestamp_millis())
}

pub struct Avatarizer {
    client: AvatarClient,
    settings: AvatarSettings,
    tasks: TtlCache<String, AvatarTask>,
    flights: SingleFlight<String, Result<AvatarOutcome, SharedError>>,
}

impl Avatarizer {
    pub fn new(settings: AvatarSettings) -> AvatarResult<Self> {
        let client = AvatarClient::new(settings.api.clone())?;
        Ok(Self {
            client,
            tasks: TtlCache::new(settings.cache_ttl),
            flights: SingleFlight::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &AvatarSettings {
        &self.settings
    }

    pub fn cached(&self, key: &str) -> Option<AvatarTask> {
        self.tasks.get(&key.to_string())
    }

    /// Whether a finished avatar for `image_data` under the configured prompt is cached.
    pub fn has_completed(&self, image_data: &str) -> bool {
        self.cached(&task_key(&self.settings.prompt, image_data))
            .is_some_and(|t| t.state == TaskState::Completed && t.result.is_some())
    }

    fn remember(&self, key: &str, task_id: &str, state: TaskState, result: Option<String>) {
        self.tasks.insert(
            key.to_string(),
            AvatarTask {
                task_id: task_id.to_string(),
                state,
                result,
            },
        );
    }

    /// Submit `image_data` for stylization, or reuse a cached/in-flight task.
    ///
    /// Waits up to `submit_wait` for the task; a task still running after that
    /// is reported as pending and can be followed with [`Avatarizer::status`].
    pub async fn submit(
        &self,
        image_data: &str,
        prompt: Option<&str>,
        filename: Option<&str>,
    ) -> Result<AvatarOutcome, SharedError> {
        if DataUri::parse(image_data).is_none() {
            return Err(Arc::new(AvatarError::InvalidDataUri));
        }
        let prompt = prompt.unwrap_or(self.settings.prompt.as_str());
        let key = task_key(prompt, image_data);

        if let Some(reused) = self.reusable(&key) {
            return Ok(reused);
        }

        let filename = filename.map(str::to_string).unwrap_or_else(default_filename);
        self.flights
            .run(key.clone(), || async {
                // A coalesced flight may have finished between the check above and now.
                if let Some(reused) = self.reusable(&key) {
                    return Ok(reused);
                }
                self.create_and_wait(&key, prompt, &filename, image_data)
                    .await
                    .map_err(Arc::new)
            })
            .await
    }

    fn reusable(&self, key: &str) -> Option<AvatarOutcome> {
        let task = self.cached(key)?;
        match (task.state, task.result) {
            (TaskState::Completed, Some(url)) => Some(AvatarOutcome::Completed {
                task_id: task.task_id,
                avatar_data_url: url,
                reused: true,
            }),
            (TaskState::Pending, _) => Some(AvatarOutcome::Pending {
                task_id: task.task_id,
                reused: true,
            }),
            _ => None,
        }
    }

    async fn create_and_wait(
        &self,
        key: &str,
        prompt: &str,
        filename: &str,
        image_data: &str,
    ) -> AvatarResult<AvatarOutcome> {
        let task_id = self.client.create_task(prompt, filename, image_data).await?;
        self.remember(key, &task_id, TaskState::Pending, None);

        let waited = wait_for_task(
            &self.client,
            &task_id,
            self.settings.submit_backoff,
            self.settings.submit_wait,
        )
        .await?;
        let Some(task) = waited else {
            info!(task_id = %task_id, "avatar task still pending after submit window");
            return Ok(AvatarOutcome::Pending {
                task_id,
                reused: false,
            });
        };

        let outcome = self.resolve(&task_id, &task).await?;
        self.record(key, &outcome);
        Ok(outcome)
    }

    fn record(&self, key: &str, outcome: &AvatarOutcome) {
        match outcome {
            AvatarOutcome::Completed {
                task_id,
                avatar_data_url,
                ..
            } => self.remember(key, task_id, TaskState::Completed, Some(avatar_data_url.clone())),
            AvatarOutcome::Failed { task_id, .. } => {
                self.remember(key, task_id, TaskState::Failed, None)
            }
            AvatarOutcome::Pending { task_id, .. } => {
                self.remember(key, task_id, TaskState::Pending, None)
            }
        }
    }

    /// Map a fetched task to an outcome, downloading the output when completed.
    async fn resolve(&self, task_id: &str, task: &RemoteTask) -> AvatarResult<AvatarOutcome> {
        if task.is_failed() {
            let error = task.failure_message();
            warn!(task_id, error = %error, "avatar task failed");
            return Ok(AvatarOutcome::Failed {
                task_id: task_id.to_string(),
                error,
            });
        }
        if !task.is_completed() {
            return Ok(AvatarOutcome::Pending {
                task_id: task_id.to_string(),
                reused: false,
            });
        }
        let item = task.output_file().ok_or_else(|| AvatarError::NoOutputFile {
            task_id: task_id.to_string(),
        })?;
        let url = item.file_url.as_deref().unwrap_or_default();
        let avatar_data_url = self.client.fetch_output(url, item.mime_type.as_deref()).await?;
        info!(task_id, bytes = avatar_data_url.len(), "avatar task completed");
        Ok(AvatarOutcome::Completed {
            task_id: task_id.to_string(),
            avatar_data_url,
            reused: false,
        })
    }

    /// Current state of a task, straight from the remote API.
    pub async fn status(&self, task_id: &str) -> AvatarResult<AvatarOutcome> {
        let task = self.client.get_task(task_id).await?;
        self.resolve(task_id, &task).await
    }

    /// Stylize a cutout: submit, then follow up until done or out of rounds.
    ///
    /// The returned image is cropped to its visible content.
    pub async fn avatarize(&self, cutout: &RgbaImage) -> Result<RgbaImage, SharedError> {
        let png = encode_png(cutout).map_err(|e| Arc::new(AvatarError::Decode(e)))?;
        let image_data = DataUri::encode("image/png", &png);
        let key = task_key(&self.settings.prompt, &image_data);

        let mut outcome = self.submit(&image_data, None, None).await?;
        let mut rounds = self.settings.follow_up_backoff.delays().take(self.settings.follow_up_rounds);
        loop {
            match outcome {
                AvatarOutcome::Completed { avatar_data_url, .. } => {
                    return decode_avatar(&avatar_data_url).map_err(Arc::new);
                }
                AvatarOutcome::Failed { task_id, error } => {
                    return Err(Arc::new(AvatarError::TaskFailed {
                        task_id,
                        message: error,
                    }));
                }
                AvatarOutcome::Pending { task_id, .. } => {
                    let Some(delay) = rounds.next() else {
                        warn!(task_id = %task_id, "avatar task did not finish in time");
                        return Err(Arc::new(AvatarError::TimedOut { task_id }));
                    };
                    tokio::time::sleep(delay).await;
                    outcome = self.status(&task_id).await.map_err(Arc::new)?;
                    if !matches!(outcome, AvatarOutcome::Pending { .. }) {
                        self.record(&key, &outcome);
                    }
                }
            }
        }
    }

    /// Drop every cached task (new session).
    pub fn reset(&self) {
        self.tasks.reset();
    }
}

fn decode_avatar(data_url: &str) -> AvatarResult<RgbaImage> {
    let data = DataUri::parse(data_url).ok_or(AvatarError::InvalidDataUri)?;
    let image = decode_image(&data.bytes)?;
    Ok(tighten_to_content(&image, CUTOUT_PAD_RATIO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_is_deterministic_and_prompt_sensitive() {
        let a = task_key("prompt", "data:image/png;base64,AAAA");
        assert_eq!(a, task_key("prompt", "data:image/png;base64,AAAA"));
        assert_ne!(a, task_key("other", "data:image/png;base64,AAAA"));
        assert_ne!(a, task_key("prompt", "data:image/png;base64,AAAB"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_default_filename_shape() {
        let name = default_filename();
        assert!(name.starts_with("face-"));
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn test_decode_avatar_rejects_garbage() {
        assert!(matches!(decode_avatar("nope"), Err(AvatarError::InvalidDataUri)));
        let not_png = DataUri::encode("image/png", b"definitely not a png");
        assert!(matches!(decode_avatar(&not_png), Err(AvatarError::Decode(_))));
    }

    mod remote {
        use super::*;
        use image::Rgba;
        use serde_json::json;
        use wiremock::matchers::{body_partial_json, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn quick() -> Backoff {
            Backoff {
                initial: Duration::from_millis(20),
                factor: 1.0,
                cap: Duration::from_millis(20),
            }
        }

        fn settings(server: &MockServer) -> AvatarSettings {
            let mut api = ApiConfig::new("secret");
            api.base_url = server.uri();
            let mut settings = AvatarSettings::new(api);
            settings.submit_wait = Duration::from_millis(300);
            settings.submit_backoff = quick();
            settings.follow_up_backoff = quick();
            settings.follow_up_rounds = 5;
            settings
        }

        fn face_png() -> Vec<u8> {
            encode_png(&RgbaImage::from_pixel(8, 8, Rgba([200, 150, 120, 255]))).unwrap()
        }

        fn face_data() -> String {
            DataUri::encode("image/png", &face_png())
        }

        fn completed_body(server: &MockServer) -> serde_json::Value {
            json!({
                "status": "completed",
                "output": [{ "content": [
                    { "type": "output_text", "text": "here you go" },
                    { "type": "output_file", "fileUrl": format!("{}/files/out.png", server.uri()) }
                ]}]
            })
        }

        async fn mount_output(server: &MockServer) {
            Mock::given(method("GET"))
                .and(path("/files/out.png"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("content-type", "image/png")
                        .set_body_bytes(face_png()),
                )
                .mount(server)
                .await;
        }

        async fn mount_create(server: &MockServer, body: serde_json::Value, times: u64) {
            Mock::given(method("POST"))
                .and(path("/tasks"))
                .and(header("API_KEY", "secret"))
                .and(body_partial_json(json!({
                    "agentProfile": "manus-1.6",
                    "taskMode": "agent",
                    "interactiveMode": false
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .expect(times)
                .mount(server)
                .await;
        }

        #[tokio::test]
        async fn test_submit_completes_and_is_reused() {
            let server = MockServer::start().await;
            mount_create(&server, json!({ "task_id": "t1" }), 1).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(completed_body(&server)))
                .mount(&server)
                .await;
            mount_output(&server).await;

            let avatarizer = Avatarizer::new(settings(&server)).unwrap();
            let first = avatarizer.submit(&face_data(), None, None).await.unwrap();
            match &first {
                AvatarOutcome::Completed {
                    task_id,
                    avatar_data_url,
                    reused,
                } => {
                    assert_eq!(task_id, "t1");
                    assert!(avatar_data_url.starts_with("data:image/png;base64,"));
                    assert!(!reused);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(avatarizer.has_completed(&face_data()));

            let second = avatarizer.submit(&face_data(), None, None).await.unwrap();
            assert!(matches!(second, AvatarOutcome::Completed { reused: true, .. }));
        }

        #[tokio::test]
        async fn test_upload_flow_attaches_file_id() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/files"))
                .and(body_partial_json(json!({ "filename": "face-1.png" })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "id": "f1",
                    "upload_url": format!("{}/upload/f1", server.uri())
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path("/upload/f1"))
                .and(header("content-type", "image/png"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            // Task id may come back as `id`.
            mount_create(&server, json!({ "id": "t2" }), 1).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(completed_body(&server)))
                .mount(&server)
                .await;
            mount_output(&server).await;

            let mut settings = settings(&server);
            settings.api.use_file_data = false;
            let avatarizer = Avatarizer::new(settings).unwrap();
            let outcome = avatarizer
                .submit(&face_data(), None, Some("face-1.png"))
                .await
                .unwrap();
            assert_eq!(outcome.task_id(), "t2");
            assert!(matches!(outcome, AvatarOutcome::Completed { .. }));
        }

        #[tokio::test]
        async fn test_failed_task_is_reported_and_not_reused() {
            let server = MockServer::start().await;
            // Cached failures do not short-circuit: every request creates a task.
            mount_create(&server, json!({ "task_id": "t3" }), 3).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t3"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "status": "failed",
                    "error": "model overloaded"
                })))
                .mount(&server)
                .await;

            let avatarizer = Avatarizer::new(settings(&server)).unwrap();
            for _ in 0..2 {
                let outcome = avatarizer.submit(&face_data(), None, None).await.unwrap();
                assert_eq!(
                    outcome,
                    AvatarOutcome::Failed {
                        task_id: "t3".into(),
                        error: "model overloaded".into()
                    }
                );
            }
            let err = avatarizer
                .avatarize(&RgbaImage::from_pixel(8, 8, Rgba([200, 150, 120, 255])))
                .await
                .unwrap_err();
            assert!(matches!(&*err, AvatarError::TaskFailed { message, .. } if message == "model overloaded"));
        }

        #[tokio::test]
        async fn test_concurrent_submits_share_one_task() {
            let server = MockServer::start().await;
            mount_create(&server, json!({ "task_id": "t4" }), 1).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t4"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(completed_body(&server))
                        .set_delay(Duration::from_millis(100)),
                )
                .mount(&server)
                .await;
            mount_output(&server).await;

            let avatarizer = Avatarizer::new(settings(&server)).unwrap();
            let data = face_data();
            let (a, b, c) = tokio::join!(
                avatarizer.submit(&data, None, None),
                avatarizer.submit(&data, None, None),
                avatarizer.submit(&data, None, None),
            );
            for outcome in [a, b, c] {
                assert_eq!(outcome.unwrap().task_id(), "t4");
            }
        }

        #[tokio::test]
        async fn test_pending_task_is_reused_until_done() {
            let server = MockServer::start().await;
            mount_create(&server, json!({ "task_id": "t5" }), 1).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t5"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "running" })))
                .mount(&server)
                .await;

            let mut settings = settings(&server);
            settings.submit_wait = Duration::from_millis(60);
            let avatarizer = Avatarizer::new(settings).unwrap();

            let first = avatarizer.submit(&face_data(), None, None).await.unwrap();
            assert_eq!(
                first,
                AvatarOutcome::Pending {
                    task_id: "t5".into(),
                    reused: false
                }
            );
            let second = avatarizer.submit(&face_data(), None, None).await.unwrap();
            assert_eq!(
                second,
                AvatarOutcome::Pending {
                    task_id: "t5".into(),
                    reused: true
                }
            );
            let status = avatarizer.status("t5").await.unwrap();
            assert!(matches!(status, AvatarOutcome::Pending { .. }));
        }

        #[tokio::test]
        async fn test_avatarize_follows_up_after_submit_window() {
            let server = MockServer::start().await;
            mount_create(&server, json!({ "task_id": "t6" }), 1).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t6"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "running" })))
                .up_to_n_times(4)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/tasks/t6"))
                .respond_with(ResponseTemplate::new(200).set_body_json(completed_body(&server)))
                .mount(&server)
                .await;
            mount_output(&server).await;

            let mut settings = settings(&server);
            settings.submit_wait = Duration::from_millis(30);
            let avatarizer = Avatarizer::new(settings).unwrap();
            let cutout = RgbaImage::from_pixel(16, 16, Rgba([10, 20, 30, 255]));

            let avatar = avatarizer.avatarize(&cutout).await.unwrap();
            assert_eq!(avatar.width(), avatar.height());
            assert!(avatar.pixels().any(|p| p[3] > 0));

            let png = encode_png(&cutout).unwrap();
            assert!(avatarizer.has_completed(&DataUri::encode("image/png", &png)));
        }

        #[tokio::test]
        async fn test_avatarize_times_out_when_task_never_finishes() {
            let server = MockServer::start().await;
            mount_create(&server, json!({ "task_id": "t7" }), 1).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t7"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "running" })))
                .mount(&server)
                .await;

            let mut settings = settings(&server);
            settings.submit_wait = Duration::from_millis(30);
            settings.follow_up_rounds = 2;
            let avatarizer = Avatarizer::new(settings).unwrap();
            let err = avatarizer
                .avatarize(&RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])))
                .await
                .unwrap_err();
            assert!(matches!(&*err, AvatarError::TimedOut { task_id } if task_id == "t7"));
        }

        #[tokio::test]
        async fn test_stalled_status_request_is_bounded() {
            let server = MockServer::start().await;
            mount_create(&server, json!({ "task_id": "t8" }), 2).await;
            Mock::given(method("GET"))
                .and(path("/tasks/t8"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({ "status": "running" }))
                        .set_delay(Duration::from_secs(120)),
                )
                .mount(&server)
                .await;

            let mut settings = settings(&server);
            settings.api.request_timeout = Duration::from_millis(300);
            settings.submit_wait = Duration::from_millis(100);
            settings.follow_up_rounds = 2;
            let avatarizer = Avatarizer::new(settings).unwrap();

            let started = std::time::Instant::now();
            let submitted = avatarizer.submit(&face_data(), None, None).await.unwrap();
            assert!(matches!(submitted, AvatarOutcome::Pending { ref task_id, .. } if task_id == "t8"));
            assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());

            let finished = tokio::time::timeout(
                Duration::from_secs(10),
                avatarizer.avatarize(&RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255]))),
            )
            .await
            .expect("avatarize must not hang on a stalled request");
            let err = finished.unwrap_err();
            assert!(err.is_network(), "{err}");
        }

        #[tokio::test]
        async fn test_http_error_carries_status() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/tasks"))
                .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
                .mount(&server)
                .await;

            let avatarizer = Avatarizer::new(settings(&server)).unwrap();
            let err = avatarizer.submit(&face_data(), None, None).await.unwrap_err();
            assert!(matches!(&*err, AvatarError::Http { status: 401, body, .. } if body == "bad key"));
            // Nothing was cached, so the key is not stuck as pending.
            assert!(avatarizer
                .cached(&task_key(DEFAULT_PROMPT, &face_data()))
                .is_none());
        }

        #[tokio::test]
        async fn test_invalid_image_data_rejected_locally() {
            let server = MockServer::start().await;
            let avatarizer = Avatarizer::new(settings(&server)).unwrap();
            let err = avatarizer.submit("hello", None, None).await.unwrap_err();
            assert!(matches!(&*err, AvatarError::InvalidDataUri));
        }
    }
}
