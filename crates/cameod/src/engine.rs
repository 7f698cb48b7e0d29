use std::sync::Arc;
use std::time::Duration;

use cameo_avatar::{AvatarError, Avatarizer, DataUri};
use cameo_core::raster::encode_png;
use cameo_core::{
    AssetError, AssetStore, AvatarMode, CharacterCatalog, CompositeKey, CompositePolicy,
    CompositeResult, Compositor, Cutout, CutoutExtractor, CutoutKey, DetectorChain, PrintCompositor,
    PrintOutcome, ResultCache, Segmenter, SourceKey, WorkingCopy,
};
use image::RgbaImage;
use thiserror::Error;

/// Pipeline failures. None of them ends a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// No strategy located a face; the fallback cutout covers this.
    #[error("face detection unavailable")]
    DetectionUnavailable,
    #[error("remote avatar task failed: {0}")]
    RemoteTaskFailed(String),
    #[error("asset load failed: {0}")]
    AssetLoadFailed(String),
    #[error("network error: {0}")]
    NetworkError(String),
}

impl PipelineError {
    /// Failures a mandatory-avatar retry may clear.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PipelineError::RemoteTaskFailed(_) | PipelineError::NetworkError(_)
        )
    }
}

impl From<AssetError> for PipelineError {
    fn from(err: AssetError) -> Self {
        PipelineError::AssetLoadFailed(err.to_string())
    }
}

impl From<&AvatarError> for PipelineError {
    fn from(err: &AvatarError) -> Self {
        if err.is_network() {
            PipelineError::NetworkError(err.sanitized())
        } else {
            PipelineError::RemoteTaskFailed(err.sanitized())
        }
    }
}

/// Tunables that are not owned by a component.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub working_max_dim: u32,
    pub avatar_mandatory: bool,
    pub prompt_version: u32,
    pub retry_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            working_max_dim: cameo_core::raster::WORKING_MAX_DIM,
            avatar_mandatory: true,
            prompt_version: 1,
            retry_delay: Duration::from_millis(1500),
        }
    }
}

/// Photo → cutout → (avatar) → character composite.
pub struct Pipeline {
    catalog: Arc<CharacterCatalog>,
    assets: AssetStore,
    chain: DetectorChain,
    extractor: CutoutExtractor,
    segmenter: Option<Segmenter>,
    compositor: Compositor,
    printer: PrintCompositor,
    avatar: Option<Arc<Avatarizer>>,
    cache: ResultCache<PipelineError>,
    options: PipelineOptions,
}

impl Pipeline {
    /// `avatar` is `Some` only when avatarization is switched on for the pipeline.
    pub fn new(
        catalog: Arc<CharacterCatalog>,
        assets: AssetStore,
        chain: DetectorChain,
        avatar: Option<Arc<Avatarizer>>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            compositor: Compositor::new(Arc::clone(&catalog)),
            printer: PrintCompositor::new(assets.clone(), Arc::clone(&catalog)),
            extractor: CutoutExtractor::default(),
            segmenter: None,
            cache: ResultCache::default(),
            catalog,
            assets,
            chain,
            avatar,
            options,
        }
    }

    /// Matte detected faces before compositing; the mask cutout stays as fallback.
    pub fn with_segmenter(mut self, segmenter: Segmenter) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn catalog(&self) -> &CharacterCatalog {
        &self.catalog
    }

    fn avatar_mode(&self) -> AvatarMode {
        if self.avatar.is_some() {
            AvatarMode::Stylized
        } else {
            AvatarMode::Off
        }
    }

    fn template(&self, character_id: &str) -> Result<RgbaImage, PipelineError> {
        Ok(self.assets.template_for(self.catalog.get(character_id))?)
    }

    /// Naive center-crop composite for the instant preview. No detection, no avatar.
    pub fn compose_fast(
        &self,
        photo: &RgbaImage,
        source: &SourceKey,
        character_id: &str,
    ) -> Result<CompositeResult, PipelineError> {
        let template = self.template(character_id)?;
        let character = self.catalog.get(character_id);
        let working = WorkingCopy::new(photo, self.options.working_max_dim);
        let cutout = self.extractor.center_crop(&working, character.trim);
        let image = self.compositor.compose(&template, &cutout.image, character_id);
        tracing::debug!(character = character_id, source = %source, "fast composite ready");
        Ok(CompositeResult {
            image: Arc::new(image),
            key: CompositeKey {
                character_id: character_id.to_string(),
                avatar_mode: AvatarMode::Off,
                prompt_version: self.options.prompt_version,
                source: source.clone(),
            },
        })
    }

    /// Detected cutout for a photo, computed once per character and source image.
    pub async fn cutout(&self, photo: &RgbaImage, source: &SourceKey, character_id: &str) -> Arc<Cutout> {
        let key = CutoutKey {
            character_id: character_id.to_string(),
            source: source.clone(),
        };
        let trim = self.catalog.get(character_id).trim;
        self.cache
            .cutout_or_compute(key, || async {
                let working = WorkingCopy::new(photo, self.options.working_max_dim);
                let region = self.chain.detect(&working).await;
                if region.is_none() {
                    tracing::info!(
                        source = %source,
                        error = %PipelineError::DetectionUnavailable,
                        "using fallback cutout"
                    );
                }
                let cutout = self.extractor.extract(&working, region.as_ref(), trim);
                let segmented = match &self.segmenter {
                    Some(segmenter) => segmenter.refine(&working, &cutout, &self.extractor, trim).await,
                    None => None,
                };
                segmented.unwrap_or(cutout)
            })
            .await
    }

    /// Full composite: detection, optional avatar, compositing. Cached per key.
    pub async fn compose_refined(
        &self,
        photo: &RgbaImage,
        source: &SourceKey,
        character_id: &str,
    ) -> Result<CompositeResult, PipelineError> {
        let template = self.template(character_id)?;
        let cutout = self.cutout(photo, source, character_id).await;

        let key = CompositeKey {
            character_id: character_id.to_string(),
            avatar_mode: self.avatar_mode(),
            prompt_version: self.options.prompt_version,
            source: source.clone(),
        };
        let policy = CompositePolicy {
            avatar_enabled: self.avatar.is_some(),
            avatar_cached: self.avatar_cached(&cutout),
        };

        self.cache
            .composite_or_try_compute(key.clone(), policy, || async {
                let (face, avatar_mode) = self.face_layer(&cutout).await?;
                Ok(CompositeResult {
                    image: Arc::new(self.compositor.compose(&template, &face, character_id)),
                    key: CompositeKey {
                        avatar_mode,
                        ..key.clone()
                    },
                })
            })
            .await
    }

    fn avatar_cached(&self, cutout: &Cutout) -> bool {
        let Some(avatar) = &self.avatar else {
            return false;
        };
        encode_png(&cutout.image)
            .map(|png| avatar.has_completed(&DataUri::encode("image/png", &png)))
            .unwrap_or(false)
    }

    /// The image that goes into the slot and the mode it was produced in:
    /// the avatar when available, else the raw cutout.
    async fn face_layer(&self, cutout: &Cutout) -> Result<(RgbaImage, AvatarMode), PipelineError> {
        let Some(avatar) = &self.avatar else {
            return Ok((cutout.image.clone(), AvatarMode::Off));
        };
        match avatar.avatarize(&cutout.image).await {
            Ok(image) => Ok((image, AvatarMode::Stylized)),
            Err(err) if self.options.avatar_mandatory => Err(PipelineError::from(&*err)),
            Err(err) => {
                tracing::warn!(error = %err, "avatarization failed, using raw cutout");
                Ok((cutout.image.clone(), AvatarMode::Off))
            }
        }
    }

    /// Refined composite with the single mandatory-avatar retry.
    ///
    /// `on_retry` runs once before the retry so the caller can surface a
    /// "still processing" state.
    pub async fn compose_with_retry(
        &self,
        photo: &RgbaImage,
        source: &SourceKey,
        character_id: &str,
        on_retry: impl FnOnce(&PipelineError),
    ) -> Result<CompositeResult, PipelineError> {
        match self.compose_refined(photo, source, character_id).await {
            Err(err) if err.is_remote() && self.options.avatar_mandatory => {
                tracing::warn!(
                    error = %err,
                    delay_ms = self.options.retry_delay.as_millis() as u64,
                    "mandatory avatar missing, retrying pipeline"
                );
                on_retry(&err);
                tokio::time::sleep(self.options.retry_delay).await;
                self.compose_refined(photo, source, character_id).await
            }
            other => other,
        }
    }

    pub fn compose_print(&self, composite: &RgbaImage, character_id: &str) -> PrintOutcome {
        self.printer.compose_print(composite, character_id)
    }

    /// Forget cached cutouts, composites, and avatar tasks.
    pub fn reset(&self) {
        self.cache.reset();
        if let Some(avatar) = &self.avatar {
            avatar.reset();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cameo_avatar::{ApiConfig, AvatarSettings, Backoff};
    use cameo_core::{CutoutKind, ModelPaths, StageTimeouts};
    use image::Rgba;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Asset directory holding a 200×280 template for every character.
    pub(crate) fn asset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CharacterCatalog::embedded().unwrap();
        let template = RgbaImage::from_fn(200, 280, |_, y| {
            if y > 250 {
                Rgba([40, 40, 160, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        for c in std::iter::once(&catalog.default).chain(&catalog.characters) {
            let file = dir.path().join(&c.assets.template);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            template.save(&file).unwrap();
        }
        dir
    }

    pub(crate) fn photo() -> RgbaImage {
        RgbaImage::from_fn(300, 400, |x, y| {
            let dx = (x as f32 - 150.0) / 60.0;
            let dy = (y as f32 - 170.0) / 80.0;
            if dx * dx + dy * dy <= 1.0 {
                Rgba([190, 120, 100, 255])
            } else {
                Rgba([235, 235, 235, 255])
            }
        })
    }

    pub(crate) fn pipeline(assets: &tempfile::TempDir, avatar: Option<Arc<Avatarizer>>, retry_delay: Duration) -> Pipeline {
        let catalog = Arc::new(CharacterCatalog::embedded().unwrap());
        Pipeline::new(
            catalog,
            AssetStore::new(assets.path()),
            DetectorChain::standard(&ModelPaths::default(), &StageTimeouts::default()),
            avatar,
            PipelineOptions {
                retry_delay,
                ..PipelineOptions::default()
            },
        )
    }

    fn quick() -> Backoff {
        Backoff {
            initial: Duration::from_millis(10),
            factor: 1.0,
            cap: Duration::from_millis(10),
        }
    }

    pub(crate) async fn failing_avatar(server: &MockServer) -> Arc<Avatarizer> {
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "bad" })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "error": "no face found"
            })))
            .mount(server)
            .await;
        let mut api = ApiConfig::new("k");
        api.base_url = server.uri();
        let mut settings = AvatarSettings::new(api);
        settings.submit_wait = Duration::from_millis(100);
        settings.submit_backoff = quick();
        settings.follow_up_backoff = quick();
        Arc::new(Avatarizer::new(settings).unwrap())
    }

    #[tokio::test]
    async fn test_fast_and_refined_match_template_size() {
        let assets = asset_dir();
        let p = pipeline(&assets, None, Duration::ZERO);
        let photo = photo();
        let source = SourceKey::of_image(&photo);

        let fast = p.compose_fast(&photo, &source, "migu").unwrap();
        let refined = p.compose_refined(&photo, &source, "migu").await.unwrap();
        assert_eq!(fast.image.dimensions(), (200, 280));
        assert_eq!(refined.image.dimensions(), (200, 280));
        assert_eq!(refined.key.avatar_mode, AvatarMode::Off);
        assert_ne!(*fast.image, *refined.image);
    }

    #[tokio::test]
    async fn test_refined_composite_is_cached() {
        let assets = asset_dir();
        let p = pipeline(&assets, None, Duration::ZERO);
        let photo = photo();
        let source = SourceKey::of_image(&photo);
        let first = p.compose_refined(&photo, &source, "liya").await.unwrap();
        let second = p.compose_refined(&photo, &source, "liya").await.unwrap();
        assert!(Arc::ptr_eq(&first.image, &second.image));

        p.reset();
        let third = p.compose_refined(&photo, &source, "liya").await.unwrap();
        assert!(!Arc::ptr_eq(&first.image, &third.image));
        assert_eq!(*first.image, *third.image);
    }

    /// Keeps the inner half of whatever crop it is given, or fails.
    struct HalfMatte(bool);

    impl cameo_core::Matting for HalfMatte {
        fn name(&self) -> &'static str {
            "half"
        }
        fn matte(
            &self,
            image: &RgbaImage,
            _: &cameo_core::detector::Budget,
        ) -> Result<image::GrayImage, cameo_core::DetectorError> {
            if !self.0 {
                return Err(cameo_core::DetectorError::InferenceFailed("no person".into()));
            }
            let (w, h) = image.dimensions();
            Ok(image::GrayImage::from_fn(w, h, |x, y| {
                let inside = x > w / 4 && x < w * 3 / 4 && y > h / 4 && y < h * 3 / 4;
                image::Luma([if inside { 255 } else { 0 }])
            }))
        }
    }

    #[tokio::test]
    async fn test_segmented_cutout_with_mask_fallback() {
        let assets = asset_dir();
        let photo = photo();
        let source = SourceKey::of_image(&photo);

        let plain = pipeline(&assets, None, Duration::ZERO);
        let masked = plain.cutout(&photo, &source, "migu").await;
        assert_eq!(masked.kind, CutoutKind::Ellipse);

        let segmented = pipeline(&assets, None, Duration::ZERO)
            .with_segmenter(Segmenter::new(HalfMatte(true), Duration::from_secs(2)));
        let cutout = segmented.cutout(&photo, &source, "migu").await;
        assert_eq!(cutout.kind, CutoutKind::Segmented);
        assert!(cutout.size < masked.size);
        assert!(segmented.compose_refined(&photo, &source, "migu").await.is_ok());

        let failing = pipeline(&assets, None, Duration::ZERO)
            .with_segmenter(Segmenter::new(HalfMatte(false), Duration::from_secs(2)));
        let cutout = failing.cutout(&photo, &source, "migu").await;
        assert_eq!(cutout.kind, CutoutKind::Ellipse);
        assert_eq!(cutout.image, masked.image);
    }

    #[tokio::test]
    async fn test_missing_template_is_asset_error() {
        let empty = tempfile::tempdir().unwrap();
        let p = pipeline(&empty, None, Duration::ZERO);
        let photo = photo();
        let err = p
            .compose_fast(&photo, &SourceKey::of_image(&photo), "migu")
            .unwrap_err();
        assert!(matches!(err, PipelineError::AssetLoadFailed(_)));
    }

    #[tokio::test]
    async fn test_mandatory_avatar_failure_retries_once() {
        let assets = asset_dir();
        let server = MockServer::start().await;
        let avatar = failing_avatar(&server).await;
        let p = pipeline(&assets, Some(avatar), Duration::from_millis(50));
        let photo = photo();
        let retries = AtomicUsize::new(0);

        let started = std::time::Instant::now();
        let err = p
            .compose_with_retry(&photo, &SourceKey::of_image(&photo), "migu", |_| {
                retries.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RemoteTaskFailed(_)));
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(50));

        // Two pipeline runs, one task each.
        let created = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "POST")
            .count();
        assert_eq!(created, 2);
    }

    #[tokio::test]
    async fn test_fallback_composite_is_not_served_once_avatar_is_ready() {
        let assets = asset_dir();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "bad" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "good" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "failed" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "output": [{ "content": [{
                    "type": "output_file",
                    "fileUrl": format!("{}/avatar.png", server.uri())
                }]}]
            })))
            .mount(&server)
            .await;
        let avatar_png = encode_png(&RgbaImage::from_pixel(24, 24, Rgba([220, 40, 40, 255]))).unwrap();
        Mock::given(method("GET"))
            .and(path("/avatar.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(avatar_png))
            .mount(&server)
            .await;

        let mut api = ApiConfig::new("k");
        api.base_url = server.uri();
        let mut settings = AvatarSettings::new(api);
        settings.submit_wait = Duration::from_millis(200);
        settings.submit_backoff = quick();
        settings.follow_up_backoff = quick();
        let avatar = Arc::new(Avatarizer::new(settings).unwrap());
        let mut p = pipeline(&assets, Some(Arc::clone(&avatar)), Duration::ZERO);
        p.options.avatar_mandatory = false;
        let photo = photo();
        let source = SourceKey::of_image(&photo);

        let raw = p.compose_refined(&photo, &source, "migu").await.unwrap();
        assert_eq!(raw.key.avatar_mode, AvatarMode::Off);

        // The avatar for this cutout completes outside the pipeline.
        let cutout = p.cutout(&photo, &source, "migu").await;
        let face = DataUri::encode("image/png", &encode_png(&cutout.image).unwrap());
        avatar.submit(&face, None, None).await.unwrap();
        assert!(avatar.has_completed(&face));

        let styled = p.compose_refined(&photo, &source, "migu").await.unwrap();
        assert_eq!(styled.key.avatar_mode, AvatarMode::Stylized);
        assert!(!Arc::ptr_eq(&raw.image, &styled.image));
        assert_ne!(*raw.image, *styled.image);

        let again = p.compose_refined(&photo, &source, "migu").await.unwrap();
        assert!(Arc::ptr_eq(&styled.image, &again.image));
    }

    #[tokio::test]
    async fn test_optional_avatar_failure_falls_back_to_cutout() {
        let assets = asset_dir();
        let server = MockServer::start().await;
        let avatar = failing_avatar(&server).await;
        let mut p = pipeline(&assets, Some(avatar), Duration::ZERO);
        p.options.avatar_mandatory = false;
        let photo = photo();
        let result = p
            .compose_refined(&photo, &SourceKey::of_image(&photo), "migu")
            .await
            .unwrap();
        assert_eq!(result.key.avatar_mode, AvatarMode::Off);
        assert_eq!(result.image.dimensions(), (200, 280));
    }
}
