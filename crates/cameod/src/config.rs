use std::path::PathBuf;
use std::time::Duration;

use cameo_avatar::{ApiConfig, AvatarSettings, DEFAULT_PROMPT};
use cameo_core::catalog::{CatalogError, CharacterCatalog};
use cameo_core::raster::WORKING_MAX_DIM;
use cameo_core::{ModelPaths, StageTimeouts};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:8787).
    pub listen_addr: String,
    /// Directory holding character templates and print assets.
    pub asset_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Character catalog override; the embedded catalog is used when unset.
    pub characters_file: Option<PathBuf>,
    /// Longest edge of the detection/cutout working copy.
    pub working_max_dim: u32,
    pub box_timeout: Duration,
    pub landmark_timeout: Duration,
    pub mesh_timeout: Duration,
    /// Matte detected faces with the portrait model when it is installed.
    pub segment_enabled: bool,
    pub segment_timeout: Duration,
    /// Feature switch for remote avatarization.
    pub avatar_enabled: bool,
    /// When set, a failed avatarization never falls back to the raw cutout.
    pub avatar_mandatory: bool,
    pub avatar_api_key: Option<String>,
    pub avatar_base_url: String,
    /// Attach faces inline instead of using the upload flow.
    pub avatar_use_file_data: bool,
    pub avatar_prompt: String,
    pub avatar_prompt_version: u32,
    pub avatar_agent_profile: String,
    /// Per-request limit for the avatar API, including downloads.
    pub avatar_request_timeout: Duration,
    /// Delay before the one retry when a mandatory avatar could not be produced.
    pub retry_delay: Duration,
}

impl Config {
    /// Load configuration from `CAMEO_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            listen_addr: var("CAMEO_LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8787".to_string()),
            asset_dir: var("CAMEO_ASSET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./assets")),
            model_dir: var("CAMEO_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(cameo_core::default_model_dir),
            characters_file: var("CAMEO_CHARACTERS_FILE").map(PathBuf::from),
            working_max_dim: env_u32(&var, "CAMEO_WORKING_MAX_DIM", WORKING_MAX_DIM),
            box_timeout: env_millis(&var, "CAMEO_BOX_TIMEOUT_MS", 1200),
            landmark_timeout: env_millis(&var, "CAMEO_LANDMARK_TIMEOUT_MS", 1800),
            mesh_timeout: env_millis(&var, "CAMEO_MESH_TIMEOUT_MS", 2500),
            segment_enabled: env_flag(&var, "CAMEO_SEGMENT_ENABLED", true),
            segment_timeout: env_millis(&var, "CAMEO_SEGMENT_TIMEOUT_MS", 2500),
            avatar_enabled: env_flag(&var, "CAMEO_AVATAR_ENABLED", false),
            avatar_mandatory: env_flag(&var, "CAMEO_AVATAR_MANDATORY", true),
            avatar_api_key: var("CAMEO_AVATAR_API_KEY"),
            avatar_base_url: var("CAMEO_AVATAR_BASE_URL")
                .unwrap_or_else(|| cameo_avatar::client::DEFAULT_BASE_URL.to_string()),
            avatar_use_file_data: env_flag(&var, "CAMEO_AVATAR_USE_FILEDATA", true),
            avatar_prompt: var("CAMEO_AVATAR_PROMPT").unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            avatar_prompt_version: env_u32(&var, "CAMEO_AVATAR_PROMPT_VERSION", 1),
            avatar_agent_profile: var("CAMEO_AVATAR_AGENT_PROFILE")
                .unwrap_or_else(|| cameo_avatar::client::DEFAULT_AGENT_PROFILE.to_string()),
            avatar_request_timeout: env_millis(&var, "CAMEO_AVATAR_REQUEST_TIMEOUT_MS", 30_000),
            retry_delay: env_millis(&var, "CAMEO_RETRY_DELAY_MS", 1500),
        }
    }

    /// Avatarization is used by the pipeline only when switched on and a key is present.
    pub fn avatar_active(&self) -> bool {
        self.avatar_enabled && self.avatar_api_key.is_some()
    }

    /// Client settings, available whenever an API key is configured.
    pub fn avatar_settings(&self) -> Option<AvatarSettings> {
        let key = self.avatar_api_key.clone()?;
        let api = ApiConfig {
            base_url: self.avatar_base_url.clone(),
            api_key: key,
            agent_profile: self.avatar_agent_profile.clone(),
            use_file_data: self.avatar_use_file_data,
            request_timeout: self.avatar_request_timeout,
            connect_timeout: cameo_avatar::client::DEFAULT_CONNECT_TIMEOUT,
        };
        let mut settings = AvatarSettings::new(api);
        settings.prompt = self.avatar_prompt.clone();
        settings.prompt_version = self.avatar_prompt_version;
        Some(settings)
    }

    pub fn model_paths(&self) -> ModelPaths {
        let mut paths = ModelPaths::in_dir(&self.model_dir);
        if !self.segment_enabled {
            paths.segmentation = None;
        }
        paths
    }

    pub fn stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            mesh: self.mesh_timeout,
            landmarks: self.landmark_timeout,
            bounding_box: self.box_timeout,
        }
    }

    pub fn load_catalog(&self) -> Result<CharacterCatalog, CatalogError> {
        match &self.characters_file {
            Some(path) => CharacterCatalog::load(path),
            None => CharacterCatalog::embedded(),
        }
    }
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_u64(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_millis(env_u64(var, key, default))
}

/// `0` and `false` switch a flag off; any other value switches it on.
fn env_flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key)
        .map(|v| {
            let v = v.trim();
            v != "0" && !v.eq_ignore_ascii_case("false")
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.listen_addr, "127.0.0.1:8787");
        assert_eq!(c.asset_dir, PathBuf::from("./assets"));
        assert_eq!(c.working_max_dim, 512);
        assert_eq!(c.box_timeout, Duration::from_millis(1200));
        assert_eq!(c.landmark_timeout, Duration::from_millis(1800));
        assert_eq!(c.mesh_timeout, Duration::from_millis(2500));
        assert_eq!(c.segment_timeout, Duration::from_millis(2500));
        assert!(c.model_paths().segmentation.is_some());
        assert!(!c.avatar_enabled);
        assert!(c.avatar_mandatory);
        assert!(c.avatar_use_file_data);
        assert_eq!(c.avatar_prompt, DEFAULT_PROMPT);
        assert_eq!(c.retry_delay, Duration::from_millis(1500));
        assert_eq!(c.avatar_request_timeout, Duration::from_secs(30));
        assert!(c.avatar_settings().is_none());
        assert!(!c.avatar_active());
    }

    #[test]
    fn test_avatar_needs_flag_and_key() {
        let enabled_no_key = config(&[("CAMEO_AVATAR_ENABLED", "1")]);
        assert!(!enabled_no_key.avatar_active());

        let key_only = config(&[("CAMEO_AVATAR_API_KEY", "k")]);
        assert!(!key_only.avatar_active());
        assert!(key_only.avatar_settings().is_some());

        let both = config(&[
            ("CAMEO_AVATAR_ENABLED", "true"),
            ("CAMEO_AVATAR_API_KEY", "k"),
            ("CAMEO_AVATAR_USE_FILEDATA", "false"),
            ("CAMEO_AVATAR_PROMPT_VERSION", "3"),
            ("CAMEO_AVATAR_REQUEST_TIMEOUT_MS", "4000"),
        ]);
        assert!(both.avatar_active());
        let settings = both.avatar_settings().unwrap();
        assert!(!settings.api.use_file_data);
        assert_eq!(settings.prompt_version, 3);
        assert_eq!(settings.api.request_timeout, Duration::from_secs(4));
        assert_eq!(settings.api.agent_profile, "manus-1.6");
    }

    #[test]
    fn test_unparseable_numbers_fall_back() {
        let c = config(&[("CAMEO_WORKING_MAX_DIM", "huge"), ("CAMEO_BOX_TIMEOUT_MS", "900")]);
        assert_eq!(c.working_max_dim, 512);
        assert_eq!(c.stage_timeouts().bounding_box, Duration::from_millis(900));
    }

    #[test]
    fn test_segmentation_can_be_switched_off() {
        let c = config(&[
            ("CAMEO_MODEL_DIR", "/opt/cameo/models"),
            ("CAMEO_SEGMENT_ENABLED", "0"),
            ("CAMEO_SEGMENT_TIMEOUT_MS", "800"),
        ]);
        let paths = c.model_paths();
        assert!(paths.segmentation.is_none());
        assert_eq!(paths.scrfd, Some(PathBuf::from("/opt/cameo/models/det_10g.onnx")));
        assert_eq!(c.segment_timeout, Duration::from_millis(800));
    }

    #[test]
    fn test_catalog_embedded_by_default() {
        let catalog = config(&[]).load_catalog().unwrap();
        assert!(catalog.contains("migu"));
    }
}
